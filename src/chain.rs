//! Chain builder: dials a hop chain and opens each successive
//! hop's SSH session over the previous hop's `direct-tcpip` channel, so the
//! whole chain is genuine SSH-over-SSH rather than a single pooled TCP
//! tunnel.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult, Handle, Msg};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelStream};
use tokio::sync::Mutex;

use crate::error::{CoreError, Result};
use crate::hop::{AuthMaterial, Hop, HostKeyPolicy};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    Unconnected,
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

/// `client::Handler` bound to a single hop's host-key policy. One instance
/// per hop, since the policy needs to know which `Hop` it's checking.
struct ChainHandler {
    hop: Hop,
    policy: HostKeyPolicy,
}

impl client::Handler for ChainHandler {
    type Error = russh::Error;

    fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> impl std::future::Future<Output = std::result::Result<bool, Self::Error>> + Send {
        let accepted = (self.policy)(&self.hop, server_public_key);
        let hop_name = self.hop.name.clone();
        async move {
            if accepted {
                tracing::debug!(hop = %hop_name, "host key accepted");
            } else {
                tracing::warn!(hop = %hop_name, "host key rejected by policy");
            }
            Ok(accepted)
        }
    }
}

async fn authenticate(handle: &mut Handle<ChainHandler>, hop: &Hop) -> Result<()> {
    let result = match &hop.auth {
        AuthMaterial::Password { secret } => handle
            .authenticate_password(&hop.username, secret)
            .await
            .map_err(|e| CoreError::chain_build(&hop.name, e))?,
        AuthMaterial::Key { path, passphrase } => {
            let key_data = tokio::fs::read_to_string(path).await?;
            let key: PrivateKey = if let Some(pass) = passphrase {
                PrivateKey::from_openssh(key_data.trim())
                    .map_err(|e| CoreError::chain_build(&hop.name, e))?
                    .decrypt(pass.as_bytes())
                    .map_err(|e| CoreError::chain_build(&hop.name, e))?
            } else {
                PrivateKey::from_openssh(key_data.trim())
                    .map_err(|e| CoreError::chain_build(&hop.name, e))?
            };
            let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&hop.username, key_with_alg)
                .await
                .map_err(|e| CoreError::chain_build(&hop.name, e))?
        }
    };

    if !matches!(result, AuthResult::Success) {
        return Err(CoreError::AuthFailed(hop.display_name()));
    }
    Ok(())
}

fn ssh_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

async fn dial_first_hop(hop: &Hop, policy: &HostKeyPolicy) -> Result<Handle<ChainHandler>> {
    let addr = (hop.host.as_str(), hop.port);
    let handler = ChainHandler {
        hop: hop.clone(),
        policy: policy.clone(),
    };

    let mut handle = tokio::time::timeout(HANDSHAKE_TIMEOUT, client::connect(ssh_config(), addr, handler))
        .await
        .map_err(|_| CoreError::chain_build(&hop.name, "handshake timed out"))?
        .map_err(|e| CoreError::chain_build(&hop.name, e))?;

    authenticate(&mut handle, hop).await?;
    Ok(handle)
}

async fn dial_via_stream(
    hop: &Hop,
    stream: ChannelStream<Msg>,
    policy: &HostKeyPolicy,
) -> Result<Handle<ChainHandler>> {
    let handler = ChainHandler {
        hop: hop.clone(),
        policy: policy.clone(),
    };

    let mut handle = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        client::connect_stream(ssh_config(), stream, handler),
    )
    .await
    .map_err(|_| CoreError::chain_build(&hop.name, "handshake over tunnel timed out"))?
    .map_err(|e| CoreError::chain_build(&hop.name, e))?;

    authenticate(&mut handle, hop).await?;
    Ok(handle)
}

/// A connected chain of hops: `handles[0]` is the first hop, `handles.last()`
/// is the target hop whose session the caller actually wants to use.
pub struct Chain {
    hops: Vec<Hop>,
    policy: HostKeyPolicy,
    handles: Mutex<Vec<Handle<ChainHandler>>>,
    state: Mutex<ChainState>,
}

impl Chain {
    /// `hops` must be non-empty and ordered client-nearest to target-nearest.
    /// Validated with [`crate::hop::validate_hops`].
    pub fn new(hops: Vec<Hop>, policy: HostKeyPolicy) -> Result<Self> {
        if hops.is_empty() {
            return Err(CoreError::chain_build("<empty>", "chain must have at least one hop"));
        }
        crate::hop::validate_hops(&hops)?;
        Ok(Self {
            hops,
            policy,
            handles: Mutex::new(Vec::new()),
            state: Mutex::new(ChainState::Unconnected),
        })
    }

    pub async fn state(&self) -> ChainState {
        *self.state.lock().await
    }

    pub fn target(&self) -> &Hop {
        self.hops.last().expect("non-empty by construction")
    }

    /// Establish every hop in order, opening a `direct-tcpip` channel from
    /// hop N to hop N+1 and running a nested SSH handshake over it.
    pub async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == ChainState::Connected {
                return Ok(());
            }
            *state = ChainState::Connecting;
        }

        let mut established: Vec<Handle<ChainHandler>> = Vec::with_capacity(self.hops.len());
        let mut current_stream: Option<ChannelStream<Msg>> = None;

        for (i, hop) in self.hops.iter().enumerate() {
            let handle = match current_stream.take() {
                Some(stream) => dial_via_stream(hop, stream, &self.policy).await,
                None => dial_first_hop(hop, &self.policy).await,
            };

            let handle = match handle {
                Ok(h) => h,
                Err(e) => {
                    self.teardown(established).await;
                    *self.state.lock().await = ChainState::Unconnected;
                    return Err(e);
                }
            };

            if let Some(next_hop) = self.hops.get(i + 1) {
                let channel = match handle
                    .channel_open_direct_tcpip(&next_hop.host, next_hop.port as u32, "127.0.0.1", 0)
                    .await
                {
                    Ok(c) => c,
                    Err(e) => {
                        established.push(handle);
                        self.teardown(established).await;
                        *self.state.lock().await = ChainState::Unconnected;
                        return Err(CoreError::chain_build(&hop.name, e));
                    }
                };
                current_stream = Some(channel.into_stream());
            }

            established.push(handle);
        }

        *self.handles.lock().await = established;
        *self.state.lock().await = ChainState::Connected;
        Ok(())
    }

    async fn teardown(&self, handles: Vec<Handle<ChainHandler>>) {
        for handle in handles.into_iter().rev() {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }
    }

    /// Open a `direct-tcpip` channel from the target hop to `host:port`,
    /// for use by the port forwarder and network profiler.
    pub async fn dial(&self, host: &str, port: u16) -> Result<Channel<Msg>> {
        let handles = self.handles.lock().await;
        let handle = handles
            .last()
            .ok_or(CoreError::ChainClosed)?;
        handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| CoreError::dial_target(host, port, e))
    }

    /// Open a new `session` channel on the target hop, for command execution
    /// or PTY requests.
    pub async fn new_session(&self) -> Result<Channel<Msg>> {
        let handles = self.handles.lock().await;
        let handle = handles
            .last()
            .ok_or(CoreError::ChainClosed)?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| CoreError::chain_build(self.target().name.clone(), e))
    }

    /// Run a single non-interactive command on the target hop and collect
    /// its stdout/stderr/exit status.
    pub async fn execute(&self, command: &str) -> Result<ExecOutput> {
        use russh::ChannelMsg;

        let mut channel = self.new_session().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| CoreError::chain_build(self.target().name.clone(), e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        loop {
            let Some(msg) = channel.wait().await else {
                break;
            };
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }

        Ok(ExecOutput {
            exit_status: exit_status.unwrap_or(u32::MAX),
            stdout,
            stderr,
        })
    }

    /// Tear every hop down in reverse order. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state == ChainState::Closed || *state == ChainState::Unconnected {
                *state = ChainState::Closed;
                return Ok(());
            }
            *state = ChainState::Disconnecting;
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        self.teardown(handles).await;

        *self.state.lock().await = ChainState::Closed;
        Ok(())
    }
}

/// Result of [`Chain::execute`].
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_status: u32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}
