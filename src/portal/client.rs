//! Portal client: maintains one TLS+mux session to a portal
//! server and, for each configured [`PortMapping`], listens locally and
//! opens a mux stream per accepted connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::config::PortMapping;
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;
use crate::mux::MuxSession;

use super::protocol::{read_frame, write_frame, Handshake, HandshakeReply};

const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RETRIES: u32 = 10;

pub struct PortalClient {
    addr: SocketAddr,
    server_name: String,
    token: String,
    tls_config: Arc<rustls::ClientConfig>,
    session: Mutex<Option<MuxSession>>,
    lifecycle: Lifecycle,
    retry_interval: Duration,
    max_retries: u32,
}

impl PortalClient {
    pub fn new(addr: SocketAddr, server_name: impl Into<String>, token: impl Into<String>, tls_config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            addr,
            server_name: server_name.into(),
            token: token.into(),
            tls_config,
            session: Mutex::new(None),
            lifecycle: Lifecycle::new(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    async fn ensure_session(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match MuxSession::connect(self.addr, &self.server_name, self.tls_config.clone()).await {
                Ok(session) => {
                    *guard = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    tracing::warn!(attempt, error = %e, "portal client reconnect attempt failed");
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Bind `mapping.local_addr` and forward every accepted connection to
    /// `mapping.remote_host:mapping.remote_port` through the portal.
    pub async fn start_mapping(self: &Arc<Self>, mapping: PortMapping) -> Result<()> {
        if !mapping.enabled {
            return Ok(());
        }

        let listener = TcpListener::bind(&mapping.local_addr).await.map_err(|e| CoreError::Bind {
            addr: mapping.local_addr.clone(),
            message: e.to_string(),
        })?;
        tracing::info!(local = %mapping.local_addr, remote = %mapping.remote_host, "portal mapping started");

        let token = self.lifecycle.child_token();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((tcp, peer)) => {
                                let this = this.clone();
                                let mapping = mapping.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = this.handle_connection(tcp, &mapping).await {
                                        tracing::debug!(%peer, error = %e, "portal mapping connection ended with error");
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "portal mapping accept failed");
                                break;
                            }
                        }
                    }
                }
            }
        });
        self.lifecycle.track(handle).await;
        Ok(())
    }

    async fn handle_connection(&self, mut local: TcpStream, mapping: &PortMapping) -> Result<()> {
        self.ensure_session().await?;

        let mut stream = {
            let mut guard = self.session.lock().await;
            let session = guard.as_mut().ok_or(CoreError::MuxSession("no session".into()))?;
            match session.open_stream().await {
                Ok(stream) => stream,
                Err(e) => {
                    // The session is dead; drop it so the next call redials
                    // instead of repeatedly failing against the same session.
                    *guard = None;
                    return Err(e);
                }
            }
        };

        let handshake = Handshake {
            token: self.token.clone(),
            remote_host: mapping.remote_host.clone(),
            remote_port: mapping.remote_port,
        };
        write_frame(&mut stream, &handshake).await?;
        let reply: HandshakeReply = read_frame(&mut stream).await?;
        if !reply.success {
            return Err(CoreError::Denied(reply.error.unwrap_or_default()));
        }

        let (mut sr, mut sw) = tokio::io::split(stream);
        let (mut lr, mut lw) = local.split();

        tokio::select! {
            r = tokio::io::copy(&mut sr, &mut lw) => { r?; }
            r = tokio::io::copy(&mut lr, &mut sw) => { r?; }
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
        self.session.lock().await.take();
    }
}
