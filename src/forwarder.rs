//! Port forwarder: binds a local TCP listener and, for each
//! accepted connection, opens a `direct-tcpip` channel through a [`Chain`]
//! and copies bytes in both directions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use russh::ChannelMsg;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::chain::Chain;
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;

const COPY_BUFFER: usize = 8192;

#[derive(Debug, Default, Clone)]
pub struct TrafficCounter {
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
}

impl TrafficCounter {
    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn stats(&self) -> (u64, u64) {
        (
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_received.load(Ordering::Relaxed),
        )
    }
}

/// Count of connections currently being piped, separate from the lifetime
/// byte totals in [`TrafficCounter`].
#[derive(Debug, Default, Clone)]
pub struct ConnectionCounter {
    active: Arc<AtomicU64>,
}

impl ConnectionCounter {
    fn enter(&self) -> ActiveConnectionGuard {
        self.active.fetch_add(1, Ordering::Relaxed);
        ActiveConnectionGuard {
            active: self.active.clone(),
        }
    }

    pub fn get(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }
}

/// Decrements the active-connection count on drop, so it settles back to 0
/// whether `pipe_connection` returns normally, errors, or is cancelled.
struct ActiveConnectionGuard {
    active: Arc<AtomicU64>,
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A running local-port-forwarding listener. Dropping does not stop it;
/// call [`Forwarder::stop`] for the ordered close-outside-in teardown: close
/// the listener first so no new connections are accepted, then cancel
/// in-flight connection tasks.
pub struct Forwarder {
    chain: Arc<Chain>,
    remote_host: String,
    remote_port: u16,
    local_addr: std::net::SocketAddr,
    traffic: TrafficCounter,
    connections: ConnectionCounter,
    lifecycle: Lifecycle,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Forwarder {
    /// Bind `bind_addr` and begin forwarding every accepted connection to
    /// `remote_host:remote_port` over `chain`.
    pub async fn start(
        chain: Arc<Chain>,
        bind_addr: &str,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Result<Self> {
        let remote_host = remote_host.into();
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                CoreError::Bind {
                    addr: bind_addr.to_string(),
                    message: "address already in use".into(),
                }
            } else {
                CoreError::Bind {
                    addr: bind_addr.to_string(),
                    message: e.to_string(),
                }
            }
        })?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, remote = %remote_host, remote_port, "forwarder listening");

        let lifecycle = Lifecycle::new();
        let traffic = TrafficCounter::default();
        let connections = ConnectionCounter::default();

        let accept_task = {
            let chain = chain.clone();
            let remote_host = remote_host.clone();
            let traffic = traffic.clone();
            let connections = connections.clone();
            let token = lifecycle.child_token();
            let lifecycle_for_children = lifecycle.clone();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, peer)) => {
                                    tracing::debug!(%peer, "forwarder accepted connection");
                                    let chain = chain.clone();
                                    let remote_host = remote_host.clone();
                                    let traffic = traffic.clone();
                                    let connections = connections.clone();
                                    let child_token = lifecycle_for_children.child_token();
                                    let handle = tokio::spawn(async move {
                                        let _guard = connections.enter();
                                        if let Err(e) =
                                            pipe_connection(&chain, stream, &remote_host, remote_port, traffic, child_token)
                                                .await
                                        {
                                            tracing::warn!(%peer, error = %e, "forwarder connection ended with error");
                                        }
                                    });
                                    lifecycle_for_children.track(handle).await;
                                }
                                Err(e) => {
                                    tracing::error!(error = %e, "forwarder accept failed");
                                    break;
                                }
                            }
                        }
                    }
                }
            })
        };

        Ok(Self {
            chain,
            remote_host,
            remote_port,
            local_addr,
            traffic,
            connections,
            lifecycle,
            accept_task: tokio::sync::Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn remote(&self) -> (&str, u16) {
        (&self.remote_host, self.remote_port)
    }

    pub fn traffic(&self) -> TrafficCounter {
        self.traffic.clone()
    }

    /// Number of connections currently being piped. Settles back to 0 once
    /// every in-flight connection has ended.
    pub fn connection_count(&self) -> u64 {
        self.connections.get()
    }

    pub fn chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    /// Stop accepting new connections, then cancel and wait for every
    /// in-flight connection task. Idempotent.
    pub async fn stop(&self) {
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        self.lifecycle.shutdown().await;
    }
}

async fn pipe_connection(
    chain: &Chain,
    mut local: TcpStream,
    remote_host: &str,
    remote_port: u16,
    traffic: TrafficCounter,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let mut channel = chain.dial(remote_host, remote_port).await?;

    let (mut local_read, mut local_write) = local.split();
    let mut buf = vec![0u8; COPY_BUFFER];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = local_read.read(&mut buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        channel.data(&buf[..n]).await.map_err(|e| CoreError::MuxSession(e.to_string()))?;
                        traffic.add_sent(n as u64);
                    }
                    Err(_) => break,
                }
            }
            message = channel.wait() => {
                match message {
                    Some(ChannelMsg::Data { data }) => {
                        local_write.write_all(&data).await?;
                        traffic.add_received(data.len() as u64);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                    _ => {}
                }
            }
        }
    }

    let _ = channel.eof().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::{accept_all_policy, AuthMaterial};
    use crate::hop::Hop;

    fn unconnected_chain() -> Arc<Chain> {
        let hop = Hop::new(
            "a",
            "a",
            "198.51.100.1",
            22,
            "user",
            AuthMaterial::Password {
                secret: "x".into(),
            },
        );
        Arc::new(Chain::new(vec![hop], accept_all_policy()).unwrap())
    }

    #[tokio::test]
    async fn binds_an_ephemeral_port() {
        let chain = unconnected_chain();
        let forwarder = Forwarder::start(chain, "127.0.0.1:0", "internal.test", 80)
            .await
            .unwrap();
        assert_ne!(forwarder.local_addr().port(), 0);
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn connection_count_starts_at_zero() {
        let chain = unconnected_chain();
        let forwarder = Forwarder::start(chain, "127.0.0.1:0", "internal.test", 80)
            .await
            .unwrap();
        assert_eq!(forwarder.connection_count(), 0);
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn connection_count_settles_back_to_zero_after_a_failed_dial() {
        let chain = unconnected_chain();
        let forwarder = Forwarder::start(chain, "127.0.0.1:0", "internal.test", 80)
            .await
            .unwrap();
        let addr = forwarder.local_addr();
        let _ = TcpStream::connect(addr).await.unwrap();

        for _ in 0..50 {
            if forwarder.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(forwarder.connection_count(), 0);
        forwarder.stop().await;
    }

    #[tokio::test]
    async fn rejects_duplicate_bind() {
        let chain = unconnected_chain();
        let first = Forwarder::start(chain.clone(), "127.0.0.1:0", "internal.test", 80)
            .await
            .unwrap();
        let addr = format!("127.0.0.1:{}", first.local_addr().port());
        let err = Forwarder::start(chain, &addr, "internal.test", 80)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bind");
        first.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let chain = unconnected_chain();
        let forwarder = Forwarder::start(chain, "127.0.0.1:0", "internal.test", 80)
            .await
            .unwrap();
        forwarder.stop().await;
        forwarder.stop().await;
    }
}
