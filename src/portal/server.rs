//! Portal server: accepts TLS+mux sessions, authenticates each
//! stream against the token table, and bridges it to the requested local
//! target if the token's allow-list permits.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use crate::config::{host_allowed, ConfigRepository};
use crate::error::{CoreError, Result};
use crate::lifecycle::Lifecycle;
use crate::mux::MuxSession;

use super::protocol::{read_frame, write_frame, Handshake, HandshakeReply};

pub struct PortalServer {
    config: Arc<dyn ConfigRepository>,
    acceptor: TlsAcceptor,
    lifecycle: Lifecycle,
}

impl PortalServer {
    pub fn new(config: Arc<dyn ConfigRepository>, tls_config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            config,
            acceptor: TlsAcceptor::from(tls_config),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Bind `addr` and serve portal sessions until [`PortalServer::shutdown`]
    /// is called.
    pub async fn listen(self: Arc<Self>, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr).await.map_err(|e| CoreError::Bind {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        tracing::info!(%addr, "portal server listening");

        let token = self.lifecycle.child_token();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let this = self.clone();
                            let handle = tokio::spawn(async move { this.serve_session(tcp, peer).await });
                            self.lifecycle.track(handle).await;
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "portal accept failed");
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn serve_session(self: Arc<Self>, tcp: TcpStream, peer: std::net::SocketAddr) {
        let mut session = match MuxSession::accept(tcp, self.acceptor.clone()).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "portal session handshake failed");
                return;
            }
        };

        loop {
            let stream = match session.accept_stream().await {
                Ok(s) => s,
                Err(_) => break,
            };
            let this = self.clone();
            tokio::spawn(async move { this.serve_stream(stream).await });
        }
    }

    async fn serve_stream(&self, mut stream: tokio_yamux::stream::StreamHandle) {
        let handshake: Handshake = match read_frame(&mut stream).await {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "portal stream handshake read failed");
                return;
            }
        };

        if let Err(reason) = self.authorize(&handshake) {
            let _ = write_frame(&mut stream, &HandshakeReply::denied(reason.to_string())).await;
            return;
        }

        let target = match TcpStream::connect((handshake.remote_host.as_str(), handshake.remote_port)).await {
            Ok(t) => t,
            Err(e) => {
                let _ = write_frame(&mut stream, &HandshakeReply::denied(format!("dial failed: {e}"))).await;
                return;
            }
        };

        if write_frame(&mut stream, &HandshakeReply::ok()).await.is_err() {
            return;
        }

        if let Err(e) = pipe(stream, target).await {
            tracing::debug!(error = %e, "portal stream ended with error");
        }
    }

    fn authorize(&self, handshake: &Handshake) -> std::result::Result<(), &'static str> {
        let entry = self
            .config
            .resolve_token(&handshake.token)
            .ok_or("unknown token")?;
        if !host_allowed(&entry, &handshake.remote_host) {
            return Err("target not in allow-list");
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.lifecycle.shutdown().await;
    }
}

async fn pipe(stream: tokio_yamux::stream::StreamHandle, mut target: TcpStream) -> Result<()> {
    let (mut sr, mut sw) = tokio::io::split(stream);
    let (mut tr, mut tw) = target.split();

    let client_to_target = tokio::io::copy(&mut sr, &mut tw);
    let target_to_client = tokio::io::copy(&mut tr, &mut sw);

    tokio::select! {
        r = client_to_target => { r?; }
        r = target_to_client => { r?; }
    }
    Ok(())
}
