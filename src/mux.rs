//! Stream-mux transport: wraps a TLS-terminated TCP connection
//! in a yamux session so the portal can carry many independent tunnels over
//! one socket, each its own multiplexed stream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_yamux::{config::Config as YamuxConfig, session::Session, stream::StreamHandle};

use crate::error::{CoreError, Result};

const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(40);
const STREAM_WINDOW: u32 = 64 * 1024;

fn yamux_config() -> YamuxConfig {
    let mut config = YamuxConfig::default();
    config.max_stream_window_size = STREAM_WINDOW;
    config.connection_write_timeout = KEEPALIVE_TIMEOUT;
    config
}

/// A TLS+yamux session over a single TCP connection. `open_stream` (client
/// role) and `accept_stream` (server role) both yield a [`StreamHandle`]
/// that implements `AsyncRead + AsyncWrite`.
pub struct MuxSession {
    session: Session<tokio_rustls::TlsStream<TcpStream>>,
}

impl MuxSession {
    /// Client role: connect, run the TLS handshake against `server_name`,
    /// then start the yamux client session.
    pub async fn connect(
        addr: SocketAddr,
        server_name: &str,
        tls_config: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect(addr)
            .await
            .map_err(|e| CoreError::dial_target(server_name, addr.port(), e))?;
        tcp.set_nodelay(true).ok();

        let connector = TlsConnector::from(tls_config);
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| CoreError::MuxSession(format!("invalid server name {server_name}: {e}")))?;
        let tls = connector
            .connect(name, tcp)
            .await
            .map_err(|e| CoreError::MuxSession(format!("tls handshake failed: {e}")))?;

        let session = Session::new_client(tokio_rustls::TlsStream::Client(tls), yamux_config());
        Ok(Self { session })
    }

    /// Server role: run the TLS handshake on an already-accepted TCP
    /// connection, then start the yamux server session.
    pub async fn accept(tcp: TcpStream, acceptor: TlsAcceptor) -> Result<Self> {
        tcp.set_nodelay(true).ok();
        let tls = acceptor
            .accept(tcp)
            .await
            .map_err(|e| CoreError::MuxSession(format!("tls handshake failed: {e}")))?;

        let session = Session::new_server(tokio_rustls::TlsStream::Server(tls), yamux_config());
        Ok(Self { session })
    }

    /// Open a new multiplexed stream (client side opens a stream per portal
    /// mapping request).
    pub async fn open_stream(&mut self) -> Result<StreamHandle> {
        self.session
            .open_stream()
            .map_err(|e| CoreError::MuxSession(e.to_string()))
    }

    /// Accept the next incoming stream (server side accepts one stream per
    /// client-initiated mapping request).
    pub async fn accept_stream(&mut self) -> Result<StreamHandle> {
        use futures::StreamExt;
        self.session
            .next()
            .await
            .ok_or_else(|| CoreError::MuxSession("session closed".into()))?
            .map_err(|e| CoreError::MuxSession(e.to_string()))
    }
}

/// Load a server TLS identity from PEM cert+key files.
pub fn load_server_tls(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Arc<rustls::ServerConfig>> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| CoreError::MuxSession(format!("invalid TLS identity: {e}")))?;

    Ok(Arc::new(config))
}

/// Client TLS config trusting the platform/webpki root store. Callers that
/// need to pin a private CA build their own `rustls::ClientConfig` instead.
pub fn default_client_tls() -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Arc::new(config)
}

fn load_certs(path: &std::path::Path) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let data = std::fs::read(path)?;
    rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CoreError::MuxSession(format!("failed to parse certs: {e}")))
}

fn load_private_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let data = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|e| CoreError::MuxSession(format!("failed to parse key: {e}")))?
        .ok_or_else(|| CoreError::MuxSession("no private key found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yamux_config_matches_documented_defaults() {
        let config = yamux_config();
        assert_eq!(config.max_stream_window_size, STREAM_WINDOW);
        assert_eq!(config.connection_write_timeout, KEEPALIVE_TIMEOUT);
    }

    #[test]
    fn default_client_tls_builds() {
        let _config = default_client_tls();
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = MuxSession::connect(addr, "localhost", default_client_tls())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DialTarget { .. }));
    }
}
