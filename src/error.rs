//! Error taxonomy for the bastion core.

use thiserror::Error;

/// All error kinds the core surfaces across its public API.
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum CoreError {
    #[error("chain: hop {hop}: {message}")]
    ChainBuild { hop: String, message: String },

    #[error("chain: operation attempted on a closed or degraded chain")]
    ChainClosed,

    #[error("pool: acquire timed out after {0:?}")]
    PoolTimeout(std::time::Duration),

    #[error("pool: exhausted for key {0}")]
    PoolExhausted(String),

    #[error("bind: failed to bind {addr}: {message}")]
    Bind { addr: String, message: String },

    #[error("dial: failed to reach {host}:{port}: {message}")]
    DialTarget {
        host: String,
        port: u16,
        message: String,
    },

    #[error("mux: session closed or failed: {0}")]
    MuxSession(String),

    #[error("auth failed: {0}")]
    AuthFailed(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("pty: request failed: {0}")]
    PtyRequest(String),

    #[error("transfer: io error: {0}")]
    TransferIo(String),

    #[error("config: could not resolve {0}")]
    ConfigResolve(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Stable, machine-checkable kind tag (used by tests and callers that
    /// need to branch on error category without matching the full enum).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ChainBuild { .. } => "chain-build",
            Self::ChainClosed => "chain-closed",
            Self::PoolTimeout(_) => "pool-timeout",
            Self::PoolExhausted(_) => "pool-exhausted",
            Self::Bind { .. } => "bind",
            Self::DialTarget { .. } => "dial-target",
            Self::MuxSession(_) => "mux-session",
            Self::AuthFailed(_) => "auth-failed",
            Self::Denied(_) => "denied",
            Self::PtyRequest(_) => "pty-request",
            Self::TransferIo(_) => "transfer-io",
            Self::ConfigResolve(_) => "config-resolve",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }

    /// Short human-readable message, safe to cross the WebSocket/portal
    /// boundary.
    pub fn user_message(&self) -> String {
        match self {
            Self::ChainBuild { hop, .. } => format!("failed to connect via hop {hop}"),
            Self::PoolTimeout(_) => "timed out waiting for a connection".to_string(),
            Self::Bind { addr, .. } => format!("could not bind {addr}"),
            Self::DialTarget { host, port, .. } => format!("could not reach {host}:{port}"),
            _ => self.to_string(),
        }
    }

    pub fn chain_build(hop: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ChainBuild {
            hop: hop.into(),
            message: message.to_string(),
        }
    }

    pub fn dial_target(host: impl Into<String>, port: u16, message: impl std::fmt::Display) -> Self {
        Self::DialTarget {
            host: host.into(),
            port,
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(CoreError::ChainClosed.kind(), "chain-closed");
        assert_eq!(
            CoreError::chain_build("gw", "boom").kind(),
            "chain-build"
        );
        assert_eq!(
            CoreError::PoolExhausted("user@host:22".into()).kind(),
            "pool-exhausted"
        );
    }

    #[test]
    fn user_message_hides_internals() {
        let err = CoreError::chain_build("gateway", "handshake failed: oh no internal detail");
        assert_eq!(err.user_message(), "failed to connect via hop gateway");
    }
}
