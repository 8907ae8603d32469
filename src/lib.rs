//! Multi-hop SSH tunneling core: chain builder, connection pool, port
//! forwarder, PTY terminal sessions, stream-mux transport, portal
//! client/server, file transfer engine, network profiler, and the shared
//! lifecycle/cancellation primitive they're all built on.

pub mod chain;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod hop;
pub mod lifecycle;
pub mod logging;
pub mod mux;
pub mod pool;
pub mod portal;
pub mod profiler;
pub mod pty;
pub mod transfer;

pub use chain::{Chain, ChainState, ExecOutput};
pub use config::{ConfigRepository, MappingProtocol, PortMapping, StaticConfig, TokenEntry};
pub use error::{CoreError, Result};
pub use forwarder::Forwarder;
pub use hop::{AuthMaterial, Classification, Hop, HostKeyPolicy};
pub use lifecycle::Lifecycle;
pub use pool::{ConnectionPool, PoolConfig, PoolGuard};
pub use portal::{Handshake, HandshakeReply, PortalClient, PortalServer};
pub use profiler::{NetworkProfiler, ProbeReport};
pub use pty::{ClientMessage, PtySession, PtyStats, ServerMessage, TerminalTransport, WebSocketTransport};
pub use transfer::{TransferDirection, TransferEngine, TransferProgress, TransferState};
