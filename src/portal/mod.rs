//! Portal client/server: a TLS+mux tunnel that authenticates
//! each requested mapping against a token table instead of trusting
//! whatever the dialer asks for.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::PortalClient;
pub use protocol::{Handshake, HandshakeReply};
pub use server::PortalServer;
