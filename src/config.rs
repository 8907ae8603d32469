//! The read-only configuration surface the core consumes. Loading and
//! persisting this data is left to the host; this module only defines the
//! shape the host hands in, plus an in-memory implementation used by tests
//! and small embedders that don't need a real store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::hop::Hop;

/// A declarative portal mapping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMapping {
    pub id: String,
    pub name: String,
    pub local_addr: String,
    pub remote_host: String,
    pub remote_port: u16,
    /// Ordered hop ids the tunnel to `remote_host:remote_port` passes
    /// through. Informational for the portal: the mux transport itself is
    /// a single hop from the client's perspective.
    pub via: Vec<String>,
    pub protocol: MappingProtocol,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingProtocol {
    Tcp,
    Http,
    WebSocket,
}

/// A portal server token-table entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    /// Allowed remote targets: literal `host` strings or CIDR blocks.
    pub allow_list: Vec<String>,
    /// Advisory only, not enforced by the core.
    pub max_mappings: Option<u32>,
}

/// Read-only snapshot the core consumes. Implementors typically back this
/// with a file-backed store, a database, or (for tests) the in-memory
/// [`StaticConfig`] below.
pub trait ConfigRepository: Send + Sync {
    fn resolve_hop(&self, id_or_name: &str) -> Result<Hop>;
    fn all_hops(&self) -> Vec<Hop>;
    fn all_mappings(&self) -> Vec<PortMapping>;
    fn resolve_token(&self, token: &str) -> Option<TokenEntry>;
}

/// A fixed, in-memory [`ConfigRepository`] for tests and small
/// embedders to reach for instead of a real persistence layer.
#[derive(Debug, Default, Clone)]
pub struct StaticConfig {
    hops: HashMap<String, Hop>,
    mappings: Vec<PortMapping>,
    tokens: HashMap<String, TokenEntry>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hop(mut self, hop: Hop) -> Self {
        self.hops.insert(hop.id.clone(), hop);
        self
    }

    pub fn with_mapping(mut self, mapping: PortMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn with_token(mut self, entry: TokenEntry) -> Self {
        self.tokens.insert(entry.token.clone(), entry);
        self
    }
}

impl ConfigRepository for StaticConfig {
    fn resolve_hop(&self, id_or_name: &str) -> Result<Hop> {
        if let Some(hop) = self.hops.get(id_or_name) {
            return Ok(hop.clone());
        }
        self.hops
            .values()
            .find(|h| h.name == id_or_name)
            .cloned()
            .ok_or_else(|| CoreError::ConfigResolve(id_or_name.to_string()))
    }

    fn all_hops(&self) -> Vec<Hop> {
        self.hops.values().cloned().collect()
    }

    fn all_mappings(&self) -> Vec<PortMapping> {
        self.mappings.clone()
    }

    fn resolve_token(&self, token: &str) -> Option<TokenEntry> {
        self.tokens.get(token).cloned()
    }
}

/// Check a target host against a token's allow-list: either a literal
/// match or CIDR membership.
pub fn host_allowed(entry: &TokenEntry, remote_host: &str) -> bool {
    for allowed in &entry.allow_list {
        if allowed == remote_host {
            return true;
        }
        if let (Ok(net), Ok(ip)) = (allowed.parse::<ipnet::IpNet>(), remote_host.parse::<std::net::IpAddr>()) {
            if net.contains(&ip) {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hop::AuthMaterial;

    fn hop(id: &str) -> Hop {
        Hop::new(id, id, "h.test", 22, "u", AuthMaterial::Password { secret: "s".into() })
    }

    #[test]
    fn resolves_by_id_or_name() {
        let cfg = StaticConfig::new().with_hop(hop("a"));
        assert!(cfg.resolve_hop("a").is_ok());
        assert!(cfg.resolve_hop("missing").is_err());
    }

    #[test]
    fn host_allowed_literal_and_cidr() {
        let entry = TokenEntry {
            token: "t".into(),
            allow_list: vec!["10.0.0.0/8".into(), "db.internal".into()],
            max_mappings: None,
        };
        assert!(host_allowed(&entry, "db.internal"));
        assert!(host_allowed(&entry, "10.1.2.3"));
        assert!(!host_allowed(&entry, "8.8.8.8"));
    }
}
