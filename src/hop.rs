//! Hop data model and the per-hop authentication/host-key policy types.

use std::path::PathBuf;
use std::sync::Arc;

use russh::keys::PublicKey;
use serde::{Deserialize, Serialize};

/// Authentication material for one hop. Tagged variant, not inheritance;
/// consumers dispatch on `kind` rather than a trait object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuthMaterial {
    /// Private key authentication. `path` is a filesystem path to an
    /// OpenSSH-formatted key; reading and decrypting it is this crate's
    /// job, but path expansion (e.g. `~`) is left to the caller.
    Key {
        path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        passphrase: Option<String>,
    },
    /// Password authentication. Never logged.
    Password { secret: String },
}

impl std::fmt::Display for AuthMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key { path, .. } => write!(f, "key({})", path.display()),
            Self::Password { .. } => write!(f, "password(<redacted>)"),
        }
    }
}

/// A hop's classification: internal hops must be reached via a gateway hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    External,
    Internal,
}

/// One endpoint in a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
    /// Stable, opaque, unique identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: AuthMaterial,
    pub classification: Classification,
    /// Internal hops must reference an external gateway hop's `id`.
    pub gateway_id: Option<String>,
}

impl Hop {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        auth: AuthMaterial,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            host: host.into(),
            port,
            username: username.into(),
            auth,
            classification: Classification::External,
            gateway_id: None,
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    pub fn display_name(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Validate invariants over a hop set: no self-gateway, acyclic gateway
/// graph. Does not check that referenced gateway ids resolve to hops
/// actually present in `hops` beyond what's needed for cycle detection; id
/// resolution is the config repository's job.
pub fn validate_hops(hops: &[Hop]) -> crate::error::Result<()> {
    use std::collections::HashMap;

    let by_id: HashMap<&str, &Hop> = hops.iter().map(|h| (h.id.as_str(), h)).collect();

    for hop in hops {
        if hop.classification == Classification::Internal && hop.gateway_id.is_none() {
            return Err(crate::error::CoreError::ConfigResolve(format!(
                "internal hop {} has no gateway_id",
                hop.id
            )));
        }

        if let Some(gateway_id) = &hop.gateway_id {
            if gateway_id == &hop.id {
                return Err(crate::error::CoreError::ConfigResolve(format!(
                    "hop {} references itself as gateway",
                    hop.id
                )));
            }

            // Walk the gateway chain looking for a cycle.
            let mut seen = vec![hop.id.as_str()];
            let mut current = gateway_id.as_str();
            loop {
                if seen.contains(&current) {
                    return Err(crate::error::CoreError::ConfigResolve(format!(
                        "gateway cycle detected starting at hop {}",
                        hop.id
                    )));
                }
                seen.push(current);
                match by_id.get(current).and_then(|h| h.gateway_id.as_deref()) {
                    Some(next) => current = next,
                    None => break,
                }
            }
        }
    }

    Ok(())
}

/// `(hop, presented key) -> accept?` callback. The caller supplies the
/// policy (strict known-hosts verification, lenient accept-all, or
/// anything in between); this crate only defines the interface.
pub type HostKeyPolicy = Arc<dyn Fn(&Hop, &PublicKey) -> bool + Send + Sync>;

/// A policy that accepts any presented key. Explicitly opt-in: callers
/// must construct this themselves, it is never the crate's default.
pub fn accept_all_policy() -> HostKeyPolicy {
    Arc::new(|_hop, _key| true)
}

/// A policy that checks the presented key's SHA256 fingerprint against a
/// fixed, expected value.
pub fn fingerprint_policy(expected: impl Into<String>) -> HostKeyPolicy {
    let expected = expected.into();
    Arc::new(move |_hop, key| {
        use russh::keys::ssh_key::HashAlg;
        key.fingerprint(HashAlg::Sha256).to_string() == expected
    })
}
