//! Caller identity and opaque-credential verification.
//!
//! The gateway never implements login itself; it consumes an identity
//! service that maps an opaque credential (cookie value or bearer token)
//! to a platform identity. `StaticTokenVerifier` is the file-backed
//! implementation used in deployments where the identity service exports
//! its session table.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{GatewayError, GatewayResult};

/// A platform caller: the user and the organization they act for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub org: String,
}

impl Identity {
    pub fn new(user: impl Into<String>, org: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            org: org.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.org)
    }
}

/// Verifies an opaque session credential and returns the caller identity.
///
/// Callable from both the HTTP minting path and the WebSocket upgrade path.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> GatewayResult<Identity>;
}

#[derive(Debug, Default, Deserialize)]
struct TokenFile {
    #[serde(default)]
    tokens: HashMap<String, Identity>,
}

/// Static token table loaded from TOML:
///
/// ```toml
/// [tokens]
/// "k7f0..." = { user = "alice", org = "acme" }
/// ```
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    /// Load the token table. A missing file yields an empty table, which
    /// denies every credential.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("Token table {} not found, denying all callers", path.display());
            return Ok(Self {
                tokens: HashMap::new(),
            });
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read token table: {}", path.display()))?;
        let file: TokenFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse token table: {}", path.display()))?;

        info!("Loaded {} token(s) from {}", file.tokens.len(), path.display());
        Ok(Self {
            tokens: file.tokens,
        })
    }

    #[cfg(test)]
    pub fn from_entries(entries: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: entries.into_iter().collect(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> GatewayResult<Identity> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(GatewayError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_known_token() {
        let verifier = StaticTokenVerifier::from_entries([(
            "tok-1".to_string(),
            Identity::new("alice", "acme"),
        )]);

        let identity = verifier.verify("tok-1").unwrap();
        assert_eq!(identity, Identity::new("alice", "acme"));
    }

    #[test]
    fn test_verify_unknown_token_fails_closed() {
        let verifier = StaticTokenVerifier::from_entries([]);
        assert!(matches!(
            verifier.verify("anything"),
            Err(GatewayError::Unauthenticated)
        ));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::new("bob", "acme").to_string(), "bob@acme");
    }
}
