//! SSH public key handling and the static key access-control list.
//!
//! This module handles:
//! - Parsing OpenSSH-format public keys and computing SHA256 fingerprints
//! - The proxy-variant ACL: key fingerprint -> real identity -> granted clusters
//! - Parsing the overloaded SSH username field ("<cluster>/<claimed_user>")
//!
//! Who holds a key is decoupled from what name they connect as: the claimed
//! user in the username field is audit metadata only, and authorization keys
//! off the fingerprint.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};

/// One principal in the key table: the real identity behind a set of key
/// fingerprints, and the clusters that identity may reach.
#[derive(Debug, Clone, Deserialize)]
pub struct Principal {
    pub org: String,
    #[serde(default)]
    pub fingerprints: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct KeyFile {
    #[serde(default)]
    principals: HashMap<String, Principal>,
}

/// Static key database:
///
/// ```toml
/// [principals.alice]
/// org = "acme"
/// fingerprints = ["SHA256:Qx9..."]
/// clusters = ["node-a", "node-b"]
/// ```
pub struct KeyDb {
    principals: HashMap<String, Principal>,
}

impl KeyDb {
    /// Load the key table. A missing file yields an empty table, which
    /// denies every key.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Key table {} not found, denying all SSH callers", path.display());
            return Ok(Self {
                principals: HashMap::new(),
            });
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key table: {}", path.display()))?;
        let file: KeyFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse key table: {}", path.display()))?;

        info!(
            "Loaded {} principal(s) from {}",
            file.principals.len(),
            path.display()
        );
        Ok(Self {
            principals: file.principals,
        })
    }

    pub fn from_principals(principals: impl IntoIterator<Item = (String, Principal)>) -> Self {
        Self {
            principals: principals.into_iter().collect(),
        }
    }

    /// Authorize a key for a cluster. Fails closed: an unknown fingerprint
    /// and a known principal without a grant are both denied, with no
    /// distinction leaked to the caller.
    pub fn authorize(&self, fingerprint: &str, cluster_id: &str) -> GatewayResult<Identity> {
        let (user, principal) = self
            .principals
            .iter()
            .find(|(_, p)| p.fingerprints.iter().any(|f| f == fingerprint))
            .ok_or(GatewayError::Forbidden)?;

        if !principal.clusters.iter().any(|c| c == cluster_id) {
            warn!(
                "Denied key {} ({}): no grant for cluster '{}'",
                fingerprint, user, cluster_id
            );
            return Err(GatewayError::Forbidden);
        }

        Ok(Identity::new(user.clone(), principal.org.clone()))
    }
}

/// Parse an SSH public key string into (type, base64_data).
///
/// Handles formats like:
/// - "ssh-ed25519 AAAA... comment"
/// - "ssh-rsa AAAA... comment"
pub fn parse_ssh_key(key: &str) -> Result<(String, String)> {
    let parts: Vec<&str> = key.split_whitespace().collect();
    if parts.len() < 2 {
        return Err(anyhow!("Invalid SSH key format: too few parts"));
    }

    let key_type = parts[0].to_string();
    let key_data = parts[1].to_string();

    // Validate that key_data is valid base64
    base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok((key_type, key_data))
}

/// Compute the SHA256 fingerprint of an SSH public key string.
///
/// Returns the fingerprint in "SHA256:..." format used by `ssh-keygen -l`.
pub fn compute_fingerprint(public_key: &str) -> Result<String> {
    let (_, key_data) = parse_ssh_key(public_key)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&key_data)
        .with_context(|| "Invalid base64 in SSH key")?;

    Ok(compute_fingerprint_from_bytes(&decoded))
}

/// Compute fingerprint from raw key bytes (wire format).
/// SSH fingerprint = SHA256(raw_key_bytes_in_wire_format)
pub fn compute_fingerprint_from_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();

    let b64 = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{}", b64)
}

/// Compute fingerprint from a russh public key.
/// The fingerprint is SHA256 of the raw key bytes in SSH wire format.
pub fn compute_fingerprint_from_pubkey(key: &russh::keys::PublicKey) -> String {
    use russh::keys::PublicKeyBase64;
    let raw_bytes = key.public_key_bytes();
    compute_fingerprint_from_bytes(&raw_bytes)
}

/// Parse the overloaded SSH username field.
///
/// The proxy addresses targets through the username: "<cluster>/<claimed_user>".
/// The claimed user is optional and only recorded for audit.
pub fn parse_ssh_username(username: &str) -> (String, Option<String>) {
    if let Some(pos) = username.find('/') {
        let cluster = username[..pos].to_string();
        let claimed = username[pos + 1..].to_string();
        if claimed.is_empty() {
            (cluster, None)
        } else {
            (cluster, Some(claimed))
        }
    } else {
        (username.to_string(), None)
    }
}

/// Validate a cluster id as received from the network (no path traversal,
/// safe to log and to key the registry with).
pub fn validate_cluster_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("Cluster id cannot be empty"));
    }

    if id.len() > 64 {
        return Err(anyhow!("Cluster id too long (max 64 chars)"));
    }

    // Only allow alphanumeric, dash, underscore
    for c in id.chars() {
        if !c.is_alphanumeric() && c != '-' && c != '_' {
            return Err(anyhow!(
                "Invalid character '{}' in cluster id (only alphanumeric, dash, underscore allowed)",
                c
            ));
        }
    }

    // No leading dot or dash
    if id.starts_with('.') || id.starts_with('-') {
        return Err(anyhow!("Cluster id cannot start with '.' or '-'"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_alice() -> KeyDb {
        KeyDb::from_principals([(
            "alice".to_string(),
            Principal {
                org: "acme".to_string(),
                fingerprints: vec!["SHA256:alicekey".to_string()],
                clusters: vec!["node-a".to_string()],
            },
        )])
    }

    #[test]
    fn test_parse_ssh_username() {
        assert_eq!(
            parse_ssh_username("node-a/deploy"),
            ("node-a".to_string(), Some("deploy".to_string()))
        );
        assert_eq!(parse_ssh_username("node-a"), ("node-a".to_string(), None));
        assert_eq!(parse_ssh_username("node-a/"), ("node-a".to_string(), None));
    }

    #[test]
    fn test_validate_cluster_id() {
        assert!(validate_cluster_id("node-a").is_ok());
        assert!(validate_cluster_id("my_cluster2").is_ok());

        assert!(validate_cluster_id("").is_err());
        assert!(validate_cluster_id(".hidden").is_err());
        assert!(validate_cluster_id("-leading").is_err());
        assert!(validate_cluster_id("path/traversal").is_err());
        assert!(validate_cluster_id("has spaces").is_err());
    }

    #[test]
    fn test_parse_ssh_key() {
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl test@example.com";
        let (key_type, _key_data) = parse_ssh_key(key).unwrap();
        assert_eq!(key_type, "ssh-ed25519");
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
        let a = compute_fingerprint(key).unwrap();
        let b = compute_fingerprint(key).unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("SHA256:"));
    }

    #[test]
    fn test_authorize_granted_cluster() {
        let db = db_with_alice();
        let identity = db.authorize("SHA256:alicekey", "node-a").unwrap();
        assert_eq!(identity, Identity::new("alice", "acme"));
    }

    #[test]
    fn test_authorize_unknown_key_denied() {
        let db = db_with_alice();
        assert!(matches!(
            db.authorize("SHA256:otherkey", "node-a"),
            Err(GatewayError::Forbidden)
        ));
    }

    #[test]
    fn test_authorize_ungranted_cluster_denied() {
        let db = db_with_alice();
        assert!(matches!(
            db.authorize("SHA256:alicekey", "node-b"),
            Err(GatewayError::Forbidden)
        ));
    }

    #[test]
    fn test_empty_db_denies_everything() {
        let db = KeyDb::from_principals([]);
        assert!(matches!(
            db.authorize("SHA256:any", "node-a"),
            Err(GatewayError::Forbidden)
        ));
    }
}
