//! Cluster registry: target ownership and SSH connection parameters.
//!
//! Records are generated server-side when a cluster is provisioned and read
//! from the gateway's own store, so a caller can never inject an arbitrary
//! host through the public API. Identity material (key paths, passwords) is
//! kept out of Debug output and never serialized back to callers.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::auth::Identity;
use crate::error::{GatewayError, GatewayResult};

/// Credential material for the target-facing SSH connection.
#[derive(Clone)]
pub enum AuthMaterial {
    KeyFile(PathBuf),
    Password(String),
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMaterial::KeyFile(path) => write!(f, "KeyFile({})", path.display()),
            AuthMaterial::Password(_) => write!(f, "Password(<redacted>)"),
        }
    }
}

/// Resolved connection parameters for one target node.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: AuthMaterial,
}

/// One stored cluster record.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterRecord {
    pub owner_user: String,
    pub owner_org: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Debug, Default, Deserialize)]
struct ClusterFile {
    #[serde(default)]
    clusters: HashMap<String, ClusterRecord>,
}

/// Cluster store:
///
/// ```toml
/// [clusters.node-a]
/// owner_user = "alice"
/// owner_org = "acme"
/// host = "10.20.0.4"
/// port = 22
/// user = "ubuntu"
/// identity_file = "/etc/shellgate/identities/node-a"
/// ```
pub struct ClusterRegistry {
    clusters: HashMap<String, ClusterRecord>,
}

impl ClusterRegistry {
    /// Load the cluster store. A missing file yields an empty registry, so
    /// every target resolves to NotFound.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("Cluster store {} not found, no targets available", path.display());
            return Ok(Self {
                clusters: HashMap::new(),
            });
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster store: {}", path.display()))?;
        let file: ClusterFile = toml::from_str(&content)
            .with_context(|| format!("Failed to parse cluster store: {}", path.display()))?;

        info!(
            "Loaded {} cluster record(s) from {}",
            file.clusters.len(),
            path.display()
        );
        Ok(Self {
            clusters: file.clusters,
        })
    }

    pub fn from_records(records: impl IntoIterator<Item = (String, ClusterRecord)>) -> Self {
        Self {
            clusters: records.into_iter().collect(),
        }
    }

    /// Recorded owner of a cluster.
    pub fn owner(&self, cluster_id: &str) -> GatewayResult<Identity> {
        let record = self.clusters.get(cluster_id).ok_or(GatewayError::NotFound)?;
        Ok(Identity::new(
            record.owner_user.clone(),
            record.owner_org.clone(),
        ))
    }

    /// Gateway-variant authorization: the caller must be the recorded owner,
    /// user and org both. An org match alone is not ownership, so cross-user
    /// access inside one organization is denied.
    pub fn authorize_owner(&self, caller: &Identity, cluster_id: &str) -> GatewayResult<()> {
        let owner = self.owner(cluster_id)?;
        if owner != *caller {
            warn!(
                "Denied {}: not the owner of cluster '{}'",
                caller, cluster_id
            );
            return Err(GatewayError::Forbidden);
        }
        Ok(())
    }

    /// Resolve connection parameters for a cluster. Fails with `NotFound`
    /// for unknown ids and `Invalid` for incomplete records.
    pub fn resolve(&self, cluster_id: &str) -> GatewayResult<ConnectionParams> {
        let record = self.clusters.get(cluster_id).ok_or(GatewayError::NotFound)?;

        if record.host.is_empty() {
            return Err(GatewayError::Invalid(format!(
                "cluster '{cluster_id}' has no host"
            )));
        }
        if record.user.is_empty() {
            return Err(GatewayError::Invalid(format!(
                "cluster '{cluster_id}' has no login user"
            )));
        }
        if record.port == 0 {
            return Err(GatewayError::Invalid(format!(
                "cluster '{cluster_id}' has port 0"
            )));
        }

        let auth = match (&record.identity_file, &record.password) {
            (Some(path), _) => AuthMaterial::KeyFile(path.clone()),
            (None, Some(password)) => AuthMaterial::Password(password.clone()),
            (None, None) => {
                return Err(GatewayError::Invalid(format!(
                    "cluster '{cluster_id}' has no identity file or password"
                )));
            }
        };

        Ok(ConnectionParams {
            host: record.host.clone(),
            port: record.port,
            user: record.user.clone(),
            auth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner_user: &str, owner_org: &str) -> ClusterRecord {
        ClusterRecord {
            owner_user: owner_user.to_string(),
            owner_org: owner_org.to_string(),
            host: "10.0.0.4".to_string(),
            port: 22,
            user: "ubuntu".to_string(),
            identity_file: Some(PathBuf::from("/etc/shellgate/id/node-a")),
            password: None,
        }
    }

    fn registry() -> ClusterRegistry {
        ClusterRegistry::from_records([("node-a".to_string(), record("alice", "acme"))])
    }

    #[test]
    fn test_resolve_known_cluster() {
        let params = registry().resolve("node-a").unwrap();
        assert_eq!(params.host, "10.0.0.4");
        assert_eq!(params.port, 22);
        assert_eq!(params.user, "ubuntu");
        assert!(matches!(params.auth, AuthMaterial::KeyFile(_)));
    }

    #[test]
    fn test_resolve_unknown_cluster() {
        assert!(matches!(
            registry().resolve("nope"),
            Err(GatewayError::NotFound)
        ));
    }

    #[test]
    fn test_resolve_incomplete_record() {
        let mut incomplete = record("alice", "acme");
        incomplete.identity_file = None;
        let reg = ClusterRegistry::from_records([("node-b".to_string(), incomplete)]);
        assert!(matches!(
            reg.resolve("node-b"),
            Err(GatewayError::Invalid(_))
        ));
    }

    #[test]
    fn test_owner_must_match_exactly() {
        let reg = registry();
        assert!(reg
            .authorize_owner(&Identity::new("alice", "acme"), "node-a")
            .is_ok());

        // Same org, different user: denied.
        assert!(matches!(
            reg.authorize_owner(&Identity::new("bob", "acme"), "node-a"),
            Err(GatewayError::Forbidden)
        ));

        // Same user name, different org: denied.
        assert!(matches!(
            reg.authorize_owner(&Identity::new("alice", "globex"), "node-a"),
            Err(GatewayError::Forbidden)
        ));
    }

    #[test]
    fn test_unknown_cluster_not_found_for_authorize() {
        assert!(matches!(
            registry().authorize_owner(&Identity::new("alice", "acme"), "ghost"),
            Err(GatewayError::NotFound)
        ));
    }

    #[test]
    fn test_password_never_in_debug() {
        let auth = AuthMaterial::Password("hunter2".to_string());
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("hunter2"));
    }
}
