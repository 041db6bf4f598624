//! Gateway configuration loaded from TOML.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// SSH front door listen address (default: "0.0.0.0:2222")
    pub ssh_listen_addr: String,

    /// HTTP/WebSocket front door listen address (default: "127.0.0.1:8080")
    pub http_listen_addr: String,

    /// Path to the SSH host key
    pub host_key_path: PathBuf,

    /// Path to the static key ACL (principals, fingerprints, grants)
    pub key_db_path: PathBuf,

    /// Path to the cluster store (ownership + connection parameters)
    pub cluster_db_path: PathBuf,

    /// Path to the session token table
    pub token_db_path: PathBuf,

    /// Maximum session age in seconds, regardless of activity
    pub session_ttl_secs: u64,

    /// Bound on concurrent sessions; insertion past it evicts the oldest
    pub max_sessions: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join("shellgate");

        Self {
            ssh_listen_addr: "0.0.0.0:2222".to_string(),
            http_listen_addr: "127.0.0.1:8080".to_string(),
            host_key_path: data_dir.join("host_key"),
            key_db_path: data_dir.join("keys.toml"),
            cluster_db_path: data_dir.join("clusters.toml"),
            token_db_path: data_dir.join("tokens.toml"),
            session_ttl_secs: 3600,
            max_sessions: 64,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> Result<()> {
        for path in [
            &self.host_key_path,
            &self.key_db_path,
            &self.cluster_db_path,
            &self.token_db_path,
        ] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory: {}", parent.display())
                })?;
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}
