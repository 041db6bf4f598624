//! Shellgate
//!
//! A terminal access gateway for managed compute nodes: an SSH front door
//! that authenticates by public key and proxies to the authorized cluster,
//! and an HTTP/WebSocket front door that mints browser terminal sessions
//! bridged over a PTY. Both share one session registry and bridge core.

mod auth;
mod bridge;
mod clusters;
mod config;
mod error;
mod keys;
mod pty;
mod sessions;
mod ssh;
mod upstream;
mod web;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use crate::auth::StaticTokenVerifier;
use crate::clusters::ClusterRegistry;
use crate::config::GatewayConfig;
use crate::keys::KeyDb;
use crate::sessions::{LogUsageReporter, SessionRegistry};

/// Shellgate - terminal access gateway for managed compute nodes
#[derive(Parser, Debug)]
#[command(name = "shellgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/shellgate/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Print the SHA256 fingerprint of an SSH public key file and exit
    /// (for populating the key table)
    #[arg(long, value_name = "PUBKEY_FILE")]
    fingerprint: Option<PathBuf>,

    /// Override the SSH listen address
    #[arg(long)]
    ssh_listen: Option<String>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Handle --fingerprint
    if let Some(path) = cli.fingerprint {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read public key from {}", path.display()))?;
        println!("{}", keys::compute_fingerprint(content.trim())?);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI overrides
    if let Some(listen) = cli.ssh_listen {
        config.ssh_listen_addr = listen;
    }
    if let Some(listen) = cli.http_listen {
        config.http_listen_addr = listen;
    }

    config.ensure_dirs()?;

    info!("Starting shellgate");
    info!("  SSH listen address: {}", config.ssh_listen_addr);
    info!("  HTTP listen address: {}", config.http_listen_addr);
    info!("  Session TTL: {}s", config.session_ttl_secs);
    info!("  Max sessions: {}", config.max_sessions);

    let config = Arc::new(config);

    // Load the backing stores
    let keys = Arc::new(KeyDb::load(&config.key_db_path).context("Failed to load key table")?);
    let clusters = Arc::new(
        ClusterRegistry::load(&config.cluster_db_path).context("Failed to load cluster store")?,
    );
    let tokens = Arc::new(
        StaticTokenVerifier::load(&config.token_db_path).context("Failed to load token table")?,
    );

    // The session registry, shared by both front doors
    let registry = Arc::new(SessionRegistry::new(
        config.session_ttl(),
        config.max_sessions,
        Arc::new(LogUsageReporter),
    ));
    let sweeper = registry.clone().spawn_sweeper();

    let ssh_state = Arc::new(ssh::ServerState {
        config: config.clone(),
        keys,
        clusters: clusters.clone(),
        registry: registry.clone(),
    });

    let web_state = web::WebState {
        registry,
        clusters,
        tokens,
    };
    let http_listen_addr = config.http_listen_addr.clone();

    // Run both front doors until one fails or we get a shutdown signal
    let result = tokio::select! {
        res = ssh::run_server(ssh_state) => res.context("SSH front door failed"),
        res = web::serve(&http_listen_addr, web_state) => res.context("HTTP front door failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    sweeper.abort();
    result
}
