//! SSH front door using russh.
//!
//! Handles:
//! - Public key authentication against the static key ACL (publickey only;
//!   password auth is never offered)
//! - The overloaded username field: "<cluster>/<claimed_user>"
//! - Session channels (PTY, shell, exec, window-change), bridged to an
//!   outbound SSH connection on the authorized cluster
//!
//! The authorization decision is captured once during auth and reused at
//! channel open, so the cluster a caller was checked against is the cluster
//! they are bridged to.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::keys::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::bridge::{self, BridgeSide};
use crate::clusters::ClusterRegistry;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::keys::{KeyDb, compute_fingerprint_from_pubkey, parse_ssh_username, validate_cluster_id};
use crate::sessions::SessionRegistry;
use crate::upstream::{self, ChannelMode, PtyParams};

/// Shared state for the SSH server.
pub struct ServerState {
    pub config: Arc<GatewayConfig>,
    pub keys: Arc<KeyDb>,
    pub clusters: Arc<ClusterRegistry>,
    pub registry: Arc<SessionRegistry>,
}

/// Authorization decision made during the auth phase. Channel requests use
/// this verbatim; they never re-derive the cluster from request data.
#[derive(Debug, Clone)]
struct AuthzDecision {
    identity: Identity,
    cluster_id: String,
    claimed_user: Option<String>,
}

/// Per-connection handler state.
pub struct ConnectionHandler {
    server: Arc<ServerState>,
    peer_addr: SocketAddr,

    /// Set once authentication succeeds.
    authz: Option<AuthzDecision>,

    /// PTY info per SSH channel (set by pty_request).
    ptys: HashMap<ChannelId, PtyInfo>,

    /// Live bridges per SSH channel.
    bindings: HashMap<ChannelId, ChannelBinding>,
}

struct ChannelBinding {
    session_id: String,
    /// Terminal input into the bridge; dropped on EOF to half-close.
    input_tx: Option<mpsc::Sender<Vec<u8>>>,
    resize_tx: mpsc::Sender<(u32, u32)>,
}

#[derive(Debug, Clone)]
struct PtyInfo {
    term: String,
    cols: u32,
    rows: u32,
}

impl ConnectionHandler {
    fn new(server: Arc<ServerState>, peer_addr: SocketAddr) -> Self {
        Self {
            server,
            peer_addr,
            authz: None,
            ptys: HashMap::new(),
            bindings: HashMap::new(),
        }
    }

    /// Authorize a presented key for the cluster named in the SSH username.
    /// Every failure is a plain rejection; the caller learns nothing about
    /// which lookup failed.
    fn evaluate_key(&self, ssh_user: &str, public_key: &PublicKey) -> Option<AuthzDecision> {
        let (cluster_id, claimed_user) = parse_ssh_username(ssh_user);

        if let Err(e) = validate_cluster_id(&cluster_id) {
            warn!(
                "Rejecting SSH user '{}' from {}: {}",
                ssh_user, self.peer_addr, e
            );
            return None;
        }

        let fingerprint = compute_fingerprint_from_pubkey(public_key);
        match self.server.keys.authorize(&fingerprint, &cluster_id) {
            Ok(identity) => {
                info!(
                    "Authorized key {} as {} for cluster '{}' (claimed user: {})",
                    fingerprint,
                    identity,
                    cluster_id,
                    claimed_user.as_deref().unwrap_or("-")
                );
                Some(AuthzDecision {
                    identity,
                    cluster_id,
                    claimed_user,
                })
            }
            Err(_) => {
                warn!(
                    "Denied key {} from {} for cluster '{}'",
                    fingerprint, self.peer_addr, cluster_id
                );
                None
            }
        }
    }

    /// Mint and attach a session, dial the upstream node, and start the
    /// bridge for one SSH channel.
    async fn start_bridge(
        &mut self,
        channel_id: ChannelId,
        mode: ChannelMode,
        session: &mut Session,
    ) -> GatewayResult<()> {
        let authz = self
            .authz
            .as_ref()
            .cloned()
            .ok_or(GatewayError::Unauthenticated)?;

        if self.bindings.contains_key(&channel_id) {
            return Err(GatewayError::Conflict);
        }

        let params = self.server.clusters.resolve(&authz.cluster_id)?;
        let registry = self.server.registry.clone();

        let session_id = registry
            .create(authz.identity.clone(), authz.cluster_id.clone(), params)
            .await;
        let attached = registry.attach(&session_id, &authz.identity).await?;

        info!(
            "Bridging channel {:?} to cluster '{}' for {} (proxy user {})",
            channel_id,
            authz.cluster_id,
            authz.identity,
            authz.claimed_user.as_deref().unwrap_or("-")
        );

        let pty = self.ptys.get(&channel_id).map(|p| PtyParams {
            term: p.term.clone(),
            cols: p.cols,
            rows: p.rows,
        });

        let upstream_io = match upstream::open(&session_id, &attached.params, pty, mode).await {
            Ok(io) => io,
            Err(err) => {
                registry.destroy(&session_id).await;
                return Err(err);
            }
        };

        let (from_client_tx, from_client_rx) = mpsc::channel::<Vec<u8>>(64);
        let (to_client_tx, mut to_client_rx) = mpsc::channel::<Vec<u8>>(256);

        self.bindings.insert(
            channel_id,
            ChannelBinding {
                session_id: session_id.clone(),
                input_tx: Some(from_client_tx),
                resize_tx: upstream_io.resize_tx.clone(),
            },
        );

        let client_side = BridgeSide {
            rx: from_client_rx,
            tx: to_client_tx,
        };
        let target_side = BridgeSide {
            rx: upstream_io.from_target,
            tx: upstream_io.to_target,
        };

        let handle = session.handle();
        let mut exit_status = upstream_io.exit_status;

        tokio::spawn(async move {
            // Terminal output onto the SSH channel.
            let writer_handle = handle.clone();
            let writer = tokio::spawn(async move {
                while let Some(bytes) = to_client_rx.recv().await {
                    if writer_handle
                        .data(channel_id, CryptoVec::from_slice(&bytes))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });

            let result = bridge::run(registry, attached, client_side, target_side).await;
            let _ = writer.await;

            // Clients (editors, scripts) rely on the exit status when the
            // remote command finished normally.
            if let Ok(status) = exit_status.try_recv() {
                let _ = handle.exit_status_request(channel_id, status).await;
            }
            let _ = handle.eof(channel_id).await;
            let _ = handle.close(channel_id).await;

            debug!(
                "SSH channel {:?} for session {} closed ({:?})",
                channel_id, session_id, result.end
            );
        });

        Ok(())
    }

    /// Refuse a shell/exec request without killing the connection: standard
    /// failure signal, a short diagnostic for upstream trouble, close.
    fn refuse_channel(
        &self,
        channel_id: ChannelId,
        err: &GatewayError,
        session: &mut Session,
    ) -> Result<(), russh::Error> {
        session.channel_failure(channel_id)?;
        if matches!(err, GatewayError::Upstream(_)) {
            let diag = format!("shellgate: {}\r\n", err.client_message());
            let _ = session.data(channel_id, CryptoVec::from_slice(diag.as_bytes()));
        }
        session.close(channel_id)?;
        Ok(())
    }
}

impl Handler for ConnectionHandler {
    type Error = anyhow::Error;

    /// Only session channels are accepted.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Session channel opened: {:?}", channel.id());
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("Refusing direct-tcpip channel from {}", self.peer_addr);
        Ok(false)
    }

    /// First pass: the client offers a key without a signature.
    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        debug!("Public key offered by '{}' from {}", user, self.peer_addr);

        if self.evaluate_key(user, public_key).is_some() {
            return Ok(Auth::Accept);
        }

        // Let the client try its remaining keys before giving up.
        let methods = MethodSet::from(&[MethodKind::PublicKey][..]);
        Ok(Auth::Reject {
            proceed_with_methods: Some(methods),
            partial_success: false,
        })
    }

    /// Second pass: the signature verified; record the decision of record.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        match self.evaluate_key(user, public_key) {
            Some(decision) => {
                self.authz = Some(decision);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }),
        }
    }

    /// PTY requests are accepted unconditionally; the proxy only forwards.
    async fn pty_request(
        &mut self,
        channel_id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "PTY request: channel={:?}, term={}, cols={}, rows={}",
            channel_id, term, col_width, row_height
        );
        let term = if term.is_empty() { "xterm-256color" } else { term };
        self.ptys.insert(
            channel_id,
            PtyInfo {
                term: term.to_string(),
                cols: col_width,
                rows: row_height,
            },
        );
        session.channel_success(channel_id)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!("Shell request on channel {:?}", channel_id);

        match self
            .start_bridge(channel_id, ChannelMode::Shell, session)
            .await
        {
            Ok(()) => {
                session.channel_success(channel_id)?;
            }
            Err(err) => {
                warn!("Shell request on {:?} refused: {}", channel_id, err);
                self.refuse_channel(channel_id, &err, session)
                    .context("failed to refuse channel")?;
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).to_string();
        info!("Exec request on channel {:?}: {}", channel_id, command);

        match self
            .start_bridge(channel_id, ChannelMode::Exec(command), session)
            .await
        {
            Ok(()) => {
                session.channel_success(channel_id)?;
            }
            Err(err) => {
                warn!("Exec request on {:?} refused: {}", channel_id, err);
                self.refuse_channel(channel_id, &err, session)
                    .context("failed to refuse channel")?;
            }
        }
        Ok(())
    }

    /// Forward window changes to the upstream PTY.
    async fn window_change_request(
        &mut self,
        channel_id: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Window change: channel={:?}, cols={}, rows={}",
            channel_id, col_width, row_height
        );

        if let Some(pty) = self.ptys.get_mut(&channel_id) {
            pty.cols = col_width;
            pty.rows = row_height;
        }

        if let Some(binding) = self.bindings.get(&channel_id) {
            let _ = binding.resize_tx.send((col_width, row_height)).await;
        }
        Ok(())
    }

    /// Terminal input from the client.
    async fn data(
        &mut self,
        channel_id: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(binding) = self.bindings.get(&channel_id) {
            if let Some(ref tx) = binding.input_tx {
                let _ = tx.send(data.to_vec()).await;
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel EOF: {:?}", channel_id);
        // Drop the input sender; the bridge reads it as client half-close.
        if let Some(binding) = self.bindings.get_mut(&channel_id) {
            binding.input_tx = None;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel_id: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        debug!("Channel closed: {:?}", channel_id);
        if let Some(binding) = self.bindings.remove(&channel_id) {
            // The bridge usually noticed already; destroy is idempotent.
            self.server.registry.destroy(&binding.session_id).await;
        }
        self.ptys.remove(&channel_id);
        Ok(())
    }
}

/// Run the SSH server.
pub async fn run_server(state: Arc<ServerState>) -> Result<()> {
    let key = load_or_generate_host_key(&state.config.host_key_path).await?;

    let russh_config = Arc::new(russh::server::Config {
        methods: MethodSet::from(&[MethodKind::PublicKey][..]),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        keys: vec![key],
        ..Default::default()
    });

    let addr: SocketAddr = state
        .config
        .ssh_listen_addr
        .parse()
        .with_context(|| format!("Invalid SSH listen address: {}", state.config.ssh_listen_addr))?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("SSH front door listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let state = state.clone();
        let russh_config = russh_config.clone();

        tokio::spawn(async move {
            let handler = ConnectionHandler::new(state, peer_addr);
            match russh::server::run_stream(russh_config, stream, handler).await {
                Ok(session) => {
                    if let Err(e) = session.await {
                        warn!("SSH session error: {}", e);
                    }
                }
                Err(e) => {
                    warn!("SSH connection error: {}", e);
                }
            }
        });
    }
}

/// Load host key from file or generate a new one.
async fn load_or_generate_host_key(path: &std::path::Path) -> Result<russh::keys::PrivateKey> {
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};

    if path.exists() {
        info!("Loading host key from {}", path.display());
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))?;
        Ok(key)
    } else {
        info!("Generating new Ed25519 host key");
        let key = russh::keys::PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key_bytes = key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        tokio::fs::write(path, key_bytes.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        info!("Saved host key to {}", path.display());
        Ok(key)
    }
}
