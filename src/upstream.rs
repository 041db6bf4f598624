//! Outbound SSH connection to a target node.
//!
//! Used by the SSH front door to obtain an interactive shell (or exec)
//! channel on the node a caller was authorized for. The channel is owned by
//! a single task that relays it onto plain byte channels for the bridge;
//! terminal input, resize requests, and channel messages are multiplexed in
//! one loop so the channel is never shared across tasks.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, AuthResult};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clusters::{AuthMaterial, ConnectionParams};
use crate::error::{GatewayError, GatewayResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Terminal geometry requested by the inbound client, replayed upstream.
#[derive(Debug, Clone)]
pub struct PtyParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// What to run on the upstream channel.
#[derive(Debug, Clone)]
pub enum ChannelMode {
    Shell,
    Exec(String),
}

/// Byte channels onto an established upstream session. Dropping `to_target`
/// sends EOF upstream; `from_target` closing means the remote side is done.
pub struct UpstreamIo {
    pub from_target: mpsc::Receiver<Vec<u8>>,
    pub to_target: mpsc::Sender<Vec<u8>>,
    pub resize_tx: mpsc::Sender<(u32, u32)>,
    pub exit_status: oneshot::Receiver<u32>,
}

struct UpstreamHandler;

impl client::Handler for UpstreamHandler {
    type Error = russh::Error;

    /// Cluster records come from the gateway's own store, not from caller
    /// input, so host keys are accepted without a known_hosts check.
    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Upstream host key received ({:?})",
            server_public_key.algorithm()
        );
        Ok(true)
    }
}

/// Connect, authenticate, and start a shell or exec on the target node.
pub async fn open(
    session_id: &str,
    params: &ConnectionParams,
    pty: Option<PtyParams>,
    mode: ChannelMode,
) -> GatewayResult<UpstreamIo> {
    let config = Arc::new(client::Config::default());

    info!(
        "Session {}: connecting upstream to {}@{}:{}",
        session_id, params.user, params.host, params.port
    );

    let mut handle = tokio::time::timeout(
        CONNECT_TIMEOUT,
        client::connect(
            config,
            (params.host.as_str(), params.port),
            UpstreamHandler,
        ),
    )
    .await
    .map_err(|_| GatewayError::Upstream("connection timed out".to_string()))?
    .map_err(|e| GatewayError::Upstream(format!("connection failed: {e}")))?;

    let auth_result = match &params.auth {
        AuthMaterial::KeyFile(path) => {
            let key = russh::keys::load_secret_key(path, None)
                .map_err(|e| GatewayError::Upstream(format!("unusable identity file: {e}")))?;
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&params.user, key)
                .await
                .map_err(|e| GatewayError::Upstream(format!("authentication failed: {e}")))?
        }
        AuthMaterial::Password(password) => handle
            .authenticate_password(&params.user, password)
            .await
            .map_err(|e| GatewayError::Upstream(format!("authentication failed: {e}")))?,
    };

    match auth_result {
        AuthResult::Success => {}
        AuthResult::Failure { .. } => {
            return Err(GatewayError::Upstream(
                "credentials rejected by target".to_string(),
            ));
        }
    }

    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| GatewayError::Upstream(format!("channel open failed: {e}")))?;

    if let Some(pty) = &pty {
        channel
            .request_pty(false, &pty.term, pty.cols, pty.rows, 0, 0, &[])
            .await
            .map_err(|e| GatewayError::Upstream(format!("pty request failed: {e}")))?;
    }

    match &mode {
        ChannelMode::Shell => channel
            .request_shell(false)
            .await
            .map_err(|e| GatewayError::Upstream(format!("shell request failed: {e}")))?,
        ChannelMode::Exec(command) => channel
            .exec(false, command.as_str())
            .await
            .map_err(|e| GatewayError::Upstream(format!("exec request failed: {e}")))?,
    }

    info!("Session {}: upstream channel ready", session_id);

    let (from_target_tx, from_target_rx) = mpsc::channel::<Vec<u8>>(256);
    let (to_target_tx, mut to_target_rx) = mpsc::channel::<Vec<u8>>(64);
    let (resize_tx, mut resize_rx) = mpsc::channel::<(u32, u32)>(8);
    let (exit_tx, exit_rx) = oneshot::channel::<u32>();

    let sid = session_id.to_string();
    tokio::spawn(async move {
        let mut channel = channel;
        let mut exit_tx = Some(exit_tx);

        loop {
            tokio::select! {
                chunk = to_target_rx.recv() => match chunk {
                    Some(bytes) => {
                        if let Err(e) = channel.data(&bytes[..]).await {
                            warn!("Session {}: upstream write failed: {}", sid, e);
                            break;
                        }
                    }
                    None => {
                        // Client side is done; half-close and wait for the
                        // remote to finish in the wait() arm.
                        let _ = channel.eof().await;
                        break;
                    }
                },
                Some((cols, rows)) = resize_rx.recv() => {
                    if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                        warn!("Session {}: upstream resize failed: {}", sid, e);
                    }
                }
                msg = channel.wait() => match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if from_target_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, .. }) => {
                        // stderr folds into the terminal stream.
                        if from_target_tx.send(data.to_vec()).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        debug!("Session {}: upstream exit status {}", sid, exit_status);
                        if let Some(tx) = exit_tx.take() {
                            let _ = tx.send(exit_status);
                        }
                    }
                    Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                        debug!("Session {}: upstream killed by {:?}", sid, signal_name);
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        debug!("Session {}: upstream channel closed", sid);
                        break;
                    }
                    Some(_) => {}
                },
            }
        }

        let _ = handle
            .disconnect(Disconnect::ByApplication, "session closed", "en")
            .await;
        debug!("Session {}: upstream disconnected", sid);
    });

    Ok(UpstreamIo {
        from_target: from_target_rx,
        to_target: to_target_tx,
        resize_tx,
        exit_status: exit_rx,
    })
}
