//! HTTP/WebSocket front door.
//!
//! Two-step flow: an authenticated HTTP request mints a session for a
//! cluster the caller owns, then a WebSocket upgrade binds to that session
//! and relays terminal I/O. The upgrade is a separate connection and
//! re-authenticates on its own credentials; a leaked session id alone never
//! grants access.
//!
//! Wire protocol: tagged JSON envelopes. Terminal bytes travel as
//! `{"type":"data","payload":"<base64>"}` in both directions; the server
//! additionally sends `error` and `status` frames, and the client may send
//! `resize` frames.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::{Identity, TokenVerifier};
use crate::bridge::{self, BridgeSide};
use crate::clusters::ClusterRegistry;
use crate::error::{GatewayError, GatewayResult};
use crate::pty;
use crate::sessions::SessionRegistry;

pub const SESSION_COOKIE_NAME: &str = "shellgate_session";

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Shared state for the HTTP front door.
#[derive(Clone)]
pub struct WebState {
    pub registry: Arc<SessionRegistry>,
    pub clusters: Arc<ClusterRegistry>,
    pub tokens: Arc<dyn TokenVerifier>,
}

/// One WebSocket message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireFrame {
    /// Base64-encoded terminal bytes.
    Data { payload: String },
    /// Out-of-band diagnostic, server to client.
    Error { message: String },
    /// Lifecycle notice, server to client.
    Status { state: String },
    /// Terminal geometry change, client to server.
    Resize { cols: u16, rows: u16 },
}

impl WireFrame {
    pub fn data(bytes: &[u8]) -> Self {
        WireFrame::Data {
            payload: BASE64.encode(bytes),
        }
    }

    pub fn decode_data(payload: &str) -> Option<Vec<u8>> {
        BASE64.decode(payload).ok()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MintResponse {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            // Forbidden collapses into NotFound: a denied caller must not
            // learn whether the target exists.
            GatewayError::Forbidden | GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Expired => StatusCode::GONE,
            GatewayError::Conflict => StatusCode::CONFLICT,
            GatewayError::Invalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.client_message(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/clusters/:cluster_id/terminal", get(mint_session))
        .route("/api/sessions", get(list_sessions))
        .route("/api/terminal/ws/:session_id", get(ws_bind))
        .route("/api/terminal/:session_id", delete(stop_session))
        .with_state(state)
}

/// Run the HTTP front door.
pub async fn serve(listen_addr: &str, state: WebState) -> anyhow::Result<()> {
    use anyhow::Context;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {listen_addr}"))?;
    info!("HTTP front door listening on {}", listener.local_addr()?);

    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Pull the caller's credential from the Authorization header or the
/// session cookie and verify it.
fn authenticate(state: &WebState, headers: &HeaderMap, jar: &CookieJar) -> GatewayResult<Identity> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let token = match bearer {
        Some(token) => token.to_string(),
        None => jar
            .get(SESSION_COOKIE_NAME)
            .map(|c| c.value().to_string())
            .ok_or(GatewayError::Unauthenticated)?,
    };

    state.tokens.verify(&token)
}

/// Mint a session for a cluster the caller owns.
async fn mint_session(
    State(state): State<WebState>,
    Path(cluster_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<MintResponse>, ApiError> {
    let identity = authenticate(&state, &headers, &jar)?;
    state.clusters.authorize_owner(&identity, &cluster_id)?;
    let params = state.clusters.resolve(&cluster_id)?;

    let session_id = state.registry.create(identity, cluster_id, params).await;
    Ok(Json(MintResponse { session_id }))
}

#[derive(Debug, Serialize)]
struct SessionRow {
    session_id: String,
    cluster_id: String,
    state: &'static str,
    age_secs: u64,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// List the caller's own sessions (dashboard view).
async fn list_sessions(
    State(state): State<WebState>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<Vec<SessionRow>>, ApiError> {
    let identity = authenticate(&state, &headers, &jar)?;
    let rows = state
        .registry
        .snapshot()
        .await
        .into_iter()
        .filter(|s| s.owner == identity)
        .map(|s| SessionRow {
            session_id: s.session_id,
            cluster_id: s.cluster_id,
            state: s.state.as_str(),
            age_secs: s.age.as_secs(),
            created_at: s.created_at,
        })
        .collect();
    Ok(Json(rows))
}

/// Explicit stop: destroy one of the caller's own sessions.
async fn stop_session(
    State(state): State<WebState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<StatusCode, ApiError> {
    let identity = authenticate(&state, &headers, &jar)?;
    state.registry.destroy_owned(&session_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// WebSocket upgrade: re-authenticate, then bind to the session.
async fn ws_bind(
    State(state): State<WebState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    jar: CookieJar,
) -> Response {
    // The upgrade's own credentials decide; the session id is not enough.
    let identity = match authenticate(&state, &headers, &jar) {
        Ok(identity) => identity,
        Err(err) => return ApiError(err).into_response(),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, session_id))
}

async fn handle_socket(
    mut socket: WebSocket,
    state: WebState,
    identity: Identity,
    session_id: String,
) {
    let attached = match state.registry.attach(&session_id, &identity).await {
        Ok(attached) => attached,
        Err(err) => {
            debug!("WebSocket bind to session {} refused: {}", session_id, err);
            refuse(socket, &err).await;
            return;
        }
    };

    info!(
        "Session {} bound by {} for cluster '{}'",
        session_id, attached.owner, attached.cluster_id
    );

    let (pty_proc, pty_io) = match pty::spawn_ssh(
        &attached.session_id,
        &attached.params,
        DEFAULT_COLS,
        DEFAULT_ROWS,
    ) {
        Ok(pair) => pair,
        Err(err) => {
            warn!("Session {}: pty setup failed: {}", session_id, err);
            state.registry.destroy(&session_id).await;
            refuse(socket, &err).await;
            return;
        }
    };

    send_frame(
        &mut socket,
        &WireFrame::Status {
            state: "connected".to_string(),
        },
    )
    .await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_side, mut to_client_rx, from_client_tx) = BridgeSide::pair(64);
    let target_side = BridgeSide {
        rx: pty_io.from_target,
        tx: pty_io.to_target,
    };
    let resize_tx = pty_io.resize_tx;

    // Client input: WebSocket frames onto the bridge.
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<WireFrame>(&text) {
                    Ok(WireFrame::Data { payload }) => match WireFrame::decode_data(&payload) {
                        Some(bytes) => {
                            if from_client_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        None => debug!("Dropping data frame with invalid base64"),
                    },
                    Ok(WireFrame::Resize { cols, rows }) => {
                        let _ = resize_tx.send((cols, rows)).await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Dropping malformed frame: {}", e),
                },
                // Raw binary frames are accepted as unframed terminal input.
                Message::Binary(bytes) => {
                    if from_client_tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Terminal output: bridge onto WebSocket frames, then a closing notice.
    let writer = tokio::spawn(async move {
        while let Some(bytes) = to_client_rx.recv().await {
            let frame = WireFrame::data(&bytes);
            match serde_json::to_string(&frame) {
                Ok(text) => {
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Failed to encode data frame: {}", e);
                    break;
                }
            }
        }

        // Best-effort diagnostic; teardown does not wait on delivery.
        if let Ok(text) = serde_json::to_string(&WireFrame::Status {
            state: "closed".to_string(),
        }) {
            let _ = ws_tx.send(Message::Text(text)).await;
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    let result = bridge::run(state.registry.clone(), attached, client_side, target_side).await;

    pty_proc.terminate().await;
    reader.abort();
    let _ = writer.await;

    info!(
        "WebSocket session {} ended ({:?}, {}B in, {}B out)",
        session_id, result.end, result.client_to_target, result.target_to_client
    );
}

async fn send_frame(socket: &mut WebSocket, frame: &WireFrame) {
    if let Ok(text) = serde_json::to_string(frame) {
        let _ = socket.send(Message::Text(text)).await;
    }
}

/// Deliver a diagnostic and close without binding.
async fn refuse(mut socket: WebSocket, err: &GatewayError) {
    send_frame(
        &mut socket,
        &WireFrame::Error {
            message: err.client_message(),
        },
    )
    .await;
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_round_trip() {
        let frame = WireFrame::data(b"ls -la\r\n");
        let text = serde_json::to_string(&frame).unwrap();
        assert!(text.contains("\"type\":\"data\""));

        let parsed: WireFrame = serde_json::from_str(&text).unwrap();
        match parsed {
            WireFrame::Data { payload } => {
                assert_eq!(WireFrame::decode_data(&payload).unwrap(), b"ls -la\r\n");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_resize_frame_parses() {
        let parsed: WireFrame =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(parsed, WireFrame::Resize { cols: 120, rows: 40 });
    }

    #[test]
    fn test_error_frame_is_tagged() {
        let text = serde_json::to_string(&WireFrame::Error {
            message: "session expired".to_string(),
        })
        .unwrap();
        assert!(text.contains("\"type\":\"error\""));
    }

    #[test]
    fn test_invalid_base64_rejected() {
        assert!(WireFrame::decode_data("not!!base64").is_none());
    }
}
