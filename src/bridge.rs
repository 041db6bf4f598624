//! Duplex byte relay between a client-facing stream and a target-facing
//! stream.
//!
//! Both front doors adapt their concrete transports (SSH channel, WebSocket,
//! PTY) onto plain mpsc byte channels and hand the pair to `run`, which
//! pumps both directions until either side closes, an I/O error surfaces as
//! a dropped channel, the session's close signal fires, or the TTL watchdog
//! deadline passes. Bytes are relayed in order within each direction; the
//! two directions are independent.
//!
//! `run` owns the session's registry lifecycle from `Active` onward: on any
//! termination it marks the session closing and destroys it, so teardown
//! happens exactly once no matter which end died first.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::sessions::{AttachedSession, SessionRegistry};

/// One side of the bridge: bytes arriving from that side, and a sink for
/// bytes going to it. Dropping the peer's sender reads as end-of-stream.
pub struct BridgeSide {
    pub rx: mpsc::Receiver<Vec<u8>>,
    pub tx: mpsc::Sender<Vec<u8>>,
}

impl BridgeSide {
    /// A side plus the handles the adapter keeps: (side, to_side_rx, from_side_tx).
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        let (from_tx, from_rx) = mpsc::channel(capacity);
        let (to_tx, to_rx) = mpsc::channel(capacity);
        (
            Self {
                rx: from_rx,
                tx: to_tx,
            },
            to_rx,
            from_tx,
        )
    }
}

/// Which end terminated the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEnd {
    /// Client stream closed or errored.
    ClientClosed,
    /// Target stream closed or errored (process exit, channel EOF).
    TargetClosed,
    /// The session was destroyed out from under the bridge (periodic sweep,
    /// eviction, explicit stop).
    SessionClosed,
    /// The session's TTL ran out mid-relay.
    TtlExpired,
}

#[derive(Debug, Clone, Copy)]
pub struct BridgeResult {
    pub end: BridgeEnd,
    pub client_to_target: u64,
    pub target_to_client: u64,
}

/// Relay until termination, then tear the session down.
pub async fn run(
    registry: Arc<SessionRegistry>,
    session: AttachedSession,
    mut client: BridgeSide,
    mut target: BridgeSide,
) -> BridgeResult {
    let session_id = session.session_id;
    let mut closed = session.closed;

    if !registry.mark_active(&session_id).await {
        // Destroyed between attach and bridge start; nothing was bridged.
        registry.destroy(&session_id).await;
        return BridgeResult {
            end: BridgeEnd::SessionClosed,
            client_to_target: 0,
            target_to_client: 0,
        };
    }

    let deadline = tokio::time::sleep(session.ttl_remaining);
    tokio::pin!(deadline);

    let mut client_to_target: u64 = 0;
    let mut target_to_client: u64 = 0;

    let end = loop {
        tokio::select! {
            _ = closed.changed() => {
                break BridgeEnd::SessionClosed;
            }
            _ = &mut deadline => {
                info!("Session {} hit its TTL, forcing close", session_id);
                break BridgeEnd::TtlExpired;
            }
            chunk = client.rx.recv() => match chunk {
                Some(bytes) => {
                    client_to_target += bytes.len() as u64;
                    if target.tx.send(bytes).await.is_err() {
                        break BridgeEnd::TargetClosed;
                    }
                }
                None => break BridgeEnd::ClientClosed,
            },
            chunk = target.rx.recv() => match chunk {
                Some(bytes) => {
                    target_to_client += bytes.len() as u64;
                    if client.tx.send(bytes).await.is_err() {
                        break BridgeEnd::ClientClosed;
                    }
                }
                None => break BridgeEnd::TargetClosed,
            },
        }
    };

    registry.mark_closing(&session_id).await;
    registry.destroy(&session_id).await;

    debug!(
        "Bridge for session {} ended ({:?}): {}B client->target, {}B target->client",
        session_id, end, client_to_target, target_to_client
    );

    BridgeResult {
        end,
        client_to_target,
        target_to_client,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::clusters::{AuthMaterial, ConnectionParams};
    use crate::sessions::LogUsageReporter;
    use std::time::Duration;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "10.0.0.4".to_string(),
            port: 22,
            user: "ubuntu".to_string(),
            auth: AuthMaterial::KeyFile("/tmp/id".into()),
        }
    }

    async fn attached_session(ttl: Duration) -> (Arc<SessionRegistry>, AttachedSession) {
        let registry = Arc::new(SessionRegistry::new(ttl, 8, Arc::new(LogUsageReporter)));
        let owner = Identity::new("alice", "acme");
        let id = registry
            .create(owner.clone(), "node-a".to_string(), params())
            .await;
        let attached = registry.attach(&id, &owner).await.unwrap();
        (registry, attached)
    }

    #[tokio::test]
    async fn test_relay_is_byte_faithful_both_directions() {
        let (registry, attached) = attached_session(Duration::from_secs(60)).await;

        let (client_side, mut to_client_rx, from_client_tx) = BridgeSide::pair(16);
        let (target_side, mut to_target_rx, from_target_tx) = BridgeSide::pair(16);

        let handle = tokio::spawn(run(registry.clone(), attached, client_side, target_side));

        // Target emits a fixed byte sequence in chunks; the client receives
        // exactly that sequence in order.
        let emitted: Vec<&[u8]> = vec![b"\x1b[2J$ ", b"uptime\r\n", b"\x00\xffbinary"];
        for chunk in &emitted {
            from_target_tx.send(chunk.to_vec()).await.unwrap();
        }

        let mut received = Vec::new();
        while received.len() < emitted.iter().map(|c| c.len()).sum::<usize>() {
            let chunk = recv_chunk(&mut to_client_rx).await;
            received.extend_from_slice(&chunk);
        }
        let expected: Vec<u8> = emitted.concat();
        assert_eq!(received, expected);

        // And the reverse direction.
        from_client_tx.send(b"ls -la\r".to_vec()).await.unwrap();
        assert_eq!(recv_chunk(&mut to_target_rx).await, b"ls -la\r");

        // Client hangs up: bridge tears down and destroys the session.
        drop(from_client_tx);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.end, BridgeEnd::ClientClosed);
        assert_eq!(registry.len().await, 0);
    }

    async fn recv_chunk(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("relay timed out")
            .expect("relay channel closed early")
    }

    #[tokio::test]
    async fn test_target_eof_ends_bridge() {
        let (registry, attached) = attached_session(Duration::from_secs(60)).await;

        let (client_side, _to_client_rx, _from_client_tx) = BridgeSide::pair(16);
        let (target_side, _to_target_rx, from_target_tx) = BridgeSide::pair(16);

        let handle = tokio::spawn(run(registry.clone(), attached, client_side, target_side));

        drop(from_target_tx);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.end, BridgeEnd::TargetClosed);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_session_destroy_ends_bridge() {
        let (registry, attached) = attached_session(Duration::from_secs(60)).await;
        let session_id = attached.session_id.clone();

        let (client_side, _to_client_rx, _from_client_tx) = BridgeSide::pair(16);
        let (target_side, _to_target_rx, _from_target_tx) = BridgeSide::pair(16);

        let handle = tokio::spawn(run(registry.clone(), attached, client_side, target_side));

        // Let the bridge reach Active before the kill.
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.destroy(&session_id).await;

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.end, BridgeEnd::SessionClosed);
    }

    #[tokio::test]
    async fn test_ttl_deadline_ends_bridge() {
        let (registry, attached) = attached_session(Duration::from_millis(40)).await;

        let (client_side, _to_client_rx, _from_client_tx) = BridgeSide::pair(16);
        let (target_side, _to_target_rx, _from_target_tx) = BridgeSide::pair(16);

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            run(registry.clone(), attached, client_side, target_side),
        )
        .await
        .unwrap();

        assert_eq!(result.end, BridgeEnd::TtlExpired);
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_owner_binds_after_impostor_is_denied() {
        use crate::error::GatewayError;

        let registry = Arc::new(SessionRegistry::new(
            Duration::from_secs(60),
            8,
            Arc::new(LogUsageReporter),
        ));
        let alice = Identity::new("alice", "acme");
        let id = registry
            .create(alice.clone(), "node-a".to_string(), params())
            .await;

        // Same org is not enough; bob never reaches the bridge.
        let bob = Identity::new("bob", "acme");
        assert!(matches!(
            registry.attach(&id, &bob).await,
            Err(GatewayError::Forbidden)
        ));

        // The owner binds, the session goes active, and a test string echoes
        // through the stub target.
        let attached = registry.attach(&id, &alice).await.unwrap();
        let (client_side, mut to_client_rx, _from_client_tx) = BridgeSide::pair(16);
        let (target_side, _to_target_rx, from_target_tx) = BridgeSide::pair(16);

        let handle = tokio::spawn(run(registry.clone(), attached, client_side, target_side));

        from_target_tx.send(b"echo-ok\r\n".to_vec()).await.unwrap();
        assert_eq!(recv_chunk(&mut to_client_rx).await, b"echo-ok\r\n");

        drop(from_target_tx);
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.end, BridgeEnd::TargetClosed);
    }

    #[tokio::test]
    async fn test_bridge_refuses_unattached_session() {
        let registry = Arc::new(SessionRegistry::new(
            Duration::from_secs(60),
            8,
            Arc::new(LogUsageReporter),
        ));
        let owner = Identity::new("alice", "acme");
        let id = registry
            .create(owner.clone(), "node-a".to_string(), params())
            .await;
        let destroyed = registry.attach(&id, &owner).await.unwrap();

        // Session destroyed before the bridge starts: must refuse to run.
        registry.destroy(&id).await;

        let (client_side, _a, _b) = BridgeSide::pair(4);
        let (target_side, _c, _d) = BridgeSide::pair(4);

        let result = run(registry.clone(), destroyed, client_side, target_side).await;
        assert_eq!(result.end, BridgeEnd::SessionClosed);
    }
}
