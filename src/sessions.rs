//! In-memory session registry and lifecycle management.
//!
//! The registry is the only shared mutable structure in the gateway. All
//! mutations go through one mutex; the live process/PTY/channel handles are
//! owned exclusively by each session's bridge task and never stored here.
//! Every teardown path (bridge termination, TTL watchdog, periodic sweep,
//! eviction, explicit stop) funnels into `destroy`, which is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::auth::Identity;
use crate::clusters::ConnectionParams;
use crate::error::{GatewayError, GatewayResult};

/// Transport lifecycle of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Pending,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl TransportState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::Pending => "pending",
            TransportState::Connecting => "connecting",
            TransportState::Active => "active",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        }
    }
}

/// Notified when sessions start and stop. Quota/usage accounting lives
/// outside the gateway; this is only the hook it listens on.
pub trait UsageReporter: Send + Sync {
    fn session_started(&self, session_id: &str, owner: &Identity, cluster_id: &str);
    fn session_closed(&self, session_id: &str, owner: &Identity, cluster_id: &str);
}

/// Default reporter: audit log only.
pub struct LogUsageReporter;

impl UsageReporter for LogUsageReporter {
    fn session_started(&self, session_id: &str, owner: &Identity, cluster_id: &str) {
        info!("Session {} started: {} -> {}", session_id, owner, cluster_id);
    }

    fn session_closed(&self, session_id: &str, owner: &Identity, cluster_id: &str) {
        info!("Session {} closed: {} -> {}", session_id, owner, cluster_id);
    }
}

struct SessionEntry {
    owner: Identity,
    cluster_id: String,
    params: ConnectionParams,
    /// Monotonic, for TTL arithmetic.
    created_at: Instant,
    /// Wall clock, for listings and audit.
    created_wall: DateTime<Utc>,
    state: TransportState,
    closed_tx: watch::Sender<bool>,
}

/// A successfully attached session, handed to the bridge. The close signal
/// fires (or its sender drops) when any teardown path destroys the session;
/// `ttl_remaining` is how long the bridge may run before forcing closure.
pub struct AttachedSession {
    pub session_id: String,
    pub owner: Identity,
    pub cluster_id: String,
    pub params: ConnectionParams,
    pub closed: watch::Receiver<bool>,
    pub ttl_remaining: Duration,
}

/// Snapshot row for listings and logs.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub owner: Identity,
    pub cluster_id: String,
    pub state: TransportState,
    pub age: Duration,
    pub created_at: DateTime<Utc>,
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
    max_sessions: usize,
    usage: Arc<dyn UsageReporter>,
}

impl SessionRegistry {
    pub fn new(ttl: Duration, max_sessions: usize, usage: Arc<dyn UsageReporter>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
            max_sessions: max_sessions.max(1),
            usage,
        }
    }

    /// Insert a new `Pending` session for `owner` on `cluster_id`.
    ///
    /// Under the same critical section, expired sessions are swept and the
    /// oldest entries are evicted until the new session fits; the entry
    /// being inserted is never the one evicted.
    pub async fn create(
        &self,
        owner: Identity,
        cluster_id: String,
        params: ConnectionParams,
    ) -> String {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut removed = Vec::new();

        {
            let mut sessions = self.sessions.lock().await;

            self.sweep_locked(&mut sessions, &mut removed);

            while sessions.len() >= self.max_sessions {
                let oldest = sessions
                    .iter()
                    .min_by_key(|(_, e)| e.created_at)
                    .map(|(id, _)| id.clone());
                match oldest {
                    Some(id) => {
                        if let Some(entry) = sessions.remove(&id) {
                            warn!("Evicting session {} (registry full)", id);
                            removed.push((id, entry));
                        }
                    }
                    None => break,
                }
            }

            let (closed_tx, _) = watch::channel(false);
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    owner: owner.clone(),
                    cluster_id: cluster_id.clone(),
                    params,
                    created_at: Instant::now(),
                    created_wall: Utc::now(),
                    state: TransportState::Pending,
                    closed_tx,
                },
            );
        }

        for (id, entry) in removed {
            self.finish_entry(&id, entry);
        }

        self.usage.session_started(&session_id, &owner, &cluster_id);
        session_id
    }

    /// Bind a caller to a session, transitioning `Pending -> Connecting`
    /// exactly once. The returned `ttl_remaining` feeds the bridge's TTL
    /// watchdog.
    pub async fn attach(
        &self,
        session_id: &str,
        caller: &Identity,
    ) -> GatewayResult<AttachedSession> {
        let attached = {
            let mut sessions = self.sessions.lock().await;

            let age = match sessions.get(session_id) {
                None => return Err(GatewayError::NotFound),
                Some(entry) => entry.created_at.elapsed(),
            };

            if age > self.ttl {
                // Reap on the spot; the caller gets Expired either way.
                let entry = sessions.remove(session_id);
                drop(sessions);
                if let Some(entry) = entry {
                    self.finish_entry(session_id, entry);
                }
                return Err(GatewayError::Expired);
            }

            let entry = sessions
                .get_mut(session_id)
                .ok_or(GatewayError::NotFound)?;

            if entry.owner != *caller {
                warn!(
                    "Denied attach to session {} by {}: not the owner",
                    session_id, caller
                );
                return Err(GatewayError::Forbidden);
            }

            if entry.state != TransportState::Pending {
                return Err(GatewayError::Conflict);
            }
            entry.state = TransportState::Connecting;

            AttachedSession {
                session_id: session_id.to_string(),
                owner: entry.owner.clone(),
                cluster_id: entry.cluster_id.clone(),
                params: entry.params.clone(),
                closed: entry.closed_tx.subscribe(),
                ttl_remaining: self.ttl - age,
            }
        };

        debug!("Session {} attached by {}", session_id, caller);
        Ok(attached)
    }

    /// `Connecting -> Active`. Returns false if the session is gone or was
    /// never attached, in which case the bridge must not run.
    pub async fn mark_active(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(entry) if entry.state == TransportState::Connecting => {
                entry.state = TransportState::Active;
                true
            }
            _ => false,
        }
    }

    /// Best-effort `-> Closing` transition as the bridge begins teardown.
    pub async fn mark_closing(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get_mut(session_id) {
            if matches!(
                entry.state,
                TransportState::Connecting | TransportState::Active
            ) {
                entry.state = TransportState::Closing;
            }
        }
    }

    /// Remove a session and fire its close signal. Idempotent: concurrent
    /// callers race on the map removal and only the winner releases.
    pub async fn destroy(&self, session_id: &str) {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id)
        };

        if let Some(entry) = entry {
            self.finish_entry(session_id, entry);
        }
    }

    /// Explicit stop request: only the owner may destroy a session, and a
    /// non-owner learns nothing beyond "not found".
    pub async fn destroy_owned(&self, session_id: &str, caller: &Identity) -> GatewayResult<()> {
        let entry = {
            let mut sessions = self.sessions.lock().await;
            let is_owner = match sessions.get(session_id) {
                None => return Err(GatewayError::NotFound),
                Some(entry) => entry.owner == *caller,
            };
            if !is_owner {
                return Err(GatewayError::Forbidden);
            }
            sessions.remove(session_id)
        };

        if let Some(entry) = entry {
            self.finish_entry(session_id, entry);
        }
        Ok(())
    }

    /// Snapshot of all sessions, taken under the registry lock.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        sessions
            .iter()
            .map(|(id, e)| SessionInfo {
                session_id: id.clone(),
                owner: e.owner.clone(),
                cluster_id: e.cluster_id.clone(),
                state: e.state,
                age: e.created_at.elapsed(),
                created_at: e.created_wall,
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Periodic sweep, in addition to the opportunistic sweep on insertion.
    pub fn spawn_sweeper(self: Arc<Self>) -> JoinHandle<()> {
        let registry = self;
        let period = (registry.ttl / 4)
            .max(Duration::from_secs(1))
            .min(Duration::from_secs(60));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let mut removed = Vec::new();
                {
                    let mut sessions = registry.sessions.lock().await;
                    registry.sweep_locked(&mut sessions, &mut removed);
                }
                for (id, entry) in removed {
                    registry.finish_entry(&id, entry);
                }
            }
        })
    }

    fn sweep_locked(
        &self,
        sessions: &mut HashMap<String, SessionEntry>,
        removed: &mut Vec<(String, SessionEntry)>,
    ) {
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| e.created_at.elapsed() > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(entry) = sessions.remove(&id) {
                debug!("Sweeping expired session {}", id);
                removed.push((id, entry));
            }
        }
    }

    /// The single resource-release sequence: mark closed, wake the bridge,
    /// report usage. Runs exactly once per session because callers only get
    /// here after winning the map removal.
    fn finish_entry(&self, session_id: &str, mut entry: SessionEntry) {
        entry.state = TransportState::Closed;
        let _ = entry.closed_tx.send(true);
        self.usage
            .session_closed(session_id, &entry.owner, &entry.cluster_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::AuthMaterial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        started: AtomicUsize,
        closed: AtomicUsize,
    }

    impl CountingReporter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            })
        }
    }

    impl UsageReporter for CountingReporter {
        fn session_started(&self, _: &str, _: &Identity, _: &str) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        fn session_closed(&self, _: &str, _: &Identity, _: &str) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "10.0.0.4".to_string(),
            port: 22,
            user: "ubuntu".to_string(),
            auth: AuthMaterial::KeyFile("/tmp/id".into()),
        }
    }

    fn alice() -> Identity {
        Identity::new("alice", "acme")
    }

    fn registry(ttl: Duration, max: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(ttl, max, CountingReporter::new()))
    }

    #[tokio::test]
    async fn test_attach_transitions_pending_to_connecting() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        let attached = reg.attach(&id, &alice()).await.unwrap();
        assert_eq!(attached.session_id, id);
        assert_eq!(attached.cluster_id, "node-a");
        assert!(reg.mark_active(&id).await);
    }

    #[tokio::test]
    async fn test_second_attach_conflicts() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        let _first = reg.attach(&id, &alice()).await.unwrap();
        assert!(matches!(
            reg.attach(&id, &alice()).await,
            Err(GatewayError::Conflict)
        ));

        // Still in conflict once active.
        reg.mark_active(&id).await;
        assert!(matches!(
            reg.attach(&id, &alice()).await,
            Err(GatewayError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_exactly_one_concurrent_attach_wins() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(
                async move { reg.attach(&id, &alice()).await },
            ));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => wins += 1,
                Err(GatewayError::Conflict) => conflicts += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
    }

    #[tokio::test]
    async fn test_expired_session_cannot_attach() {
        let reg = registry(Duration::from_millis(20), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            reg.attach(&id, &alice()).await,
            Err(GatewayError::Expired)
        ));

        // Reaped on the failed attach.
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn test_mismatched_owner_forbidden() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        let bob = Identity::new("bob", "acme");
        assert!(matches!(
            reg.attach(&id, &bob).await,
            Err(GatewayError::Forbidden)
        ));

        // The rightful owner still attaches afterwards.
        assert!(reg.attach(&id, &alice()).await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let usage = CountingReporter::new();
        let reg = Arc::new(SessionRegistry::new(
            Duration::from_secs(60),
            8,
            usage.clone(),
        ));
        let id = reg.create(alice(), "node-a".to_string(), params()).await;
        let _attached = reg.attach(&id, &alice()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let reg = reg.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move { reg.destroy(&id).await }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(usage.closed.load(Ordering::SeqCst), 1);
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_fires_close_signal() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;
        let mut attached = reg.attach(&id, &alice()).await.unwrap();

        reg.destroy(&id).await;
        // Either the value changed or the sender dropped; both mean closed.
        let changed = attached.closed.changed().await;
        assert!(changed.is_ok() || changed.is_err());
        if changed.is_ok() {
            assert!(*attached.closed.borrow());
        }
    }

    #[tokio::test]
    async fn test_registry_bound_evicts_oldest_never_newest() {
        let reg = registry(Duration::from_secs(60), 3);

        let first = reg.create(alice(), "node-0".to_string(), params()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut rest = Vec::new();
        for i in 1..5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
            rest.push(reg.create(alice(), format!("node-{i}"), params()).await);
        }

        assert_eq!(reg.len().await, 3);

        let snapshot = reg.snapshot().await;
        let ids: Vec<&str> = snapshot.iter().map(|s| s.session_id.as_str()).collect();

        // Oldest entries went first; the most recent insert always survives.
        assert!(!ids.contains(&first.as_str()));
        assert!(ids.contains(&rest.last().unwrap().as_str()));
    }

    #[tokio::test]
    async fn test_periodic_sweep_reaps_expired_sessions() {
        let reg = registry(Duration::from_millis(50), 8);
        let _sweeper = reg.clone().spawn_sweeper();

        reg.create(alice(), "node-a".to_string(), params()).await;
        assert_eq!(reg.len().await, 1);

        // Sweep period clamps to 1s; wait for it to fire once.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn test_destroy_owned_checks_owner() {
        let reg = registry(Duration::from_secs(60), 8);
        let id = reg.create(alice(), "node-a".to_string(), params()).await;

        let bob = Identity::new("bob", "acme");
        assert!(matches!(
            reg.destroy_owned(&id, &bob).await,
            Err(GatewayError::Forbidden)
        ));
        assert_eq!(reg.len().await, 1);

        reg.destroy_owned(&id, &alice()).await.unwrap();
        assert_eq!(reg.len().await, 0);

        assert!(matches!(
            reg.destroy_owned(&id, &alice()).await,
            Err(GatewayError::NotFound)
        ));
    }
}
