//! Agent registry for tracking live agent sessions
//!
//! Each session owns a bounded outbound queue drained by its stream's writer.
//! The queue sender sits behind a per-session connection state so that closing
//! it and sending on it are serialized: once a session is unregistered every
//! send fails with `AgentDisconnected` or `AgentNotFound`.

use canopy_proto::{
    AgentConfig, AgentHealth, Command, ConfigUpdate, Heartbeat, Registration, ServerMessage,
    ServerPayload,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Outbound queue capacity per session
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent disconnected: {0}")]
    AgentDisconnected(String),

    #[error("send channel full for agent: {0}")]
    SendChannelFull(String),
}

/// Snapshot of one session's state
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub agent_version: String,
    pub runtime_version: String,
    pub capabilities: BTreeSet<String>,
    pub labels: HashMap<String, String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub status: AgentHealth,
    pub active_jobs: u32,
}

impl SessionInfo {
    /// Fresh session state for a registration, healthy and heartbeating now
    pub fn from_registration(session_id: impl Into<String>, registration: &Registration) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            cluster_id: registration.cluster_id.clone(),
            cluster_name: registration.cluster_name.clone(),
            agent_version: registration.agent_version.clone(),
            runtime_version: registration.runtime_version.clone(),
            capabilities: registration.capabilities.clone(),
            labels: registration.labels.clone(),
            connected_at: now,
            last_heartbeat: now,
            status: AgentHealth::Unspecified,
            active_jobs: 0,
        }
    }
}

/// Delivery state of a session's outbound queue
#[derive(Debug)]
enum ConnectionState {
    Open(mpsc::Sender<ServerMessage>),
    Closed,
}

#[derive(Debug)]
struct SessionEntry {
    info: SessionInfo,
    connection: Arc<Mutex<ConnectionState>>,
}

/// Registry of connected agent sessions
///
/// Cheap to clone; clones share the same sessions.
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
    queue_capacity: usize,
}

impl AgentRegistry {
    /// Create a new empty agent registry
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create an empty registry whose per-session queues hold `queue_capacity` messages
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session with a freshly allocated outbound queue
    ///
    /// Returns the receiving end of the queue for the session's writer.
    pub fn register(&self, info: SessionInfo) -> mpsc::Receiver<ServerMessage> {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.register_with_sender(info, tx);
        rx
    }

    /// Register a session whose outbound queue the caller supplies
    ///
    /// A session already registered under the same id is replaced and its
    /// queue closed.
    pub fn register_with_sender(&self, mut info: SessionInfo, sender: mpsc::Sender<ServerMessage>) {
        let now = Utc::now();
        info.connected_at = now;
        info.last_heartbeat = now;

        let session_id = info.session_id.clone();
        let cluster_id = info.cluster_id.clone();
        let entry = SessionEntry {
            info,
            connection: Arc::new(Mutex::new(ConnectionState::Open(sender))),
        };

        let replaced = self.write().insert(session_id.clone(), entry);

        if let Some(old) = replaced {
            close(&old.connection);
            tracing::warn!(
                session_id = %session_id,
                cluster_id = %cluster_id,
                "Re-registered session id, closed previous queue"
            );
        } else {
            tracing::info!(
                session_id = %session_id,
                cluster_id = %cluster_id,
                "Registered agent session"
            );
        }
    }

    /// Remove a session and close its queue
    ///
    /// Idempotent. Returns the final session state if it was registered.
    pub fn unregister(&self, session_id: &str) -> Option<SessionInfo> {
        let removed = self.write().remove(session_id);

        match removed {
            Some(entry) => {
                close(&entry.connection);
                tracing::info!(
                    session_id = %session_id,
                    cluster_id = %entry.info.cluster_id,
                    "Unregistered agent session"
                );
                Some(entry.info)
            }
            None => {
                tracing::debug!(session_id = %session_id, "Session already unregistered");
                None
            }
        }
    }

    /// Snapshot of a session, if registered
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.read().get(session_id).map(|entry| entry.info.clone())
    }

    /// Snapshots of all registered sessions
    pub fn list(&self) -> Vec<SessionInfo> {
        self.read().values().map(|entry| entry.info.clone()).collect()
    }

    /// All sessions declaring the given cluster
    pub fn get_by_cluster(&self, cluster_id: &str) -> Vec<SessionInfo> {
        self.read()
            .values()
            .filter(|entry| entry.info.cluster_id == cluster_id)
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Number of registered sessions
    pub fn count(&self) -> usize {
        self.read().len()
    }

    /// Record a heartbeat; returns false if the session is gone
    pub fn update_heartbeat(&self, session_id: &str, heartbeat: &Heartbeat) -> bool {
        let mut sessions = self.write();
        match sessions.get_mut(session_id) {
            Some(entry) => {
                entry.info.last_heartbeat = Utc::now();
                entry.info.status = heartbeat.status;
                entry.info.active_jobs = heartbeat.active_jobs;
                tracing::debug!(
                    session_id = %session_id,
                    status = %heartbeat.status,
                    active_jobs = heartbeat.active_jobs,
                    "Heartbeat"
                );
                true
            }
            None => false,
        }
    }

    /// Queue a command for the session; returns the envelope's message id
    pub fn send_command(&self, session_id: &str, command: Command) -> Result<String, RegistryError> {
        self.send(session_id, ServerPayload::Command(command))
    }

    /// Queue a configuration update for the session; returns the message id
    pub fn send_config_update(
        &self,
        session_id: &str,
        config: AgentConfig,
    ) -> Result<String, RegistryError> {
        self.send(session_id, ServerPayload::ConfigUpdate(ConfigUpdate { config }))
    }

    fn send(&self, session_id: &str, payload: ServerPayload) -> Result<String, RegistryError> {
        let connection = self
            .read()
            .get(session_id)
            .map(|entry| Arc::clone(&entry.connection))
            .ok_or_else(|| RegistryError::AgentNotFound(session_id.to_string()))?;

        let message = ServerMessage::new(payload);
        let message_id = message.message_id.clone();
        let kind = message.kind();

        let state = lock(&connection);
        let sender = match &*state {
            ConnectionState::Open(sender) => sender,
            ConnectionState::Closed => {
                return Err(RegistryError::AgentDisconnected(session_id.to_string()))
            }
        };

        match sender.try_send(message) {
            Ok(()) => {
                tracing::debug!(session_id = %session_id, message_id = %message_id, kind, "Queued message");
                Ok(message_id)
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %session_id, kind, "Outbound queue full");
                Err(RegistryError::SendChannelFull(session_id.to_string()))
            }
            Err(TrySendError::Closed(_)) => {
                Err(RegistryError::AgentDisconnected(session_id.to_string()))
            }
        }
    }

    /// Mark sessions whose last heartbeat is older than `timeout` as unhealthy
    ///
    /// Only annotates status; sessions are never evicted here. Returns the ids
    /// that were newly marked.
    pub fn check_health(&self, timeout: Duration) -> Vec<String> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut marked = Vec::new();

        for entry in self.write().values_mut() {
            if now - entry.info.last_heartbeat > timeout && entry.info.status != AgentHealth::Unhealthy {
                entry.info.status = AgentHealth::Unhealthy;
                tracing::warn!(
                    session_id = %entry.info.session_id,
                    cluster_id = %entry.info.cluster_id,
                    last_heartbeat = %entry.info.last_heartbeat,
                    "Agent heartbeat is stale, marking unhealthy"
                );
                marked.push(entry.info.session_id.clone());
            }
        }

        marked
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(connection: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    connection.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transition to `Closed`, dropping the sender exactly once
fn close(connection: &Mutex<ConnectionState>) {
    let previous = std::mem::replace(&mut *lock(connection), ConnectionState::Closed);
    drop(previous);
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_proto::CommandKind;

    fn session(session_id: &str, cluster_id: &str) -> SessionInfo {
        SessionInfo::from_registration(
            session_id,
            &Registration {
                cluster_id: cluster_id.to_string(),
                cluster_name: format!("{} cluster", cluster_id),
                agent_version: "1.0.0".to_string(),
                runtime_version: "1.18.1".to_string(),
                ..Default::default()
            },
        )
    }

    fn restart(job_id: &str) -> Command {
        Command::new(CommandKind::RestartJob {
            job_id: job_id.to_string(),
        })
    }

    #[test]
    fn test_register_many() {
        let registry = AgentRegistry::new();
        let mut queues = Vec::new();
        for i in 0..10 {
            queues.push(registry.register(session(&format!("s-{}", i), &format!("c-{}", i))));
        }

        assert_eq!(registry.count(), 10);
        assert_eq!(registry.list().len(), 10);
        assert!(registry.get("s-3").is_some());
        assert!(registry.get("s-42").is_none());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = AgentRegistry::new();
        let _queue = registry.register(session("s-1", "c-1"));

        assert!(registry.unregister("s-1").is_some());
        assert!(registry.unregister("s-1").is_none());
        assert!(registry.unregister("s-1").is_none());
        assert!(registry.get("s-1").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_unregister_closes_queue() {
        let registry = AgentRegistry::new();
        let mut queue = registry.register(session("s-1", "c-1"));

        registry.send_command("s-1", restart("job-1")).unwrap();
        registry.unregister("s-1");

        // Buffered messages drain, then the queue reports closed
        assert!(queue.try_recv().is_ok());
        assert!(matches!(
            queue.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_snapshots_are_independent() {
        let registry = AgentRegistry::new();
        let _queue = registry.register(session("s-1", "c-1"));

        let mut snapshot = registry.get("s-1").unwrap();
        snapshot.cluster_id = "tampered".to_string();
        snapshot.status = AgentHealth::Unhealthy;

        let fresh = registry.get("s-1").unwrap();
        assert_eq!(fresh.cluster_id, "c-1");
        assert_eq!(fresh.status, AgentHealth::Unspecified);
    }

    #[test]
    fn test_get_by_cluster() {
        let registry = AgentRegistry::new();
        let _a = registry.register(session("s-1", "shared"));
        let _b = registry.register(session("s-2", "shared"));
        let _c = registry.register(session("s-3", "other"));

        let mut ids: Vec<_> = registry
            .get_by_cluster("shared")
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["s-1", "s-2"]);
        assert!(registry.get_by_cluster("missing").is_empty());
    }

    #[test]
    fn test_update_heartbeat() {
        let registry = AgentRegistry::new();
        let _queue = registry.register(session("s-1", "c-1"));
        let before = registry.get("s-1").unwrap().last_heartbeat;

        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.update_heartbeat(
            "s-1",
            &Heartbeat {
                status: AgentHealth::Healthy,
                active_jobs: 4,
            }
        ));

        let info = registry.get("s-1").unwrap();
        assert_eq!(info.status, AgentHealth::Healthy);
        assert_eq!(info.active_jobs, 4);
        assert!(info.last_heartbeat > before);

        assert!(!registry.update_heartbeat("missing", &Heartbeat::default()));
    }

    #[test]
    fn test_send_errors() {
        let registry = AgentRegistry::with_queue_capacity(2);

        assert_eq!(
            registry.send_command("missing", restart("j")),
            Err(RegistryError::AgentNotFound("missing".to_string()))
        );

        let _queue = registry.register(session("s-1", "c-1"));
        registry.send_command("s-1", restart("j1")).unwrap();
        registry.send_command("s-1", restart("j2")).unwrap();
        assert_eq!(
            registry.send_command("s-1", restart("j3")),
            Err(RegistryError::SendChannelFull("s-1".to_string()))
        );

        // Writer gone while the session is still registered
        let queue = registry.register(session("s-2", "c-2"));
        drop(queue);
        assert_eq!(
            registry.send_config_update("s-2", AgentConfig::default()),
            Err(RegistryError::AgentDisconnected("s-2".to_string()))
        );
    }

    #[test]
    fn test_messages_delivered_in_order() {
        let registry = AgentRegistry::new();
        let mut queue = registry.register(session("s-1", "c-1"));

        let ids: Vec<String> = (0..5)
            .map(|i| registry.send_command("s-1", restart(&format!("job-{}", i))).unwrap())
            .collect();

        for id in ids {
            assert_eq!(queue.try_recv().unwrap().message_id, id);
        }
    }

    #[test]
    fn test_injected_queue() {
        let registry = AgentRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register_with_sender(session("s-1", "c-1"), tx);

        let id = registry
            .send_config_update(
                "s-1",
                AgentConfig {
                    heartbeat_interval_secs: 10,
                    metrics_interval_secs: 20,
                },
            )
            .unwrap();

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.message_id, id);
        assert!(matches!(msg.payload, ServerPayload::ConfigUpdate(_)));
    }

    #[test]
    fn test_reregister_replaces_session() {
        let registry = AgentRegistry::new();
        let mut first = registry.register(session("s-1", "c-1"));
        let _second = registry.register(session("s-1", "c-1"));

        assert_eq!(registry.count(), 1);
        assert!(matches!(
            first.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_check_health_only_marks_when_run() {
        let registry = AgentRegistry::new();
        let _stale = registry.register(session("s-stale", "c-1"));

        std::thread::sleep(Duration::from_millis(30));
        let _fresh = registry.register(session("s-fresh", "c-2"));

        // Nothing changes until the sweep runs
        assert_eq!(registry.get("s-stale").unwrap().status, AgentHealth::Unspecified);

        let marked = registry.check_health(Duration::from_millis(20));
        assert_eq!(marked, vec!["s-stale".to_string()]);
        assert_eq!(registry.get("s-stale").unwrap().status, AgentHealth::Unhealthy);
        assert_eq!(registry.get("s-fresh").unwrap().status, AgentHealth::Unspecified);

        // Annotation only: the session stays registered
        assert_eq!(registry.count(), 2);
        assert!(registry.check_health(Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn test_concurrent_unregister_and_send() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = AgentRegistry::with_queue_capacity(10_000);
        let _queue = registry.register(session("s-1", "c-1"));
        let unregistered = Arc::new(AtomicBool::new(false));

        let senders: Vec<_> = (0..4)
            .map(|t| {
                let registry = registry.clone();
                let unregistered = Arc::clone(&unregistered);
                std::thread::spawn(move || {
                    for i in 0..2_000 {
                        let after = unregistered.load(Ordering::SeqCst);
                        let result =
                            registry.send_command("s-1", restart(&format!("job-{}-{}", t, i)));
                        if after {
                            assert!(
                                matches!(
                                    result,
                                    Err(RegistryError::AgentNotFound(_))
                                        | Err(RegistryError::AgentDisconnected(_))
                                ),
                                "send after unregister returned {:?}",
                                result
                            );
                        }
                    }
                })
            })
            .collect();

        std::thread::sleep(Duration::from_millis(1));
        registry.unregister("s-1");
        unregistered.store(true, Ordering::SeqCst);

        for sender in senders {
            sender.join().unwrap();
        }
        assert_eq!(registry.count(), 0);
    }
}
