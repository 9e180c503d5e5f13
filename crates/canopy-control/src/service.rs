//! Streaming control service
//!
//! Handles the registration handshake and message loops of each agent stream,
//! answers the unary calls and runs the periodic health sweep.

use crate::broker::CredentialBroker;
use crate::identity::{IdentityPolicy, PeerIdentity};
use crate::registry::{AgentRegistry, SessionInfo};
use crate::sink::{LoggingSink, SessionContext, TelemetrySink};
use canopy_proto::{
    AgentConfig, AgentMessage, AgentPayload, AgentStatusResponse, Call, ConnectionStatus,
    CredentialStatus, CredentialsRequest, CredentialsResponse, HealthCheckResponse, Registration,
    RegistrationAck, Reply, RpcStatus, ServerMessage, ServerPayload, ServingStatus,
    StatusResponse,
};
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Floor on the health sweep period; a zero interval would spin
const MIN_HEALTH_CHECK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Heartbeat staleness after which a session is marked UNHEALTHY
    pub heartbeat_timeout: Duration,
    /// Interval of the background health sweep
    pub health_check_interval: Duration,
    /// Operating parameters sent to agents in the registration ack
    pub agent_config: AgentConfig,
    pub identity_policy: IdentityPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(90),
            health_check_interval: Duration::from_secs(30),
            agent_config: AgentConfig::default(),
            identity_policy: IdentityPolicy::default(),
        }
    }
}

/// The control-plane service shared by every connection
pub struct ControlService {
    registry: AgentRegistry,
    broker: Arc<CredentialBroker>,
    sink: Arc<dyn TelemetrySink>,
    config: ServiceConfig,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    health_checker_started: AtomicBool,
}

impl ControlService {
    pub fn new(registry: AgentRegistry, broker: Arc<CredentialBroker>, config: ServiceConfig) -> Self {
        if config.identity_policy == IdentityPolicy::TrustDeclared {
            warn!("Agent registrations are trusted at face value; certificate identities are not checked");
        }
        Self {
            registry,
            broker,
            sink: Arc::new(LoggingSink),
            config,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            health_checker_started: AtomicBool::new(false),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<CredentialBroker> {
        &self.broker
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Start the periodic health sweep; it runs until [`shutdown`](Self::shutdown)
    ///
    /// Only the first call starts a sweep.
    pub fn start_health_checker(&self) {
        if self.health_checker_started.swap(true, Ordering::SeqCst) {
            debug!("Health checker already running");
            return;
        }

        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let interval = self
            .config
            .health_check_interval
            .max(MIN_HEALTH_CHECK_INTERVAL);
        let timeout = self.config.heartbeat_timeout;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let unhealthy = registry.check_health(timeout);
                        if !unhealthy.is_empty() {
                            warn!(count = unhealthy.len(), "Agents missed their heartbeat deadline");
                        }
                    }
                }
            }
            debug!("Health checker stopped");
        });

        info!(
            interval_ms = interval.as_millis() as u64,
            timeout_secs = timeout.as_secs(),
            "Health checker started"
        );
    }

    /// Stop background tasks and wait for them to exit
    ///
    /// Live sessions are left to drain on their own.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Control service stopped");
    }

    pub fn health_check(&self) -> HealthCheckResponse {
        HealthCheckResponse {
            status: ServingStatus::Serving,
        }
    }

    /// Live-connection status of a cluster, independent of its credentials
    pub fn get_agent_status(&self, cluster_id: &str) -> Result<AgentStatusResponse, RpcStatus> {
        if cluster_id.is_empty() {
            return Err(RpcStatus::invalid_argument("cluster_id is required"));
        }

        let latest = self
            .registry
            .get_by_cluster(cluster_id)
            .into_iter()
            .max_by_key(|session| session.last_heartbeat);

        Ok(match latest {
            Some(session) => AgentStatusResponse {
                status: ConnectionStatus::Connected,
                session_id: Some(session.session_id),
                last_seen: Some(session.last_heartbeat),
                health_status: Some(session.status),
            },
            None => AgentStatusResponse::disconnected(),
        })
    }

    pub fn request_credentials(
        &self,
        request: &CredentialsRequest,
    ) -> Result<CredentialsResponse, RpcStatus> {
        Ok(self.broker.request_credentials(request)?)
    }

    pub fn check_status(&self, cluster_id: &str) -> Result<StatusResponse, RpcStatus> {
        Ok(self.broker.check_status(cluster_id)?)
    }

    /// Answer a unary call
    pub fn handle_unary(&self, call: Call) -> Result<Reply, RpcStatus> {
        match call {
            Call::HealthCheck => Ok(Reply::Health(self.health_check())),
            Call::GetAgentStatus(request) => self
                .get_agent_status(&request.cluster_id)
                .map(Reply::AgentStatus),
            Call::RequestCredentials(request) => {
                self.request_credentials(&request).map(Reply::Credentials)
            }
            Call::CheckStatus(request) => self.check_status(&request.cluster_id).map(Reply::Status),
            Call::AgentStream => Err(RpcStatus::invalid_argument(
                "AgentStream is a streaming call",
            )),
        }
    }

    /// Run one agent stream to completion
    ///
    /// Returns once both message loops have exited and the session has been
    /// unregistered. End of input, a closed outbound queue or `cancel` end the
    /// stream normally.
    pub async fn agent_stream<I, O>(
        &self,
        mut inbound: I,
        mut outbound: O,
        peer: &PeerIdentity,
        cancel: CancellationToken,
    ) -> Result<(), RpcStatus>
    where
        I: Stream<Item = Result<AgentMessage, RpcStatus>> + Unpin + Send + 'static,
        O: Sink<ServerMessage, Error = RpcStatus> + Unpin + Send + 'static,
    {
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            first = inbound.next() => first,
        };
        let registration = match first {
            Some(Ok(AgentMessage {
                payload: AgentPayload::Registration(registration),
                ..
            })) => registration,
            Some(Ok(other)) => {
                return Err(RpcStatus::invalid_argument(format!(
                    "first message must be a registration, got {}",
                    other.kind()
                )))
            }
            Some(Err(status)) => {
                return Err(RpcStatus::invalid_argument(format!(
                    "failed to receive registration: {}",
                    status.message
                )))
            }
            None => {
                return Err(RpcStatus::invalid_argument(
                    "stream closed before registration",
                ))
            }
        };

        if registration.cluster_id.is_empty() {
            return Err(RpcStatus::invalid_argument("cluster_id is required"));
        }
        if registration.cluster_name.is_empty() {
            return Err(RpcStatus::invalid_argument("cluster_name is required"));
        }
        self.authorize(peer, &registration)?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let queue = self
            .registry
            .register(SessionInfo::from_registration(&session_id, &registration));
        let _session = SessionGuard {
            registry: self.registry.clone(),
            session_id: session_id.clone(),
        };

        info!(
            session_id = %session_id,
            cluster_id = %registration.cluster_id,
            cluster_name = %registration.cluster_name,
            agent_version = %registration.agent_version,
            peer = %peer,
            "Agent registered"
        );

        let ack = RegistrationAck {
            session_id: session_id.clone(),
            welcome_message: format!("Welcome {}!", registration.cluster_name),
            server_time: Utc::now(),
            config: self.config.agent_config,
        };
        outbound
            .send(ServerMessage::new(ServerPayload::RegistrationAck(ack)))
            .await?;

        let session_cancel = cancel.child_token();
        let inbound_task = tokio::spawn(inbound_loop(
            inbound,
            self.registry.clone(),
            Arc::clone(&self.sink),
            session_id.clone(),
            registration.cluster_id.clone(),
            session_cancel.clone(),
        ));
        let outbound_task = tokio::spawn(outbound_loop(
            queue,
            outbound,
            session_id.clone(),
            session_cancel,
        ));

        let (inbound_result, outbound_result) = tokio::join!(inbound_task, outbound_task);
        let result = match (flatten(inbound_result), flatten(outbound_result)) {
            (Err(e), _) | (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        };

        match &result {
            Ok(()) => info!(session_id = %session_id, "Agent stream closed"),
            Err(status) => warn!(session_id = %session_id, status = %status, "Agent stream failed"),
        }
        result
    }

    fn authorize(&self, peer: &PeerIdentity, registration: &Registration) -> Result<(), RpcStatus> {
        if self.config.identity_policy == IdentityPolicy::TrustDeclared {
            return Ok(());
        }

        let agent_id = match peer {
            PeerIdentity::Agent { agent_id } => agent_id,
            PeerIdentity::Anonymous => {
                return Err(RpcStatus::unauthenticated(
                    "a client certificate is required to open an agent stream",
                ))
            }
            PeerIdentity::Other { .. } => {
                return Err(RpcStatus::unauthenticated(format!(
                    "certificate {} is not an agent certificate",
                    peer
                )))
            }
        };

        let cluster_id = &registration.cluster_id;
        match self.broker.get_agent(cluster_id) {
            Some(record)
                if record.status == CredentialStatus::Approved
                    && record.agent_id.as_deref() == Some(agent_id.as_str()) =>
            {
                Ok(())
            }
            Some(record) if record.status == CredentialStatus::Approved => {
                warn!(cluster_id = %cluster_id, peer = %peer, "Certificate does not match cluster credentials");
                Err(RpcStatus::permission_denied(format!(
                    "certificate is not bound to cluster {}",
                    cluster_id
                )))
            }
            Some(record) => Err(RpcStatus::permission_denied(format!(
                "credentials for cluster {} are {}",
                cluster_id, record.status
            ))),
            None => Err(RpcStatus::permission_denied(format!(
                "no credentials issued for cluster {}",
                cluster_id
            ))),
        }
    }
}

/// Unregisters the session however the stream ends
struct SessionGuard {
    registry: AgentRegistry,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.registry.unregister(&self.session_id).is_some() {
            debug!(session_id = %self.session_id, "Session unregistered");
        }
    }
}

fn flatten(result: Result<Result<(), RpcStatus>, JoinError>) -> Result<(), RpcStatus> {
    result.unwrap_or_else(|e| Err(RpcStatus::internal(format!("session task failed: {}", e))))
}

async fn inbound_loop<I>(
    mut inbound: I,
    registry: AgentRegistry,
    sink: Arc<dyn TelemetrySink>,
    session_id: String,
    cluster_id: String,
    cancel: CancellationToken,
) -> Result<(), RpcStatus>
where
    I: Stream<Item = Result<AgentMessage, RpcStatus>> + Unpin,
{
    let _done = cancel.clone().drop_guard();

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = inbound.next() => msg,
        };
        let msg = match msg {
            None => {
                debug!(session_id = %session_id, "Agent closed its side of the stream");
                return Ok(());
            }
            Some(Err(status)) => return Err(status),
            Some(Ok(msg)) => msg,
        };

        let context = SessionContext {
            session_id: session_id.clone(),
            cluster_id: cluster_id.clone(),
            message_id: msg.message_id,
            timestamp: msg.timestamp,
        };
        match msg.payload {
            AgentPayload::Heartbeat(heartbeat) => {
                debug!(
                    session_id = %session_id,
                    status = %heartbeat.status,
                    active_jobs = heartbeat.active_jobs,
                    "Heartbeat"
                );
                registry.update_heartbeat(&session_id, &heartbeat);
            }
            AgentPayload::Metrics(report) => sink.record_metrics(&context, &report).await,
            AgentPayload::Event(event) => sink.record_event(&context, &event).await,
            AgentPayload::CommandResult(result) => {
                sink.record_command_result(&context, &result).await
            }
            AgentPayload::Registration(_) => {
                warn!(session_id = %session_id, "Ignoring repeated registration");
            }
        }
    }
}

async fn outbound_loop<O>(
    mut queue: mpsc::Receiver<ServerMessage>,
    mut outbound: O,
    session_id: String,
    cancel: CancellationToken,
) -> Result<(), RpcStatus>
where
    O: Sink<ServerMessage, Error = RpcStatus> + Unpin,
{
    let _done = cancel.clone().drop_guard();

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            msg = queue.recv() => msg,
        };
        match msg {
            Some(msg) => {
                debug!(session_id = %session_id, message_id = %msg.message_id, kind = msg.kind(), "Sending to agent");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = outbound.send(msg) => sent?,
                }
            }
            None => {
                debug!(session_id = %session_id, "Outbound queue closed");
                return Ok(());
            }
        }
    }
}
