//! Streaming message envelopes
//!
//! Every message on the agent stream is wrapped in an envelope carrying a
//! unique id and a UTC timestamp. Payloads are closed enums so both sides
//! match them exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Agent → control plane envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: AgentPayload,
}

impl AgentMessage {
    /// Wrap a payload with a fresh message id and the current time
    pub fn new(payload: AgentPayload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Short name of the payload variant, for logging
    pub fn kind(&self) -> &'static str {
        match self.payload {
            AgentPayload::Registration(_) => "registration",
            AgentPayload::Heartbeat(_) => "heartbeat",
            AgentPayload::Metrics(_) => "metrics",
            AgentPayload::Event(_) => "event",
            AgentPayload::CommandResult(_) => "command_result",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AgentPayload {
    Registration(Registration),
    Heartbeat(Heartbeat),
    Metrics(MetricsReport),
    Event(EventReport),
    CommandResult(CommandResult),
}

/// First message of every agent stream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Registration {
    pub cluster_id: String,
    pub cluster_name: String,
    pub agent_version: String,
    /// Version of the orchestration runtime the agent manages
    pub runtime_version: String,
    pub capabilities: BTreeSet<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentHealth {
    #[default]
    Unspecified,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentHealth::Unspecified => "UNSPECIFIED",
            AgentHealth::Healthy => "HEALTHY",
            AgentHealth::Unhealthy => "UNHEALTHY",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Heartbeat {
    pub status: AgentHealth,
    pub active_jobs: u32,
}

/// Lifecycle state of a job running on the managed cluster
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobState {
    #[default]
    Unspecified,
    Created,
    Running,
    Failing,
    Failed,
    Cancelling,
    Canceled,
    Finished,
    Restarting,
    Suspended,
    Reconciling,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackpressureLevel {
    #[default]
    Unspecified,
    Ok,
    Low,
    High,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub job_id: String,
    pub name: String,
    pub state: JobState,
    pub parallelism: u32,
    pub records_in_per_sec: f64,
    pub records_out_per_sec: f64,
    pub backpressure: BackpressureLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsReport {
    pub jobs: Vec<JobMetrics>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventSeverity {
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventReport {
    pub event_type: String,
    pub severity: EventSeverity,
    pub message: String,
    pub job_id: Option<String>,
}

/// Outcome of a command previously pushed to the agent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandResult {
    pub command_id: String,
    pub success: bool,
    pub message: String,
}

/// Control plane → agent envelope
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerMessage {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: ServerPayload,
}

impl ServerMessage {
    /// Wrap a payload with a fresh message id and the current time
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            ServerPayload::RegistrationAck(_) => "registration_ack",
            ServerPayload::Command(_) => "command",
            ServerPayload::ConfigUpdate(_) => "config_update",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerPayload {
    RegistrationAck(RegistrationAck),
    Command(Command),
    ConfigUpdate(ConfigUpdate),
}

/// Reporting cadence the control plane asks the agent to use
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentConfig {
    pub heartbeat_interval_secs: u32,
    pub metrics_interval_secs: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            metrics_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistrationAck {
    pub session_id: String,
    pub welcome_message: String,
    pub server_time: DateTime<Utc>,
    pub config: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub command_id: String,
    pub kind: CommandKind,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            kind,
        }
    }
}

/// Operations the control plane can ask an agent to perform on its cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommandKind {
    ScaleJob {
        job_id: String,
        new_parallelism: u32,
    },
    TriggerSavepoint {
        job_id: String,
        target_directory: Option<String>,
    },
    CancelJob {
        job_id: String,
        with_savepoint: bool,
    },
    RestartJob {
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub config: AgentConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = AgentMessage::new(AgentPayload::Heartbeat(Heartbeat::default()));
        let b = AgentMessage::new(AgentPayload::Heartbeat(Heartbeat::default()));
        assert_ne!(a.message_id, b.message_id);
        assert!(uuid::Uuid::parse_str(&a.message_id).is_ok());
    }

    #[test]
    fn test_registration_serialization() {
        let mut registration = Registration {
            cluster_id: "prod-eu-1".to_string(),
            cluster_name: "Production EU".to_string(),
            agent_version: "1.4.0".to_string(),
            runtime_version: "1.18.1".to_string(),
            ..Default::default()
        };
        registration.capabilities.insert("savepoints".to_string());
        registration
            .labels
            .insert("region".to_string(), "eu-west-1".to_string());

        let msg = AgentMessage::new(AgentPayload::Registration(registration.clone()));
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: AgentMessage = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded, msg);
        match decoded.payload {
            AgentPayload::Registration(r) => assert_eq!(r, registration),
            other => panic!("Expected registration, got {:?}", other),
        }
    }

    #[test]
    fn test_command_serialization() {
        let command = Command::new(CommandKind::TriggerSavepoint {
            job_id: "job-42".to_string(),
            target_directory: Some("s3://savepoints/job-42".to_string()),
        });
        let msg = ServerMessage::new(ServerPayload::Command(command.clone()));
        assert_eq!(msg.kind(), "command");

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ServerMessage = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.payload, ServerPayload::Command(command));
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.metrics_interval_secs, 60);
    }
}
