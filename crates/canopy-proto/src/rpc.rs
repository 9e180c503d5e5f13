//! Call/reply types and the connection frame
//!
//! A connection carries exactly one call. The client opens it with
//! [`Frame::Open`]; unary calls are answered with a single [`Frame::Reply`],
//! while the agent stream exchanges [`Frame::Agent`] / [`Frame::Server`]
//! frames until either side sends [`Frame::Close`].

use crate::messages::{AgentHealth, AgentMessage, ServerMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Everything that travels over a control-plane connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    Open(Call),
    Reply(Result<Reply, RpcStatus>),
    Agent(AgentMessage),
    Server(ServerMessage),
    /// End of stream; `None` is a clean close
    Close(Option<RpcStatus>),
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Call {
    AgentStream,
    HealthCheck,
    GetAgentStatus(AgentStatusRequest),
    RequestCredentials(CredentialsRequest),
    CheckStatus(StatusRequest),
}

impl Call {
    pub fn name(&self) -> &'static str {
        match self {
            Call::AgentStream => "AgentStream",
            Call::HealthCheck => "HealthCheck",
            Call::GetAgentStatus(_) => "GetAgentStatus",
            Call::RequestCredentials(_) => "RequestCredentials",
            Call::CheckStatus(_) => "CheckStatus",
        }
    }

    /// Calls an unauthenticated peer may make while enrolling
    pub fn is_enrollment(&self) -> bool {
        matches!(
            self,
            Call::HealthCheck | Call::RequestCredentials(_) | Call::CheckStatus(_)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Reply {
    Health(HealthCheckResponse),
    AgentStatus(AgentStatusResponse),
    Credentials(CredentialsResponse),
    Status(StatusResponse),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStatusRequest {
    pub cluster_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentStatusResponse {
    pub status: ConnectionStatus,
    pub session_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub health_status: Option<AgentHealth>,
}

impl AgentStatusResponse {
    pub fn disconnected() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            session_id: None,
            last_seen: None,
            health_status: None,
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialsRequest {
    pub cluster_id: String,
    pub cluster_name: String,
    /// Pre-shared token; any non-empty value auto-approves in development mode
    pub api_token: Option<String>,
    pub agent_version: String,
    pub runtime_version: String,
}

impl fmt::Debug for CredentialsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialsRequest")
            .field("cluster_id", &self.cluster_id)
            .field("cluster_name", &self.cluster_name)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("agent_version", &self.agent_version)
            .field("runtime_version", &self.runtime_version)
            .finish()
    }
}

/// Credential material returned once a request is approved
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovedCredentials {
    pub agent_id: String,
    pub agent_secret: String,
    pub client_cert_pem: String,
    pub client_key_pem: String,
    pub ca_cert_pem: String,
}

impl fmt::Debug for ApprovedCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApprovedCredentials")
            .field("agent_id", &self.agent_id)
            .field("agent_secret", &"[REDACTED]")
            .field("client_cert_pem", &format!("{} bytes", self.client_cert_pem.len()))
            .field("client_key_pem", &"[REDACTED]")
            .field("ca_cert_pem", &format!("{} bytes", self.ca_cert_pem.len()))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum CredentialsResponse {
    Approved(ApprovedCredentials),
    Pending {
        message: String,
        poll_interval_secs: u32,
    },
    Rejected {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRequest {
    pub cluster_id: String,
}

/// Lifecycle of a cluster's credential record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CredentialStatus {
    Unknown,
    Pending,
    Approved,
    Rejected,
    Revoked,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialStatus::Unknown => "UNKNOWN",
            CredentialStatus::Pending => "PENDING",
            CredentialStatus::Approved => "APPROVED",
            CredentialStatus::Rejected => "REJECTED",
            CredentialStatus::Revoked => "REVOKED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: CredentialStatus,
    pub message: String,
    pub credentials: Option<ApprovedCredentials>,
}

/// Status codes carried by failed calls and abnormal stream closes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RpcStatus {
    pub code: StatusCode,
    pub message: String,
}

impl RpcStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FailedPrecondition, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::PermissionDenied, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unauthenticated, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::ResourceExhausted, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Internal, message)
    }
}
