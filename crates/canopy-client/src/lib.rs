//! Agent-side client for the Canopy control plane
//!
//! [`ControlPlaneClient`] makes the unary calls (health, enrollment, status)
//! and opens the agent stream, which is driven by an [`AgentSession`].

pub mod client;
pub mod config;
pub mod session;

pub use client::ControlPlaneClient;
pub use config::ClientConfig;
pub use session::AgentSession;

use canopy_proto::{CodecError, RpcStatus};
use canopy_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection to control plane failed: {0}")]
    ConnectionFailed(String),

    #[error("Server returned {0}")]
    Rpc(RpcStatus),

    #[error("Credentials rejected: {0}")]
    Rejected(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ClientError {
    /// Status the server reported, if the failure came from the server
    pub fn status(&self) -> Option<&RpcStatus> {
        match self {
            ClientError::Rpc(status) => Some(status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
