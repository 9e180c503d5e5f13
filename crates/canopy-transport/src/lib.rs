//! Transport layer for the Canopy control plane
//!
//! Provides mutually-authenticated TLS configuration for both ends of a
//! connection, the server keepalive policy, and the connection driver that
//! turns a framed TLS stream into typed agent-stream channels.

pub mod connection;
pub mod keepalive;
pub mod tls;

pub use connection::{InboundStream, OutboundSink, ServerConnection, StreamCloser, StreamHalves};
pub use keepalive::{KeepalivePolicy, KeepaliveViolation, PingPolicer};
pub use tls::{
    build_client_config, build_server_config, crypto_provider, peer_certificate,
    root_store_from_pem, ClientAuthMode, TlsIdentity,
};

use canopy_proto::CodecError;
use thiserror::Error;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("Keepalive violation: {0}")]
    Keepalive(#[from] KeepaliveViolation),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl From<canopy_cert::CertError> for TransportError {
    fn from(e: canopy_cert::CertError) -> Self {
        TransportError::TlsError(e.to_string())
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
