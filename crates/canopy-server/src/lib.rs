//! Canopy control-plane server
//!
//! Accepts TLS connections on the main listener (and optionally a separate
//! enrollment listener), derives each peer's identity from its certificate
//! and dispatches calls to the [`ControlService`](canopy_control::ControlService).

pub mod config;
pub mod server;

pub use config::ServerConfig;
pub use server::{BoundServer, ControlPlaneServer, ListenerRole};

use canopy_cert::CertError;
use canopy_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to bind to {address}: {reason}")]
    BindError { address: SocketAddr, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS handshake failed: {0}")]
    Handshake(String),

    #[error("Certificate error: {0}")]
    Certificate(#[from] CertError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}
