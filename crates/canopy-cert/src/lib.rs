//! Certificate management for the Canopy control plane
//!
//! This crate provides:
//! - A root certificate authority that issues server and agent client certificates
//! - PEM helpers for loading certificates and keys into rustls
//! - Certificate inspection (subject, validity, usage) and chain verification

pub mod authority;
pub mod inspect;
pub mod pem;

pub use authority::{AuthoritySettings, CertificateAuthority, IssuedCertificate};
pub use inspect::{agent_id_from_common_name, CertificateInfo, AGENT_CN_PREFIX};
pub use pem::{
    load_certificates, load_private_key, parse_certificates, parse_private_key, write_pem_file,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Invalid PEM: {0}")]
    InvalidPem(String),

    #[error("Failed to parse certificate: {0}")]
    Parse(String),

    #[error("Certificate verification failed: {0}")]
    Verification(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CertResult<T> = Result<T, CertError>;

/// Intended use of a leaf certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateUsage {
    Server,
    Client,
}
