//! Client configuration

use crate::ClientResult;
use canopy_transport::TlsIdentity;
use std::time::Duration;

/// Server name the control plane's certificate is issued for
pub const DEFAULT_SERVER_NAME: &str = "canopy-server";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the control plane
    pub server_addr: String,
    /// Name verified against the server certificate
    pub server_name: String,
    /// PEM of the platform CA the server certificate chains to
    pub ca_cert_pem: String,
    /// Agent certificate; `None` connects anonymously (enrollment only)
    pub identity: Option<TlsIdentity>,
    pub connect_timeout: Duration,
    /// Bound on a whole unary call, connection included
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(server_addr: impl Into<String>, ca_cert_pem: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_name: DEFAULT_SERVER_NAME.to_string(),
            ca_cert_pem: ca_cert_pem.into(),
            identity: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    pub fn with_identity(mut self, identity: TlsIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Use an issued agent certificate and key
    pub fn with_identity_pem(self, cert_pem: &str, key_pem: &str) -> ClientResult<Self> {
        Ok(self.with_identity(TlsIdentity::from_pem(cert_pem, key_pem)?))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}
