//! Peer identity established by the TLS handshake

use canopy_cert::CertificateInfo;

/// Who is on the other end of a connection, as proven by its certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// No client certificate was presented
    Anonymous,
    /// An agent certificate (`CN=agent-<agent_id>`)
    Agent { agent_id: String },
    /// A verified certificate that is not an agent certificate
    Other { common_name: Option<String> },
}

impl PeerIdentity {
    pub fn from_certificate(info: &CertificateInfo) -> Self {
        match info.agent_id() {
            Some(agent_id) => PeerIdentity::Agent { agent_id },
            None => PeerIdentity::Other {
                common_name: info.common_name.clone(),
            },
        }
    }

    pub fn agent_id(&self) -> Option<&str> {
        match self {
            PeerIdentity::Agent { agent_id } => Some(agent_id),
            _ => None,
        }
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerIdentity::Anonymous => write!(f, "anonymous"),
            PeerIdentity::Agent { agent_id } => write!(f, "agent-{}", agent_id),
            PeerIdentity::Other { common_name } => {
                write!(f, "{}", common_name.as_deref().unwrap_or("<no common name>"))
            }
        }
    }
}

/// How agent-stream registrations are checked against the peer certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// The certificate's agent id must own the APPROVED credentials of the
    /// declared cluster
    #[default]
    BindToCredentials,
    /// Accept the declared cluster at face value (development only)
    TrustDeclared,
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cert::{AuthoritySettings, CertificateAuthority};

    #[test]
    fn test_identity_from_certificates() {
        let ca = CertificateAuthority::generate(AuthoritySettings::default()).unwrap();

        let client = ca.issue_client_certificate("7c1e").unwrap();
        let info = CertificateInfo::from_pem(&client.cert_pem).unwrap();
        let identity = PeerIdentity::from_certificate(&info);
        assert_eq!(identity.agent_id(), Some("7c1e"));
        assert_eq!(identity.to_string(), "agent-7c1e");

        let server = ca.issue_server_certificate().unwrap();
        let info = CertificateInfo::from_pem(&server.cert_pem).unwrap();
        assert_eq!(
            PeerIdentity::from_certificate(&info),
            PeerIdentity::Other {
                common_name: Some("canopy-server".to_string())
            }
        );
    }
}
