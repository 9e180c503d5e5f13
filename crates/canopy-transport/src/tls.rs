//! TLS configuration
//!
//! Both ends negotiate TLS 1.3 only with the ring crypto provider. The server
//! verifies client certificates against the platform CA, either requiring one
//! on every connection or accepting anonymous peers (enrollment) alongside
//! certificate-bearing ones.

use crate::{TransportError, TransportResult};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::Path;
use std::sync::Arc;

/// How the server treats client certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientAuthMode {
    /// Handshake fails without a valid client certificate
    Required,
    /// A presented certificate must be valid, but peers may present none
    #[default]
    Optional,
}

/// Certificate chain and private key presented during the handshake
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain_len", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl TlsIdentity {
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> TransportResult<Self> {
        Ok(Self {
            cert_chain: canopy_cert::parse_certificates(cert_pem)?,
            key: canopy_cert::parse_private_key(key_pem)?,
        })
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> TransportResult<Self> {
        Ok(Self {
            cert_chain: canopy_cert::load_certificates(cert_path)?,
            key: canopy_cert::load_private_key(key_path)?,
        })
    }
}

/// Crypto provider shared by every config built here
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Build a root store from a PEM bundle
pub fn root_store_from_pem(ca_pem: &str) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in canopy_cert::parse_certificates(ca_pem)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid root cert: {}", e)))?;
    }
    Ok(roots)
}

/// Build the control plane's rustls server config
pub fn build_server_config(
    identity: TlsIdentity,
    client_roots: RootCertStore,
    mode: ClientAuthMode,
) -> TransportResult<Arc<ServerConfig>> {
    let provider = crypto_provider();
    let builder = WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), provider.clone());
    let verifier = match mode {
        ClientAuthMode::Required => builder.build(),
        ClientAuthMode::Optional => builder.allow_unauthenticated().build(),
    }
    .map_err(|e| TransportError::TlsError(format!("Invalid client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(identity.cert_chain, identity.key)
        .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

    Ok(Arc::new(config))
}

/// Build an agent-side rustls client config
///
/// Without an identity the client connects anonymously, which the server only
/// accepts in [`ClientAuthMode::Optional`].
pub fn build_client_config(
    server_roots: RootCertStore,
    identity: Option<TlsIdentity>,
) -> TransportResult<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TransportError::TlsError(e.to_string()))?
        .with_root_certificates(server_roots);

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.cert_chain, identity.key)
            .map_err(|e| TransportError::TlsError(format!("Invalid client cert/key: {}", e)))?,
        None => builder.with_no_client_auth(),
    };

    Ok(Arc::new(config))
}

/// Leaf certificate the peer presented, if any
pub fn peer_certificate<IO>(
    stream: &tokio_rustls::server::TlsStream<IO>,
) -> Option<CertificateDer<'static>> {
    let (_, connection) = stream.get_ref();
    connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.clone().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cert::{AuthoritySettings, CertificateAuthority};

    fn server_identity(ca: &CertificateAuthority) -> TlsIdentity {
        let issued = ca.issue_server_certificate().unwrap();
        TlsIdentity::from_pem(&issued.cert_pem, &issued.key_pem).unwrap()
    }

    #[test]
    fn test_build_server_configs() {
        let ca = CertificateAuthority::generate(AuthoritySettings::default()).unwrap();

        for mode in [ClientAuthMode::Required, ClientAuthMode::Optional] {
            let config =
                build_server_config(server_identity(&ca), ca.root_store().unwrap(), mode).unwrap();
            assert!(config.alpn_protocols.is_empty());
        }
    }

    #[test]
    fn test_build_client_configs() {
        let ca = CertificateAuthority::generate(AuthoritySettings::default()).unwrap();
        let roots = root_store_from_pem(ca.cert_pem()).unwrap();
        assert_eq!(roots.len(), 1);

        assert!(build_client_config(roots.clone(), None).is_ok());

        let issued = ca.issue_client_certificate("agent-test").unwrap();
        let identity = TlsIdentity::from_pem(&issued.cert_pem, &issued.key_pem).unwrap();
        let config = build_client_config(roots, Some(identity)).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn test_identity_rejects_bad_pem() {
        assert!(TlsIdentity::from_pem("not a cert", "not a key").is_err());
    }
}
