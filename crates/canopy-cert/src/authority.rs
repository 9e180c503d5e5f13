//! Root certificate authority
//!
//! Generates (or loads) a self-signed root and issues leaf certificates from it:
//! one server certificate for the control plane listener and short-lived client
//! certificates for each approved agent. All keys are ECDSA P-256.

use crate::inspect::{CertificateInfo, AGENT_CN_PREFIX};
use crate::pem::{parse_certificates, write_pem_file};
use crate::{CertError, CertResult, CertificateUsage};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::client::danger::ServerCertVerifier;
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::RootCertStore;
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

const CA_VALIDITY: Duration = Duration::days(3650);
const SERVER_VALIDITY: Duration = Duration::days(365);
const CLIENT_VALIDITY: Duration = Duration::days(90);

/// Subject naming for the authority and the certificates it issues
#[derive(Debug, Clone)]
pub struct AuthoritySettings {
    pub organization: String,
    pub common_name: String,
    pub server_common_name: String,
    pub server_dns_names: Vec<String>,
}

impl Default for AuthoritySettings {
    fn default() -> Self {
        Self {
            organization: "Canopy Platform".to_string(),
            common_name: "Canopy Root CA".to_string(),
            server_common_name: "canopy-server".to_string(),
            server_dns_names: vec![
                "canopy-server".to_string(),
                "canopy-server.canopy-system".to_string(),
                "canopy-server.canopy-system.svc.cluster.local".to_string(),
                "localhost".to_string(),
                "127.0.0.1".to_string(),
            ],
        }
    }
}

impl AuthoritySettings {
    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    pub fn with_server_dns_names(mut self, names: Vec<String>) -> Self {
        self.server_dns_names = names;
        self
    }
}

/// A freshly issued leaf certificate with its private key
#[derive(Clone)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &format!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"[REDACTED]")
            .finish()
    }
}

/// Root certificate authority
///
/// Immutable after construction; share it behind an `Arc`.
pub struct CertificateAuthority {
    settings: AuthoritySettings,
    /// Issuer handle used for signing (re-derived from the PEM when loaded)
    issuer: Certificate,
    key_pair: KeyPair,
    /// The authority certificate as distributed to peers
    cert_pem: String,
    cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("common_name", &self.settings.common_name)
            .field("organization", &self.settings.organization)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Generate a new root CA valid for ten years
    pub fn generate(settings: AuthoritySettings) -> CertResult<Self> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&settings.organization, &settings.common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY);
        params.serial_number = Some(random_serial());

        let issuer = params.self_signed(&key_pair)?;
        let cert_pem = issuer.pem();
        let cert_der = issuer.der().clone();

        info!(
            common_name = %settings.common_name,
            organization = %settings.organization,
            "Generated root certificate authority"
        );

        Ok(Self {
            settings,
            issuer,
            key_pair,
            cert_pem,
            cert_der,
        })
    }

    /// Load an existing CA from its PEM certificate and private key
    pub fn from_pem(cert_pem: &str, key_pem: &str, settings: AuthoritySettings) -> CertResult<Self> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let cert_der = parse_certificates(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::InvalidPem("No CA certificate found".to_string()))?;

        let info = CertificateInfo::from_der(&cert_der)?;
        if !info.is_ca {
            return Err(CertError::Verification(
                "Certificate is not a CA certificate".to_string(),
            ));
        }
        if info.public_key_der != key_pair.public_key_der() {
            return Err(CertError::Verification(
                "CA private key does not match certificate".to_string(),
            ));
        }

        // Rebuild an issuer from the parsed parameters; leaves chain to the original
        // certificate through its subject and key.
        let params = CertificateParams::from_ca_cert_pem(cert_pem)?;
        let issuer = params.self_signed(&key_pair)?;

        info!(
            common_name = ?info.common_name,
            not_after = %info.not_after,
            "Loaded root certificate authority"
        );

        Ok(Self {
            settings,
            issuer,
            key_pair,
            cert_pem: cert_pem.to_string(),
            cert_der,
        })
    }

    pub fn load_from_files(
        cert_path: &Path,
        key_path: &Path,
        settings: AuthoritySettings,
    ) -> CertResult<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem, settings)
    }

    /// Persist the CA certificate (0644) and private key (0600)
    pub fn save_to_files(&self, cert_path: &Path, key_path: &Path) -> CertResult<()> {
        write_pem_file(cert_path, &self.cert_pem, 0o644)?;
        write_pem_file(key_path, &self.key_pair.serialize_pem(), 0o600)?;
        debug!(cert = %cert_path.display(), key = %key_path.display(), "Saved CA to disk");
        Ok(())
    }

    pub fn settings(&self) -> &AuthoritySettings {
        &self.settings
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// Root store containing only this authority
    pub fn root_store(&self) -> CertResult<RootCertStore> {
        let mut roots = RootCertStore::empty();
        roots
            .add(self.cert_der.clone())
            .map_err(|e| CertError::Verification(format!("Invalid CA certificate: {}", e)))?;
        Ok(roots)
    }

    /// Issue the control plane's TLS server certificate (one year)
    pub fn issue_server_certificate(&self) -> CertResult<IssuedCertificate> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::new(self.settings.server_dns_names.clone())?;
        params.distinguished_name =
            distinguished_name(&self.settings.organization, &self.settings.server_common_name);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, SERVER_VALIDITY);
        params.serial_number = Some(random_serial());

        let cert = params.signed_by(&key_pair, &self.issuer, &self.key_pair)?;

        debug!(
            common_name = %self.settings.server_common_name,
            "Issued server certificate"
        );

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a client certificate for an agent (90 days, CN `agent-<agent_id>`)
    pub fn issue_client_certificate(&self, agent_id: &str) -> CertResult<IssuedCertificate> {
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;

        let mut params = CertificateParams::default();
        let mut dn = distinguished_name(
            &self.settings.organization,
            &format!("{}{}", AGENT_CN_PREFIX, agent_id),
        );
        dn.push(DnType::OrganizationalUnitName, "Agents");
        params.distinguished_name = dn;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        params.use_authority_key_identifier_extension = true;
        set_validity(&mut params, CLIENT_VALIDITY);
        params.serial_number = Some(random_serial());

        let cert = params.signed_by(&key_pair, &self.issuer, &self.key_pair)?;

        debug!(agent_id = %agent_id, "Issued client certificate");

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Verify a leaf certificate chains to this authority and carries the given usage
    ///
    /// For server certificates the first DNS name in the certificate is checked.
    pub fn verify(&self, cert_pem: &str, usage: CertificateUsage) -> CertResult<CertificateInfo> {
        let cert_der = parse_certificates(cert_pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::InvalidPem("No certificate found".to_string()))?;
        let info = CertificateInfo::from_der(&cert_der)?;
        let roots = Arc::new(self.root_store()?);
        let provider = Arc::new(ring::default_provider());
        let now = UnixTime::now();

        match usage {
            CertificateUsage::Client => {
                let verifier = WebPkiClientVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|e| CertError::Verification(e.to_string()))?;
                verifier
                    .verify_client_cert(&cert_der, &[], now)
                    .map_err(|e| CertError::Verification(e.to_string()))?;
            }
            CertificateUsage::Server => {
                let name = info.dns_names.first().cloned().ok_or_else(|| {
                    CertError::Verification("Server certificate has no DNS names".to_string())
                })?;
                let server_name = ServerName::try_from(name)
                    .map_err(|e| CertError::Verification(e.to_string()))?;
                let verifier = WebPkiServerVerifier::builder_with_provider(roots, provider)
                    .build()
                    .map_err(|e| CertError::Verification(e.to_string()))?;
                verifier
                    .verify_server_cert(&cert_der, &[], &server_name, &[], now)
                    .map_err(|e| CertError::Verification(e.to_string()))?;
            }
        }

        Ok(info)
    }
}

fn distinguished_name(organization: &str, common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    dn.push(DnType::CommonName, common_name);
    dn
}

fn set_validity(params: &mut CertificateParams, validity: Duration) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + validity;
}

/// Random positive 128-bit serial number
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from(bytes.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ca() -> CertificateAuthority {
        CertificateAuthority::generate(AuthoritySettings::default()).unwrap()
    }

    #[test]
    fn test_generate_ca() {
        let ca = test_ca();
        let info = CertificateInfo::from_pem(ca.cert_pem()).unwrap();

        assert!(info.is_ca);
        assert_eq!(info.common_name.as_deref(), Some("Canopy Root CA"));
        assert_eq!(info.organization.as_deref(), Some("Canopy Platform"));

        let lifetime = info.not_after - info.not_before;
        assert_eq!(lifetime.num_days(), 3650);
    }

    #[test]
    fn test_issue_client_certificate() {
        let ca = test_ca();
        let issued = ca.issue_client_certificate("3f2a").unwrap();

        let info = ca.verify(&issued.cert_pem, CertificateUsage::Client).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("agent-3f2a"));
        assert_eq!(info.agent_id().as_deref(), Some("3f2a"));
        assert!(info.client_auth);
        assert!(!info.server_auth);
        assert!(!info.is_ca);
        assert_eq!((info.not_after - info.not_before).num_days(), 90);

        // Validity starts at issuance, not at some fixed epoch
        let expected = chrono::Utc::now() + chrono::Duration::days(90);
        let skew = (info.not_after - expected).num_seconds().abs();
        assert!(skew < 3600, "not_after is {skew}s away from now + 90d");
        assert!(!info.is_expired());

        // Key parses for rustls
        assert!(crate::parse_private_key(&issued.key_pem).is_ok());
    }

    #[test]
    fn test_issue_server_certificate() {
        let ca = test_ca();
        let issued = ca.issue_server_certificate().unwrap();

        let info = ca.verify(&issued.cert_pem, CertificateUsage::Server).unwrap();
        assert_eq!(info.common_name.as_deref(), Some("canopy-server"));
        assert!(info.server_auth);
        assert!(info.dns_names.contains(&"localhost".to_string()));
        assert!(info
            .dns_names
            .contains(&"canopy-server.canopy-system.svc.cluster.local".to_string()));
        assert_eq!((info.not_after - info.not_before).num_days(), 365);
    }

    #[test]
    fn test_wrong_usage_rejected() {
        let ca = test_ca();
        let server = ca.issue_server_certificate().unwrap();
        let client = ca.issue_client_certificate("a1").unwrap();

        assert!(ca.verify(&server.cert_pem, CertificateUsage::Client).is_err());
        assert!(ca.verify(&client.cert_pem, CertificateUsage::Server).is_err());
    }

    #[test]
    fn test_foreign_ca_rejected() {
        let ca = test_ca();
        let other = test_ca();
        let issued = other.issue_client_certificate("intruder").unwrap();

        assert!(matches!(
            ca.verify(&issued.cert_pem, CertificateUsage::Client),
            Err(CertError::Verification(_))
        ));
    }

    #[test]
    fn test_serials_are_unique() {
        let ca = test_ca();
        let a = CertificateInfo::from_pem(&ca.issue_client_certificate("a").unwrap().cert_pem)
            .unwrap();
        let b = CertificateInfo::from_pem(&ca.issue_client_certificate("a").unwrap().cert_pem)
            .unwrap();
        assert_ne!(a.serial, b.serial);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");

        let ca = test_ca();
        ca.save_to_files(&cert_path, &key_path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded =
            CertificateAuthority::load_from_files(&cert_path, &key_path, AuthoritySettings::default())
                .unwrap();
        assert_eq!(loaded.cert_pem(), ca.cert_pem());

        // Certificates issued by the reloaded authority verify against the original
        let issued = loaded.issue_client_certificate("reloaded").unwrap();
        assert!(ca.verify(&issued.cert_pem, CertificateUsage::Client).is_ok());
    }

    #[test]
    fn test_load_rejects_mismatched_key() {
        let ca = test_ca();
        let other = test_ca();
        let other_key = other.key_pair.serialize_pem();

        assert!(matches!(
            CertificateAuthority::from_pem(ca.cert_pem(), &other_key, AuthoritySettings::default()),
            Err(CertError::Verification(_))
        ));
    }

    #[test]
    fn test_load_rejects_leaf_certificate() {
        let ca = test_ca();
        let issued = ca.issue_client_certificate("leaf").unwrap();

        assert!(CertificateAuthority::from_pem(
            &issued.cert_pem,
            &issued.key_pem,
            AuthoritySettings::default()
        )
        .is_err());
    }
}
