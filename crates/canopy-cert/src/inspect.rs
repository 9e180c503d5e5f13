//! Certificate inspection

use crate::pem::parse_certificates;
use crate::{CertError, CertResult};
use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

/// Common-name prefix of agent client certificates
pub const AGENT_CN_PREFIX: &str = "agent-";

/// Extract the agent id from a client certificate common name
pub fn agent_id_from_common_name(common_name: &str) -> Option<&str> {
    common_name
        .strip_prefix(AGENT_CN_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Parsed summary of an X.509 certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub common_name: Option<String>,
    pub organization: Option<String>,
    /// Serial number as lowercase hex
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub client_auth: bool,
    pub server_auth: bool,
    pub dns_names: Vec<String>,
    /// DER-encoded SubjectPublicKeyInfo
    pub public_key_der: Vec<u8>,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> CertResult<Self> {
        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertError::Parse(e.to_string()))?;

        let subject = cert.subject();
        let common_name = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        let organization = subject
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .map(str::to_string);

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let (client_auth, server_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.client_auth, eku.value.server_auth),
            Ok(None) => (false, false),
            Err(e) => return Err(CertError::Parse(e.to_string())),
        };

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => return Err(CertError::Parse(e.to_string())),
        };

        Ok(Self {
            common_name,
            organization,
            serial: cert.raw_serial_as_string().replace(':', ""),
            not_before,
            not_after,
            is_ca: cert.is_ca(),
            client_auth,
            server_auth,
            dns_names,
            public_key_der: cert.public_key().raw.to_vec(),
        })
    }

    /// Parse the first certificate of a PEM bundle
    pub fn from_pem(pem: &str) -> CertResult<Self> {
        let der = parse_certificates(pem)?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::InvalidPem("No certificate found".to_string()))?;
        Self::from_der(&der)
    }

    /// Agent id encoded in the common name, if this is an agent certificate
    pub fn agent_id(&self) -> Option<String> {
        self.common_name
            .as_deref()
            .and_then(agent_id_from_common_name)
            .map(str::to_string)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.not_after
    }

    /// True when the certificate expires within `threshold` from now
    pub fn expires_within(&self, threshold: chrono::Duration) -> bool {
        Utc::now() + threshold > self.not_after
    }

    pub fn time_until_expiry(&self) -> chrono::Duration {
        self.not_after - Utc::now()
    }
}

fn timestamp(secs: i64) -> CertResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertError::Parse(format!("Invalid certificate timestamp: {}", secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthoritySettings, CertificateAuthority};

    #[test]
    fn test_agent_id_from_common_name() {
        assert_eq!(agent_id_from_common_name("agent-1234"), Some("1234"));
        assert_eq!(agent_id_from_common_name("agent-"), None);
        assert_eq!(agent_id_from_common_name("canopy-server"), None);
        assert_eq!(agent_id_from_common_name("xagent-1"), None);
    }

    #[test]
    fn test_expiry_checks() {
        let ca = CertificateAuthority::generate(AuthoritySettings::default()).unwrap();
        let issued = ca.issue_client_certificate("exp").unwrap();
        let info = CertificateInfo::from_pem(&issued.cert_pem).unwrap();

        assert!(!info.is_expired());
        assert!(!info.expires_within(chrono::Duration::days(30)));
        assert!(info.expires_within(chrono::Duration::days(91)));
        assert!(info.time_until_expiry() > chrono::Duration::days(89));
    }

    #[test]
    fn test_garbage_der() {
        assert!(matches!(
            CertificateInfo::from_der(&[0x30, 0x03, 0x01, 0x02]),
            Err(CertError::Parse(_))
        ));
    }
}
