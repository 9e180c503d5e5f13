//! Credential broker
//!
//! Owns one credential record per cluster and drives it through
//! `PENDING → APPROVED | REJECTED`, with `REVOKED` reachable from any state.
//! REJECTED and REVOKED are terminal: later requests for the same cluster are
//! refused rather than starting over.
//!
//! Conflict policy: the record map sits behind one lock. Certificates are
//! issued outside the lock and committed with a compare-and-set on the record
//! state, so the first writer wins. A racing auto-approval returns the record
//! that won; `manual_approve`/`manual_reject` fail if the record is no longer
//! PENDING at commit time; `revoke` always succeeds on an existing record.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use canopy_cert::{CertError, CertificateAuthority};
use canopy_proto::{
    ApprovedCredentials, CredentialStatus, CredentialsRequest, CredentialsResponse, RpcStatus,
    StatusResponse,
};
use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("agent not found: {0}")]
    NotFound(String),

    #[error("agent is not in pending state: {cluster_id} ({status})")]
    NotPending {
        cluster_id: String,
        status: CredentialStatus,
    },

    #[error("failed to generate client certificate: {0}")]
    Issuance(#[from] CertError),
}

impl From<BrokerError> for RpcStatus {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::MissingField(_) => RpcStatus::invalid_argument(e.to_string()),
            BrokerError::NotFound(_) => RpcStatus::not_found(e.to_string()),
            BrokerError::NotPending { .. } => RpcStatus::failed_precondition(e.to_string()),
            BrokerError::Issuance(_) => {
                RpcStatus::internal("failed to generate client certificate")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Approve any request carrying a non-empty api token (development only)
    pub auto_approve_with_token: bool,
    /// Poll interval suggested to pending agents
    pub poll_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            auto_approve_with_token: true,
            poll_interval: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Approve requests carrying an API token without operator action
    pub fn with_auto_approve(mut self, enabled: bool) -> Self {
        self.auto_approve_with_token = enabled;
        self
    }
}

/// Credential state of one cluster
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub cluster_id: String,
    pub cluster_name: String,
    pub agent_version: String,
    pub runtime_version: String,
    pub status: CredentialStatus,
    /// Agent identity issued at approval; kept after revocation
    pub agent_id: Option<String>,
    /// Issued material, present only while APPROVED
    pub credentials: Option<ApprovedCredentials>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    fn pending(request: &CredentialsRequest) -> Self {
        let now = Utc::now();
        Self {
            cluster_id: request.cluster_id.clone(),
            cluster_name: request.cluster_name.clone(),
            agent_version: request.agent_version.clone(),
            runtime_version: request.runtime_version.clone(),
            status: CredentialStatus::Pending,
            agent_id: None,
            credentials: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn approve(&mut self, credentials: ApprovedCredentials) {
        self.status = CredentialStatus::Approved;
        self.agent_id = Some(credentials.agent_id.clone());
        self.credentials = Some(credentials);
        self.updated_at = Utc::now();
    }
}

/// Issues, tracks and revokes cluster credentials
pub struct CredentialBroker {
    ca: Arc<CertificateAuthority>,
    config: BrokerConfig,
    records: RwLock<HashMap<String, CredentialRecord>>,
}

impl CredentialBroker {
    /// Create a broker with no records that issues from `ca`
    pub fn new(ca: Arc<CertificateAuthority>, config: BrokerConfig) -> Self {
        if config.auto_approve_with_token {
            warn!("Credential broker auto-approves requests carrying an api token (development mode)");
        }
        Self {
            ca,
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// The CA agent certificates are issued from
    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CredentialRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CredentialRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handle an agent's credential request
    pub fn request_credentials(
        &self,
        request: &CredentialsRequest,
    ) -> Result<CredentialsResponse, BrokerError> {
        info!(
            cluster_id = %request.cluster_id,
            cluster_name = %request.cluster_name,
            "Credential request"
        );

        if request.cluster_id.is_empty() {
            return Err(BrokerError::MissingField("cluster_id"));
        }
        if request.cluster_name.is_empty() {
            return Err(BrokerError::MissingField("cluster_name"));
        }

        if let Some(record) = self.read().get(&request.cluster_id) {
            return Ok(self.replay(record));
        }

        let has_token = request
            .api_token
            .as_deref()
            .map(|token| !token.is_empty())
            .unwrap_or(false);

        if has_token && self.config.auto_approve_with_token {
            warn!(cluster_id = %request.cluster_id, "DEV MODE: auto-approving agent with api token");
            let credentials = self.issue(&request.cluster_id)?;

            let mut records = self.write();
            if let Some(existing) = records.get(&request.cluster_id) {
                // Lost the race; the committed record wins
                return Ok(self.replay(existing));
            }
            let mut record = CredentialRecord::pending(request);
            record.approve(credentials.clone());
            records.insert(request.cluster_id.clone(), record);

            info!(
                cluster_id = %request.cluster_id,
                agent_id = %credentials.agent_id,
                "Agent approved"
            );
            return Ok(CredentialsResponse::Approved(credentials));
        }

        let mut records = self.write();
        let record = records
            .entry(request.cluster_id.clone())
            .or_insert_with(|| {
                info!(cluster_id = %request.cluster_id, "Creating pending approval entry");
                CredentialRecord::pending(request)
            });
        Ok(self.replay(record))
    }

    /// Current credential status of a cluster
    pub fn check_status(&self, cluster_id: &str) -> Result<StatusResponse, BrokerError> {
        if cluster_id.is_empty() {
            return Err(BrokerError::MissingField("cluster_id"));
        }

        let records = self.read();
        let response = match records.get(cluster_id) {
            None => StatusResponse {
                status: CredentialStatus::Unknown,
                message: "No record found for this cluster_id".to_string(),
                credentials: None,
            },
            Some(record) => {
                let message = match record.status {
                    CredentialStatus::Approved => "Agent approved and ready to connect",
                    CredentialStatus::Pending => "Awaiting admin approval",
                    CredentialStatus::Rejected => "Agent request was rejected",
                    CredentialStatus::Revoked => "Agent credentials were revoked",
                    CredentialStatus::Unknown => "No record found for this cluster_id",
                };
                StatusResponse {
                    status: record.status,
                    message: message.to_string(),
                    credentials: match record.status {
                        CredentialStatus::Approved => record.credentials.clone(),
                        _ => None,
                    },
                }
            }
        };

        Ok(response)
    }

    /// Approve a pending cluster, issuing its identity now
    pub fn manual_approve(&self, cluster_id: &str) -> Result<ApprovedCredentials, BrokerError> {
        self.ensure_pending(cluster_id)?;
        let credentials = self.issue(cluster_id)?;

        let mut records = self.write();
        let record = records
            .get_mut(cluster_id)
            .ok_or_else(|| BrokerError::NotFound(cluster_id.to_string()))?;
        if record.status != CredentialStatus::Pending {
            return Err(BrokerError::NotPending {
                cluster_id: cluster_id.to_string(),
                status: record.status,
            });
        }
        record.approve(credentials.clone());

        info!(
            cluster_id = %cluster_id,
            agent_id = %credentials.agent_id,
            "Agent manually approved by admin"
        );
        Ok(credentials)
    }

    /// Reject a pending cluster
    pub fn manual_reject(&self, cluster_id: &str) -> Result<(), BrokerError> {
        let mut records = self.write();
        let record = records
            .get_mut(cluster_id)
            .ok_or_else(|| BrokerError::NotFound(cluster_id.to_string()))?;
        if record.status != CredentialStatus::Pending {
            return Err(BrokerError::NotPending {
                cluster_id: cluster_id.to_string(),
                status: record.status,
            });
        }
        record.status = CredentialStatus::Rejected;
        record.updated_at = Utc::now();

        info!(cluster_id = %cluster_id, "Agent manually rejected by admin");
        Ok(())
    }

    /// Revoke a cluster's credentials; revoking twice is a no-op
    pub fn revoke(&self, cluster_id: &str) -> Result<(), BrokerError> {
        let mut records = self.write();
        let record = records
            .get_mut(cluster_id)
            .ok_or_else(|| BrokerError::NotFound(cluster_id.to_string()))?;
        if record.status == CredentialStatus::Revoked {
            return Ok(());
        }
        record.status = CredentialStatus::Revoked;
        record.credentials = None;
        record.updated_at = Utc::now();

        info!(cluster_id = %cluster_id, agent_id = ?record.agent_id, "Agent credentials revoked");
        Ok(())
    }

    /// Pending records, oldest first
    pub fn list_pending(&self) -> Vec<CredentialRecord> {
        let mut pending: Vec<_> = self
            .read()
            .values()
            .filter(|record| record.status == CredentialStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|record| record.created_at);
        pending
    }

    /// Full credential record of a cluster, if one exists
    pub fn get_agent(&self, cluster_id: &str) -> Option<CredentialRecord> {
        self.read().get(cluster_id).cloned()
    }

    fn ensure_pending(&self, cluster_id: &str) -> Result<(), BrokerError> {
        match self.read().get(cluster_id) {
            None => Err(BrokerError::NotFound(cluster_id.to_string())),
            Some(record) if record.status != CredentialStatus::Pending => {
                Err(BrokerError::NotPending {
                    cluster_id: cluster_id.to_string(),
                    status: record.status,
                })
            }
            Some(_) => Ok(()),
        }
    }

    /// Response for a request against an existing record
    fn replay(&self, record: &CredentialRecord) -> CredentialsResponse {
        match (record.status, &record.credentials) {
            (CredentialStatus::Approved, Some(credentials)) => {
                info!(cluster_id = %record.cluster_id, "Agent already approved, returning existing credentials");
                CredentialsResponse::Approved(credentials.clone())
            }
            (CredentialStatus::Pending, _) => CredentialsResponse::Pending {
                message: format!(
                    "Agent '{}' is awaiting admin approval. Please check back in {} seconds.",
                    record.cluster_name,
                    self.config.poll_interval.as_secs()
                ),
                poll_interval_secs: self.config.poll_interval.as_secs() as u32,
            },
            (CredentialStatus::Rejected, _) => {
                warn!(cluster_id = %record.cluster_id, "Agent was rejected");
                CredentialsResponse::Rejected {
                    reason: "Your request was rejected by an administrator.".to_string(),
                }
            }
            (CredentialStatus::Revoked, _) => {
                warn!(cluster_id = %record.cluster_id, "Agent credentials were revoked");
                CredentialsResponse::Rejected {
                    reason: "Your credentials were revoked. Contact an administrator.".to_string(),
                }
            }
            (status, _) => {
                error!(cluster_id = %record.cluster_id, status = %status, "Inconsistent credential record");
                CredentialsResponse::Rejected {
                    reason: "Credential record is in an inconsistent state.".to_string(),
                }
            }
        }
    }

    fn issue(&self, cluster_id: &str) -> Result<ApprovedCredentials, BrokerError> {
        let agent_id = uuid::Uuid::new_v4().to_string();
        let issued = self.ca.issue_client_certificate(&agent_id).map_err(|e| {
            error!(cluster_id = %cluster_id, error = %e, "Failed to generate client certificate");
            e
        })?;

        Ok(ApprovedCredentials {
            agent_id,
            agent_secret: generate_secret(),
            client_cert_pem: issued.cert_pem,
            client_key_pem: issued.key_pem,
            ca_cert_pem: self.ca.cert_pem().to_string(),
        })
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
