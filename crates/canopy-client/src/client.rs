//! Control-plane client
//!
//! Every call opens its own TLS connection, mirroring the server's one call
//! per connection model.

use crate::session::{self, AgentSession};
use crate::{ClientConfig, ClientError, ClientResult};
use canopy_proto::{
    AgentMessage, AgentPayload, AgentStatusRequest, AgentStatusResponse, ApprovedCredentials,
    Call, CredentialStatus, CredentialsRequest, CredentialsResponse, Frame, FrameCodec,
    HealthCheckResponse, Registration, Reply, StatusRequest, StatusResponse,
};
use canopy_transport::{build_client_config, root_store_from_pem};
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

pub(crate) type ClientFramed = Framed<TlsStream<TcpStream>, FrameCodec>;

pub struct ControlPlaneClient {
    config: ClientConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl ControlPlaneClient {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let roots = root_store_from_pem(&config.ca_cert_pem)?;
        let tls = build_client_config(roots, config.identity.clone())?;
        let server_name = ServerName::try_from(config.server_name.as_str())
            .map_err(|e| {
                ClientError::ConnectionFailed(format!(
                    "invalid server name '{}': {}",
                    config.server_name, e
                ))
            })?
            .to_owned();

        Ok(Self {
            config,
            connector: TlsConnector::from(tls),
            server_name,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Whether this client presents an agent certificate
    pub fn has_identity(&self) -> bool {
        self.config.identity.is_some()
    }

    async fn open(&self, call: Call) -> ClientResult<ClientFramed> {
        let addr = &self.config.server_addr;
        let limit = self.config.connect_timeout;

        let tcp = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::Timeout(format!("connecting to {}", addr)))?
            .map_err(|e| ClientError::ConnectionFailed(format!("{}: {}", addr, e)))?;
        tcp.set_nodelay(true)?;

        let tls = timeout(limit, self.connector.connect(self.server_name.clone(), tcp))
            .await
            .map_err(|_| ClientError::Timeout(format!("TLS handshake with {}", addr)))?
            .map_err(|e| {
                ClientError::ConnectionFailed(format!("TLS handshake with {} failed: {}", addr, e))
            })?;

        debug!(server = %addr, call = call.name(), "Opening call");
        let mut framed = Framed::new(tls, FrameCodec::new());
        framed.send(Frame::Open(call)).await?;
        Ok(framed)
    }

    async fn unary(&self, call: Call) -> ClientResult<Reply> {
        let name = call.name();
        timeout(self.config.request_timeout, self.exchange(call))
            .await
            .map_err(|_| ClientError::Timeout(name.to_string()))?
    }

    async fn exchange(&self, call: Call) -> ClientResult<Reply> {
        let mut framed = self.open(call).await?;

        loop {
            match framed.next().await {
                Some(Ok(Frame::Reply(reply))) => return reply.map_err(ClientError::Rpc),
                Some(Ok(Frame::Ping { timestamp })) => {
                    framed.send(Frame::Pong { timestamp }).await?
                }
                Some(Ok(Frame::Pong { .. })) => {}
                Some(Ok(Frame::Close(Some(status)))) => return Err(ClientError::Rpc(status)),
                Some(Ok(Frame::Close(None))) | None => return Err(ClientError::ConnectionClosed),
                Some(Ok(other)) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected frame awaiting reply: {:?}",
                        other
                    )))
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    pub async fn health_check(&self) -> ClientResult<HealthCheckResponse> {
        match self.unary(Call::HealthCheck).await? {
            Reply::Health(response) => Ok(response),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn request_credentials(
        &self,
        request: &CredentialsRequest,
    ) -> ClientResult<CredentialsResponse> {
        match self
            .unary(Call::RequestCredentials(request.clone()))
            .await?
        {
            Reply::Credentials(response) => Ok(response),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn check_status(&self, cluster_id: &str) -> ClientResult<StatusResponse> {
        let call = Call::CheckStatus(StatusRequest {
            cluster_id: cluster_id.to_string(),
        });
        match self.unary(call).await? {
            Reply::Status(response) => Ok(response),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn get_agent_status(&self, cluster_id: &str) -> ClientResult<AgentStatusResponse> {
        let call = Call::GetAgentStatus(AgentStatusRequest {
            cluster_id: cluster_id.to_string(),
        });
        match self.unary(call).await? {
            Reply::AgentStatus(response) => Ok(response),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Request credentials and wait until they are approved
    ///
    /// While pending, `CheckStatus` is polled at `poll_interval`, or at the
    /// interval the server advises when `None`. A rejection or revocation ends
    /// enrollment with [`ClientError::Rejected`].
    pub async fn enroll(
        &self,
        request: &CredentialsRequest,
        poll_interval: Option<Duration>,
    ) -> ClientResult<ApprovedCredentials> {
        let interval = match self.request_credentials(request).await? {
            CredentialsResponse::Approved(credentials) => {
                info!(cluster_id = %request.cluster_id, agent_id = %credentials.agent_id, "Credentials approved");
                return Ok(credentials);
            }
            CredentialsResponse::Rejected { reason } => return Err(ClientError::Rejected(reason)),
            CredentialsResponse::Pending {
                message,
                poll_interval_secs,
            } => {
                info!(cluster_id = %request.cluster_id, "{}", message);
                poll_interval
                    .unwrap_or_else(|| Duration::from_secs(u64::from(poll_interval_secs.max(1))))
            }
        };

        loop {
            tokio::time::sleep(interval).await;

            let status = self.check_status(&request.cluster_id).await?;
            match status.status {
                CredentialStatus::Approved => {
                    return status.credentials.ok_or_else(|| {
                        ClientError::Protocol("approved status without credentials".to_string())
                    })
                }
                CredentialStatus::Pending => {
                    debug!(cluster_id = %request.cluster_id, "Still awaiting approval")
                }
                CredentialStatus::Rejected | CredentialStatus::Revoked => {
                    warn!(cluster_id = %request.cluster_id, status = %status.status, "Enrollment refused");
                    return Err(ClientError::Rejected(status.message));
                }
                CredentialStatus::Unknown => {
                    return Err(ClientError::Protocol(format!(
                        "server has no record of cluster {}",
                        request.cluster_id
                    )))
                }
            }
        }
    }

    /// Open the agent stream and complete the registration handshake
    pub async fn open_agent_stream(&self, registration: Registration) -> ClientResult<AgentSession> {
        let mut framed = self.open(Call::AgentStream).await?;
        framed
            .send(Frame::Agent(AgentMessage::new(AgentPayload::Registration(
                registration,
            ))))
            .await?;

        let ack = timeout(self.config.request_timeout, session::await_ack(&mut framed))
            .await
            .map_err(|_| ClientError::Timeout("registration ack".to_string()))??;
        info!(session_id = %ack.session_id, "{}", ack.welcome_message);

        Ok(AgentSession::start(framed, ack))
    }
}

fn unexpected_reply(reply: Reply) -> ClientError {
    ClientError::Protocol(format!("unexpected reply: {:?}", reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cert::{AuthoritySettings, CertificateAuthority};
    use canopy_proto::StatusCode;
    use tokio::net::TcpListener;

    fn ca_pem() -> String {
        CertificateAuthority::generate(AuthoritySettings::default())
            .unwrap()
            .cert_pem()
            .to_string()
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(ControlPlaneClient::new(ClientConfig::new("127.0.0.1:1", "not a pem")).is_err());

        let config = ClientConfig::new("127.0.0.1:1", ca_pem()).with_server_name("not a name!");
        assert!(matches!(
            ControlPlaneClient::new(config),
            Err(ClientError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_identity_from_issued_certificate() {
        let ca = CertificateAuthority::generate(AuthoritySettings::default()).unwrap();
        let issued = ca.issue_client_certificate("a1").unwrap();

        let config = ClientConfig::new("127.0.0.1:1", ca.cert_pem())
            .with_identity_pem(&issued.cert_pem, &issued.key_pem)
            .unwrap();
        let client = ControlPlaneClient::new(config).unwrap();
        assert!(client.has_identity());

        assert!(ClientConfig::new("127.0.0.1:1", ca.cert_pem())
            .with_identity_pem(&issued.cert_pem, "garbage")
            .is_err());
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ControlPlaneClient::new(ClientConfig::new(addr.to_string(), ca_pem())).unwrap();
        let err = client.health_check().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
        assert!(err.status().is_none());
    }

    #[tokio::test]
    async fn test_request_timeout() {
        // Accepts TCP but never completes a TLS handshake
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let config = ClientConfig::new(addr.to_string(), ca_pem())
            .with_connect_timeout(Duration::from_millis(200))
            .with_request_timeout(Duration::from_millis(500));
        let client = ControlPlaneClient::new(config).unwrap();
        assert!(matches!(
            client.health_check().await,
            Err(ClientError::Timeout(_))
        ));
    }

    #[test]
    fn test_error_status() {
        let err = ClientError::Rpc(canopy_proto::RpcStatus::not_found("agent not found: x"));
        assert_eq!(err.status().map(|s| s.code), Some(StatusCode::NotFound));
    }
}
