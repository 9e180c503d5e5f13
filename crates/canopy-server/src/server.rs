//! Listener and connection dispatch

use crate::{ServerConfig, ServerError};
use canopy_cert::{CertificateAuthority, CertificateInfo};
use canopy_control::{AgentRegistry, ControlService, CredentialBroker, PeerIdentity};
use canopy_proto::{Call, RpcStatus};
use canopy_transport::{
    build_server_config, peer_certificate, ClientAuthMode, KeepalivePolicy, ServerConnection,
    StreamHalves, TlsIdentity,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Which listener accepted a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerRole {
    Main,
    /// Serves only the calls an agent needs before it holds a certificate
    Enrollment,
}

impl fmt::Display for ListenerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerRole::Main => write!(f, "main"),
            ListenerRole::Enrollment => write!(f, "enrollment"),
        }
    }
}

/// The control-plane server, configured but not yet listening
pub struct ControlPlaneServer {
    config: ServerConfig,
    authority: Arc<CertificateAuthority>,
    service: Arc<ControlService>,
    main_acceptor: TlsAcceptor,
    enrollment_acceptor: Option<TlsAcceptor>,
}

impl ControlPlaneServer {
    /// Build a server with a fresh registry and credential broker
    pub fn new(
        config: ServerConfig,
        authority: Arc<CertificateAuthority>,
    ) -> Result<Self, ServerError> {
        let broker = Arc::new(CredentialBroker::new(
            Arc::clone(&authority),
            config.broker.clone(),
        ));
        let registry = AgentRegistry::with_queue_capacity(config.queue_capacity);
        let service = ControlService::new(registry, broker, config.service_config());
        Self::with_service(config, authority, Arc::new(service))
    }

    /// Build a server around an existing service
    pub fn with_service(
        config: ServerConfig,
        authority: Arc<CertificateAuthority>,
        service: Arc<ControlService>,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let issued = authority.issue_server_certificate()?;
        let identity = TlsIdentity::from_pem(&issued.cert_pem, &issued.key_pem)?;
        let roots = authority.root_store()?;

        let main_acceptor = TlsAcceptor::from(build_server_config(
            identity.clone(),
            roots.clone(),
            config.client_auth,
        )?);
        let enrollment_acceptor = match config.enrollment_addr {
            Some(_) => Some(TlsAcceptor::from(build_server_config(
                identity,
                roots,
                ClientAuthMode::Optional,
            )?)),
            None => None,
        };

        if config.client_auth == ClientAuthMode::Required && enrollment_acceptor.is_none() {
            warn!("Client certificates are required and no enrollment listener is configured; new agents cannot enroll");
        }

        Ok(Self {
            config,
            authority,
            service,
            main_acceptor,
            enrollment_acceptor,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn authority(&self) -> &Arc<CertificateAuthority> {
        &self.authority
    }

    pub fn service(&self) -> &Arc<ControlService> {
        &self.service
    }

    /// Bind the configured listeners
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let main = bind_listener(self.config.listen_addr).await?;
        let enrollment = match self.config.enrollment_addr {
            Some(addr) => Some(bind_listener(addr).await?),
            None => None,
        };

        Ok(BoundServer {
            server: self,
            main,
            enrollment,
        })
    }

    /// Bind and serve until `shutdown` fires
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        self.bind().await?.serve(shutdown).await
    }
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|e| ServerError::BindError {
            address: addr,
            reason: e.to_string(),
        })
}

/// A server whose listeners are bound
pub struct BoundServer {
    server: ControlPlaneServer,
    main: TcpListener,
    enrollment: Option<TcpListener>,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.main.local_addr()?)
    }

    pub fn enrollment_addr(&self) -> Result<Option<SocketAddr>, ServerError> {
        Ok(self
            .enrollment
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?)
    }

    pub fn service(&self) -> &Arc<ControlService> {
        self.server.service()
    }

    /// Accept connections until `shutdown` fires
    ///
    /// On shutdown the listeners close, the health sweep stops, open agent
    /// streams are asked to finish and in-flight connections are awaited.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        let BoundServer {
            server,
            main,
            enrollment,
        } = self;

        info!(
            addr = %main.local_addr()?,
            client_auth = ?server.config.client_auth,
            identity_policy = ?server.config.identity_policy,
            "Control plane listening"
        );
        if let Some(listener) = &enrollment {
            info!(addr = %listener.local_addr()?, "Enrollment listener ready");
        }

        server.service.start_health_checker();
        let context = Arc::new(ConnectionContext {
            service: Arc::clone(&server.service),
            keepalive: server.config.keepalive.clone(),
        });
        let connections = TaskTracker::new();

        loop {
            let (accepted, role) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = main.accept() => (accepted, ListenerRole::Main),
                accepted = accept(enrollment.as_ref()) => (accepted, ListenerRole::Enrollment),
            };

            let (socket, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(role = %role, error = %e, "Failed to accept connection");
                    continue;
                }
            };
            let acceptor = match role {
                ListenerRole::Main => server.main_acceptor.clone(),
                ListenerRole::Enrollment => match &server.enrollment_acceptor {
                    Some(acceptor) => acceptor.clone(),
                    None => continue,
                },
            };

            debug!(peer = %peer_addr, role = %role, "New connection");
            let context = Arc::clone(&context);
            let shutdown = shutdown.clone();
            connections.spawn(async move {
                if let Err(e) =
                    handle_connection(socket, peer_addr, acceptor, role, &context, shutdown).await
                {
                    debug!(peer = %peer_addr, role = %role, error = %e, "Connection ended with error");
                }
            });
        }

        info!("Shutting down control plane");
        drop(main);
        drop(enrollment);
        connections.close();
        server.service.shutdown().await;
        connections.wait().await;
        info!("Control plane stopped");
        Ok(())
    }
}

async fn accept(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

struct ConnectionContext {
    service: Arc<ControlService>,
    keepalive: KeepalivePolicy,
}

async fn handle_connection(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    role: ListenerRole,
    context: &ConnectionContext,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    socket.set_nodelay(true)?;

    let tls = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(socket)) => match handshake {
            Err(_) => return Err(ServerError::Handshake("timed out".to_string())),
            Ok(Err(e)) => return Err(ServerError::Handshake(e.to_string())),
            Ok(Ok(tls)) => tls,
        },
    };

    let identity = match peer_certificate(&tls) {
        Some(der) => PeerIdentity::from_certificate(&CertificateInfo::from_der(der.as_ref())?),
        None => PeerIdentity::Anonymous,
    };

    let mut connection =
        ServerConnection::new(tls, context.keepalive.clone(), peer_addr.to_string());
    let call = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        call = connection.accept_call() => call?,
    };
    debug!(peer = %peer_addr, role = %role, identity = %identity, call = call.name(), "Call opened");

    match call {
        call if role == ListenerRole::Enrollment && !call.is_enrollment() => {
            warn!(peer = %peer_addr, call = call.name(), "Refusing call on enrollment listener");
            let status = RpcStatus::permission_denied(format!(
                "{} is not served on the enrollment listener",
                call.name()
            ));
            connection.close(Some(status)).await?;
        }
        Call::AgentStream => {
            let cancel = shutdown.child_token();
            let StreamHalves {
                inbound,
                outbound,
                closer,
            } = connection.into_stream(cancel.clone());
            let result = context
                .service
                .agent_stream(inbound, outbound, &identity, cancel)
                .await;
            closer.finish(result.err()).await;
        }
        call => {
            let reply = context.service.handle_unary(call);
            if let Err(status) = &reply {
                debug!(peer = %peer_addr, status = %status, "Unary call failed");
            }
            connection.reply(reply).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_cert::AuthoritySettings;

    fn authority() -> Arc<CertificateAuthority> {
        Arc::new(CertificateAuthority::generate(AuthoritySettings::default()).unwrap())
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ServerConfig::default().with_queue_capacity(0);
        assert!(matches!(
            ControlPlaneServer::new(config, authority()),
            Err(ServerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_listeners() {
        let config = ServerConfig::default()
            .with_listen_addr("127.0.0.1:0".parse().unwrap())
            .with_enrollment_addr("127.0.0.1:0".parse().unwrap());
        let bound = ControlPlaneServer::new(config, authority())
            .unwrap()
            .bind()
            .await
            .unwrap();

        let main = bound.local_addr().unwrap();
        let enrollment = bound.enrollment_addr().unwrap().unwrap();
        assert_ne!(main.port(), 0);
        assert_ne!(enrollment.port(), 0);
        assert_ne!(main, enrollment);
    }

    #[tokio::test]
    async fn test_bind_conflict_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ServerConfig::default().with_listen_addr(taken.local_addr().unwrap());

        let result = ControlPlaneServer::new(config, authority())
            .unwrap()
            .bind()
            .await;
        assert!(matches!(result, Err(ServerError::BindError { .. })));
    }

    #[test]
    fn test_listener_role_display() {
        assert_eq!(ListenerRole::Main.to_string(), "main");
        assert_eq!(ListenerRole::Enrollment.to_string(), "enrollment");
    }
}
