//! Server configuration

use crate::ServerError;
use canopy_control::{BrokerConfig, IdentityPolicy, ServiceConfig, DEFAULT_QUEUE_CAPACITY};
use canopy_proto::AgentConfig;
use canopy_transport::{ClientAuthMode, KeepalivePolicy};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Main listener; serves every call
    pub listen_addr: SocketAddr,
    /// Optional enrollment listener; serves only health and credential calls
    /// and never requires a client certificate
    pub enrollment_addr: Option<SocketAddr>,
    /// Client certificate policy of the main listener
    pub client_auth: ClientAuthMode,
    pub identity_policy: IdentityPolicy,
    pub keepalive: KeepalivePolicy,
    pub heartbeat_timeout: Duration,
    pub health_check_interval: Duration,
    /// Reporting cadence advertised to agents
    pub agent_config: AgentConfig,
    /// Outbound queue capacity per session
    pub queue_capacity: usize,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let service = ServiceConfig::default();
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            enrollment_addr: None,
            client_auth: ClientAuthMode::Optional,
            identity_policy: service.identity_policy,
            keepalive: KeepalivePolicy::default(),
            heartbeat_timeout: service.heartbeat_timeout,
            health_check_interval: service.health_check_interval,
            agent_config: service.agent_config,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    pub fn with_enrollment_addr(mut self, addr: SocketAddr) -> Self {
        self.enrollment_addr = Some(addr);
        self
    }

    pub fn with_client_auth(mut self, mode: ClientAuthMode) -> Self {
        self.client_auth = mode;
        self
    }

    pub fn with_identity_policy(mut self, policy: IdentityPolicy) -> Self {
        self.identity_policy = policy;
        self
    }

    pub fn with_keepalive(mut self, keepalive: KeepalivePolicy) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        self.keepalive
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        if self.heartbeat_timeout.is_zero() || self.health_check_interval.is_zero() {
            return Err(ServerError::Config(
                "Heartbeat timeout and health check interval must be > 0".to_string(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(ServerError::Config(
                "Outbound queue capacity must be > 0".to_string(),
            ));
        }

        if self.agent_config.heartbeat_interval_secs == 0
            || self.agent_config.metrics_interval_secs == 0
        {
            return Err(ServerError::Config(
                "Advertised heartbeat and metrics intervals must be > 0".to_string(),
            ));
        }

        if let Some(enrollment_addr) = self.enrollment_addr {
            if enrollment_addr == self.listen_addr && enrollment_addr.port() != 0 {
                return Err(ServerError::Config(format!(
                    "Enrollment listener must not share the main address {}",
                    enrollment_addr
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            heartbeat_timeout: self.heartbeat_timeout,
            health_check_interval: self.health_check_interval,
            agent_config: self.agent_config,
            identity_policy: self.identity_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_addr.port(), 9090);
        assert_eq!(config.client_auth, ClientAuthMode::Optional);
        assert_eq!(config.identity_policy, IdentityPolicy::BindToCredentials);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.agent_config.heartbeat_interval_secs, 30);
        assert_eq!(config.agent_config.metrics_interval_secs, 60);
        assert_eq!(config.queue_capacity, 100);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ServerConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());

        assert!(ServerConfig::default()
            .with_heartbeat_timeout(Duration::ZERO)
            .validate()
            .is_err());

        let addr: SocketAddr = "127.0.0.1:9090".parse().unwrap();
        assert!(ServerConfig::default()
            .with_listen_addr(addr)
            .with_enrollment_addr(addr)
            .validate()
            .is_err());

        let ephemeral: SocketAddr = "127.0.0.1:0".parse().unwrap();
        assert!(ServerConfig::default()
            .with_listen_addr(ephemeral)
            .with_enrollment_addr(ephemeral)
            .validate()
            .is_ok());
    }
}
