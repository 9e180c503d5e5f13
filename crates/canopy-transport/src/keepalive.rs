//! Server keepalive policy
//!
//! Bounds how long a connection may sit idle or live at all, how the server
//! probes the peer, and how often the peer may probe the server.

use crate::{TransportError, TransportResult};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepalivePolicy {
    /// How long a connection may wait without an open call
    pub max_connection_idle: Duration,
    /// Age after which the stream is asked to wind down
    pub max_connection_age: Duration,
    /// Extra time given after `max_connection_age` before the connection is cut
    pub max_connection_age_grace: Duration,
    /// Interval between server pings
    pub ping_interval: Duration,
    /// How long to wait for a pong before declaring the peer dead
    pub ping_timeout: Duration,
    /// Minimum spacing the peer must respect between its own pings
    pub min_peer_ping_interval: Duration,
    /// Whether peers may ping before opening a call
    pub permit_without_stream: bool,
    /// Policy violations tolerated before the connection is closed
    pub max_ping_strikes: u32,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            max_connection_idle: Duration::from_secs(5 * 60),
            max_connection_age: Duration::from_secs(2 * 60 * 60),
            max_connection_age_grace: Duration::from_secs(5 * 60),
            ping_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(10),
            min_peer_ping_interval: Duration::from_secs(15),
            permit_without_stream: true,
            max_ping_strikes: 2,
        }
    }
}

impl KeepalivePolicy {
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_connection_idle(mut self, idle: Duration) -> Self {
        self.max_connection_idle = idle;
        self
    }

    pub fn with_max_connection_age(mut self, age: Duration, grace: Duration) -> Self {
        self.max_connection_age = age;
        self.max_connection_age_grace = grace;
        self
    }

    pub fn with_min_peer_ping_interval(mut self, interval: Duration) -> Self {
        self.min_peer_ping_interval = interval;
        self
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.ping_interval.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Ping interval must be > 0".to_string(),
            ));
        }

        if self.ping_timeout.is_zero() || self.ping_timeout >= self.ping_interval {
            return Err(TransportError::ConfigurationError(
                "Ping timeout must be > 0 and shorter than the ping interval".to_string(),
            ));
        }

        if self.max_connection_idle.is_zero() || self.max_connection_age.is_zero() {
            return Err(TransportError::ConfigurationError(
                "Connection idle and age limits must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeepaliveViolation {
    #[error("too many pings")]
    TooManyPings,

    #[error("keepalive timeout: no pong within {0:?}")]
    PongTimeout(Duration),
}

/// Tracks peer pings against the policy
#[derive(Debug)]
pub struct PingPolicer {
    min_interval: Duration,
    permit_without_stream: bool,
    max_strikes: u32,
    last_ping: Option<Instant>,
    strikes: u32,
}

impl PingPolicer {
    pub fn new(policy: &KeepalivePolicy) -> Self {
        Self {
            min_interval: policy.min_peer_ping_interval,
            permit_without_stream: policy.permit_without_stream,
            max_strikes: policy.max_ping_strikes,
            last_ping: None,
            strikes: 0,
        }
    }

    /// Record a peer ping received at `now`
    pub fn on_ping(&mut self, now: Instant, stream_active: bool) -> Result<(), KeepaliveViolation> {
        let too_soon = self
            .last_ping
            .map(|last| now.duration_since(last) < self.min_interval)
            .unwrap_or(false);

        if too_soon || (!stream_active && !self.permit_without_stream) {
            self.strikes += 1;
        }
        self.last_ping = Some(now);

        if self.strikes > self.max_strikes {
            return Err(KeepaliveViolation::TooManyPings);
        }
        Ok(())
    }

    /// Sending stream data forgives earlier strikes
    pub fn on_data_sent(&mut self) {
        self.strikes = 0;
    }

    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = KeepalivePolicy::default();
        assert!(policy.validate().is_ok());
        assert_eq!(policy.ping_interval, Duration::from_secs(30));
        assert_eq!(policy.ping_timeout, Duration::from_secs(10));
        assert_eq!(policy.max_connection_age, Duration::from_secs(7200));
    }

    #[test]
    fn test_invalid_policy() {
        let policy = KeepalivePolicy::default().with_ping_timeout(Duration::from_secs(60));
        assert!(policy.validate().is_err());

        let policy = KeepalivePolicy::default().with_ping_interval(Duration::ZERO);
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_well_spaced_pings_allowed() {
        let mut policer = PingPolicer::new(&KeepalivePolicy::default());
        let start = Instant::now();

        for i in 0..10 {
            let at = start + Duration::from_secs(20 * i);
            assert!(policer.on_ping(at, true).is_ok());
        }
        assert_eq!(policer.strikes(), 0);
    }

    #[test]
    fn test_rapid_pings_rejected() {
        let mut policer = PingPolicer::new(&KeepalivePolicy::default());
        let start = Instant::now();

        assert!(policer.on_ping(start, true).is_ok());
        assert!(policer.on_ping(start + Duration::from_secs(1), true).is_ok());
        assert!(policer.on_ping(start + Duration::from_secs(2), true).is_ok());
        assert_eq!(
            policer.on_ping(start + Duration::from_secs(3), true),
            Err(KeepaliveViolation::TooManyPings)
        );
    }

    #[test]
    fn test_data_sent_resets_strikes() {
        let mut policer = PingPolicer::new(&KeepalivePolicy::default());
        let start = Instant::now();

        policer.on_ping(start, true).unwrap();
        policer.on_ping(start + Duration::from_secs(1), true).unwrap();
        assert_eq!(policer.strikes(), 1);

        policer.on_data_sent();
        assert_eq!(policer.strikes(), 0);
    }

    #[test]
    fn test_pings_without_stream() {
        let start = Instant::now();

        let mut permissive = PingPolicer::new(&KeepalivePolicy::default());
        assert!(permissive.on_ping(start, false).is_ok());
        assert_eq!(permissive.strikes(), 0);

        let strict_policy = KeepalivePolicy {
            permit_without_stream: false,
            ..Default::default()
        };
        let mut strict = PingPolicer::new(&strict_policy);
        for i in 0..2 {
            assert!(strict
                .on_ping(start + Duration::from_secs(20 * i), false)
                .is_ok());
        }
        assert!(strict.on_ping(start + Duration::from_secs(60), false).is_err());
    }
}
