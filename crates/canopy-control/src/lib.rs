//! Control plane core for Canopy
//!
//! - [`CredentialBroker`]: enrollment lifecycle of cluster credentials
//! - [`AgentRegistry`]: live agent sessions and their outbound queues
//! - [`ControlService`]: the per-stream session handler, unary calls and the
//!   background health sweep
//! - [`TelemetrySink`]: where metrics, events and command results go

pub mod broker;
pub mod identity;
pub mod registry;
pub mod service;
pub mod sink;

pub use broker::{BrokerConfig, BrokerError, CredentialBroker, CredentialRecord};
pub use identity::{IdentityPolicy, PeerIdentity};
pub use registry::{AgentRegistry, RegistryError, SessionInfo, DEFAULT_QUEUE_CAPACITY};
pub use service::{ControlService, ServiceConfig};
pub use sink::{LoggingSink, SessionContext, TelemetrySink};
