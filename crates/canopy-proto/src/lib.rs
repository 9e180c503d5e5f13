//! Canopy wire protocol
//!
//! Message envelopes exchanged between cluster agents and the control plane,
//! the unary call/reply types, and the length-prefixed frame codec that
//! carries them over a TLS connection.

pub mod codec;
pub mod messages;
pub mod rpc;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;
pub use rpc::*;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame payload size in either direction (10MB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
