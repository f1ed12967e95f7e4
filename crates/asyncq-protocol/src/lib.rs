//! Wire protocol spoken between clients, workers, and the broker.
//!
//! Two layers live here. The framed transport (`codec`) carries
//! length-prefixed bincode frames over TCP. The envelope codec
//! (`envelope`) serializes task envelopes as JSON so payloads remain
//! inspectable and compatible with Celery's message format.

pub mod codec;
pub mod envelope;
pub mod message;

pub use codec::FrameCodec;
pub use message::{Frame, FrameType};

use thiserror::Error;

/// Frames larger than this are rejected before any payload allocation.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame of {0} bytes exceeds maximum of {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
