//! Wire Transport
//!
//! Framing for the daemon socket: every message travels as one
//! length-prefixed, checksummed JSON frame. Clients send
//! [`ClientEvent`](crate::events::ClientEvent) frames and receive
//! [`ConductorMessage`](crate::messages::ConductorMessage) frames.

pub mod frame;

pub use frame::{read_frame, write_frame, FrameDecoder, MAX_FRAME_SIZE};

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket or stream failure
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("frame serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload does not match its checksum
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum of the received payload
        actual: u32,
    },

    /// Declared or encoded payload exceeds the limit
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge {
        /// Payload size
        size: usize,
        /// Limit
        max: usize,
    },
}
