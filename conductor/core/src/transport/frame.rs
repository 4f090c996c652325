//! Frame Codec
//!
//! # Frame Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32, BE      | ClientEvent or ConductorMessage          |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! Length counts the payload only. The length is checked against
//! [`MAX_FRAME_SIZE`] before any payload buffer is allocated.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;

/// Maximum payload size (10 MiB)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Length + checksum
const HEADER_SIZE: usize = 8;

/// Compact the decoder buffer once this many consumed bytes pile up
const COMPACT_THRESHOLD: usize = 4096;

struct Header {
    len: usize,
    checksum: u32,
}

impl Header {
    fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, TransportError> {
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let checksum = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Ok(Self { len, checksum })
    }

    fn verify<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, TransportError> {
        let actual = crc32fast::hash(payload);
        if actual != self.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.checksum,
                actual,
            });
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Encode a message as one frame
///
/// # Errors
///
/// Returns `TransportError::Serialization` if the message cannot be encoded,
/// or `TransportError::FrameTooLarge` if the payload exceeds the limit.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write one frame and flush
///
/// # Errors
///
/// Returns encoding errors and `TransportError::Io` on write failure.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
///
/// # Errors
///
/// Returns `TransportError::Io` on truncated frames or read failures, and
/// the validation errors of [`FrameDecoder::decode`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = Header::parse(&header)?;
    let mut payload = vec![0u8; header.len];
    reader.read_exact(&mut payload).await?;
    header.verify(&payload).map(Some)
}

/// Incremental decoder for byte streams that arrive in arbitrary chunks
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    consumed: usize,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes
    pub fn push(&mut self, data: &[u8]) {
        if self.consumed >= COMPACT_THRESHOLD && self.consumed * 2 > self.buffer.len() {
            self.buffer.drain(..self.consumed);
            self.consumed = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet decoded
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffer.len() - self.consumed
    }

    /// Decode the next complete frame, if one is buffered
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` for oversized length fields,
    /// `ChecksumMismatch` for corrupted payloads and `Serialization` for
    /// payloads that are not the expected JSON. The stream cannot be
    /// resynchronized after an error.
    pub fn decode<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        let rest = &self.buffer[self.consumed..];
        let Some(header_bytes) = rest.first_chunk::<HEADER_SIZE>() else {
            return Ok(None);
        };
        let header = Header::parse(header_bytes)?;

        let end = HEADER_SIZE + header.len;
        if rest.len() < end {
            return Ok(None);
        }

        let msg = header.verify(&rest[HEADER_SIZE..end])?;
        self.consumed += end;
        Ok(Some(msg))
    }
}
