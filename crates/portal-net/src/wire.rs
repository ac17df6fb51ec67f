//! Length-prefixed envelope codec.
//!
//! ```text
//! +-------------------+---------------+------------------------------+
//! | length (4 bytes)  | version (1)   | postcard-encoded Envelope    |
//! | u32 little-endian |               |                              |
//! +-------------------+---------------+------------------------------+
//! ```
//!
//! The length covers the version byte and the body. A zero-length frame is a
//! keepalive and is skipped by [`read_envelope`].

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::protocol::{Envelope, PROTOCOL_VERSION};

/// Limits for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    pub max_payload_size: u32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1_048_576,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge { size: usize, max: u32 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("encoding error: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serializes an envelope as `[version][postcard body]`.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = postcard::to_allocvec(envelope)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Inverse of [`encode_envelope`]. `payload` must be non-empty.
pub fn decode_envelope(payload: &[u8]) -> Result<Envelope, WireError> {
    let Some((&version, body)) = payload.split_first() else {
        return Err(WireError::ConnectionClosed);
    };
    if version != PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}

fn map_eof(e: std::io::Error) -> WireError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        WireError::ConnectionClosed
    } else {
        WireError::Io(e)
    }
}

/// Reads the next envelope, skipping keepalive frames.
///
/// Returns [`WireError::ConnectionClosed`] if the peer closes the stream
/// before a complete frame arrives.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    config: &FrameConfig,
) -> Result<Envelope, WireError> {
    loop {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
        let len = u32::from_le_bytes(len_buf);

        if len > config.max_payload_size {
            return Err(WireError::PayloadTooLarge {
                size: len as usize,
                max: config.max_payload_size,
            });
        }
        if len == 0 {
            continue;
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await.map_err(map_eof)?;
        return decode_envelope(&payload);
    }
}

/// Encodes and writes one envelope as a single frame, then flushes.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
    config: &FrameConfig,
) -> Result<(), WireError> {
    let payload = encode_envelope(envelope)?;
    if payload.len() > config.max_payload_size as usize {
        return Err(WireError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Writes a zero-length keepalive frame.
pub async fn write_keepalive<W: AsyncWriteExt + Unpin>(writer: &mut W) -> Result<(), WireError> {
    writer.write_all(&0u32.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
