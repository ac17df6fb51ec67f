//! Name handshake performed on every new link before RPC traffic starts.
//!
//! The connecting server sends [`Envelope::Hello`] with its name; the proxy
//! answers [`Envelope::HelloAck`]. Both sides give up after a timeout.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::Envelope;
use crate::wire::{FrameConfig, WireError, read_envelope, write_envelope};

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("handshake wire error: {0}")]
    Wire(#[from] WireError),

    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("unexpected message during handshake: {0}")]
    Unexpected(String),
}

/// Announces `server_name` to the proxy and waits for acceptance.
pub async fn initiate_handshake<S>(
    stream: &mut S,
    server_name: &str,
    frame: &FrameConfig,
    timeout: Duration,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(timeout, send_hello(stream, server_name, frame))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn send_hello<S>(
    stream: &mut S,
    server_name: &str,
    frame: &FrameConfig,
) -> Result<(), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = Envelope::Hello {
        server_name: server_name.to_string(),
    };
    write_envelope(stream, &hello, frame).await?;

    match read_envelope(stream, frame).await? {
        Envelope::HelloAck { accepted: true, .. } => Ok(()),
        Envelope::HelloAck { reason, .. } => Err(HandshakeError::Rejected(
            reason.unwrap_or_else(|| "no reason given".to_string()),
        )),
        other => Err(HandshakeError::Unexpected(format!("{other:?}"))),
    }
}

async fn read_hello<S>(stream: &mut S, frame: &FrameConfig) -> Result<String, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    match read_envelope(stream, frame).await? {
        Envelope::Hello { server_name } => Ok(server_name),
        other => Err(HandshakeError::Unexpected(format!("{other:?}"))),
    }
}

/// Reads the peer's hello, asks `validate` whether the name is acceptable,
/// and acknowledges. Returns the accepted name.
///
/// `validate` returns `Err(reason)` to refuse the peer; the reason is sent
/// back in the acknowledgement.
pub async fn accept_handshake<S, V>(
    stream: &mut S,
    frame: &FrameConfig,
    timeout: Duration,
    validate: V,
) -> Result<String, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    V: FnOnce(&str) -> Result<(), String>,
{
    let server_name = tokio::time::timeout(timeout, read_hello(stream, frame))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))??;

    let verdict = if server_name.is_empty() {
        Err("server name must not be empty".to_string())
    } else {
        validate(&server_name)
    };

    let ack = match &verdict {
        Ok(()) => Envelope::HelloAck {
            accepted: true,
            reason: None,
        },
        Err(reason) => Envelope::HelloAck {
            accepted: false,
            reason: Some(reason.clone()),
        },
    };
    write_envelope(stream, &ack, frame).await?;

    verdict.map(|()| server_name).map_err(HandshakeError::Rejected)
}
