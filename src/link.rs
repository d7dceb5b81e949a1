//! Point-to-point message links between two nodes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Result, VibeError};
use crate::exchange::ExchangeMessage;
use crate::transport::TransportAddress;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[async_trait]
pub trait PeerLink: Send {
    async fn send(&mut self, message: &ExchangeMessage) -> Result<()>;

    /// Next message from the peer. [`VibeError::LinkClosed`] once the peer
    /// went away.
    async fn recv(&mut self) -> Result<ExchangeMessage>;

    fn remote_address(&self) -> TransportAddress;
}

/// Frames messages as a 4-byte big-endian length followed by JSON.
pub struct FramedLink<S> {
    stream: S,
    remote: TransportAddress,
}

impl<S> FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, remote: TransportAddress) -> Self {
        Self { stream, remote }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> PeerLink for FramedLink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: &ExchangeMessage) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        if body.len() > MAX_FRAME_LEN {
            return Err(VibeError::Protocol(format!(
                "outgoing {} frame of {} bytes",
                message.name(),
                body.len()
            )));
        }
        let len = (body.len() as u32).to_be_bytes();
        self.stream
            .write_all(&len)
            .await
            .map_err(closed_or_io)?;
        self.stream
            .write_all(&body)
            .await
            .map_err(closed_or_io)?;
        self.stream.flush().await.map_err(closed_or_io)?;
        log::trace!("Sent {} ({} bytes)", message.name(), body.len());
        Ok(())
    }

    async fn recv(&mut self) -> Result<ExchangeMessage> {
        let mut len = [0u8; 4];
        self.stream
            .read_exact(&mut len)
            .await
            .map_err(closed_or_io)?;
        let len = u32::from_be_bytes(len) as usize;
        if len > MAX_FRAME_LEN {
            return Err(VibeError::Protocol(format!(
                "incoming frame of {} bytes",
                len
            )));
        }

        let mut body = vec![0u8; len];
        self.stream
            .read_exact(&mut body)
            .await
            .map_err(closed_or_io)?;
        let message: ExchangeMessage = serde_json::from_slice(&body)
            .map_err(|e| VibeError::Protocol(format!("bad frame: {}", e)))?;
        log::trace!("Received {} ({} bytes)", message.name(), len);
        Ok(message)
    }

    fn remote_address(&self) -> TransportAddress {
        self.remote.clone()
    }
}

fn closed_or_io(e: std::io::Error) -> VibeError {
    use std::io::ErrorKind::*;
    match e.kind() {
        UnexpectedEof | BrokenPipe | ConnectionReset | ConnectionAborted => {
            VibeError::LinkClosed
        }
        _ => VibeError::Io(e),
    }
}
