//! Peer transport abstraction.
//!
//! A transport delivers one `Request` to an endpoint and returns its
//! `Response`. The engine holds a single transport and addresses peers by
//! the endpoint string in the configuration. Frames on the wire are
//! `<u32 length><bincode body>`.

mod memory;
mod tcp;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use tcp::{serve, TcpTransport};

use crate::error::{Error, Result};
use crate::message::{Request, Response};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; a larger length prefix means a corrupt
/// or hostile stream.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Client side: deliver a request to the node listening at `addr`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, addr: &str, request: Request) -> Result<Response>;

    /// Drop any pooled connection to `addr` (after membership removal).
    fn close(&self, _addr: &str) {}
}

/// Server side: a node's dispatch entry point for inbound requests.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Rejected("oversized frame"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
