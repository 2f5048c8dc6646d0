//! The seam between the queue machinery and the socket.
//!
//! [`Transport`] is the synchronous face the flush path sees: a writability
//! gauge and a frame sink. [`StreamTransport`] is the production
//! implementation, staging frames in memory and draining them to an
//! [`AsyncWrite`] from the connection's I/O task. Staging keeps the flush
//! path free of awaits, so the queue's structural lock is never held across
//! a socket write.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Frame sink with flow control, as seen by the flush path.
///
/// Implementations must be cheap to poll: `is_writable` is consulted before
/// every entry and gates the drain loop.
pub trait Transport: Send + 'static {
    /// Whether the transport will currently accept another frame.
    fn is_writable(&self) -> bool;

    /// Queues one encoded frame for transmission.
    ///
    /// A failure is scoped to this frame: the caller fails the owning
    /// request and carries on until disconnect processing runs.
    fn write(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// Watermark-gated staging buffer over an async writer.
///
/// Frames accumulate in memory until [`drain`](Self::drain) pushes them to
/// the socket; writability turns false once the staged bytes cross the high
/// watermark and true again after a successful drain.
pub struct StreamTransport<W> {
    writer: W,
    staged: BytesMut,
    high_watermark: usize,
    broken: Option<io::ErrorKind>,
}

impl<W> StreamTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(writer: W, high_watermark: usize) -> Self {
        Self {
            writer,
            staged: BytesMut::with_capacity(high_watermark),
            high_watermark,
            broken: None,
        }
    }

    /// Number of staged bytes not yet pushed to the socket.
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Whether a previous drain failed; once broken, the transport stays
    /// broken until the connection is torn down.
    pub fn is_broken(&self) -> bool {
        self.broken.is_some()
    }

    /// Pushes all staged bytes to the underlying writer and flushes it.
    ///
    /// Returns the number of bytes drained. On error the transport is marked
    /// broken so later [`Transport::write`] calls fail immediately.
    pub async fn drain(&mut self) -> io::Result<usize> {
        if self.staged.is_empty() {
            return Ok(0);
        }
        let n = self.staged.len();
        let res = async {
            self.writer.write_all(&self.staged).await?;
            self.writer.flush().await
        }
        .await;
        match res {
            Ok(()) => {
                self.staged.clear();
                Ok(n)
            }
            Err(e) => {
                self.broken = Some(e.kind());
                Err(e)
            }
        }
    }
}

impl<W> Transport for StreamTransport<W>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    fn is_writable(&self) -> bool {
        self.broken.is_none() && self.staged.len() < self.high_watermark
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        if let Some(kind) = self.broken {
            return Err(io::Error::new(kind, "transport broken"));
        }
        self.staged.extend_from_slice(frame);
        Ok(())
    }
}
