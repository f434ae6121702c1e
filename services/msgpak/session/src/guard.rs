//! Connection I/O guard.
//!
//! A connection is split into a single [`ConnReader`] owned by the receive
//! loop and a cloneable [`ConnWriter`]. Every write goes through the writer's
//! async mutex, so the broadcast task and dispatcher replies never interleave
//! frames on the wire.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use msgpak_wire::{Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Lower bound for a text write deadline
pub const MIN_WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Upper bound for a text write deadline
pub const MAX_WRITE_DEADLINE: Duration = Duration::from_secs(3600);
/// Deadline for the best-effort close frame
pub const CLOSE_DEADLINE: Duration = Duration::from_secs(2);

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits a duplex stream into guarded halves
pub struct Connection;

impl Connection {
    /// Split with the default frame cap
    pub fn split<S>(stream: S) -> (ConnReader, ConnWriter)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::split_with_limit(stream, DEFAULT_MAX_FRAME_SIZE)
    }

    /// Split with a custom frame cap
    pub fn split_with_limit<S>(stream: S, max_frame_size: usize) -> (ConnReader, ConnWriter)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        (
            ConnReader {
                inner: Box::new(r),
                decoder: FrameDecoder::with_max_frame_size(max_frame_size),
                buffer: BytesMut::with_capacity(64 * 1024),
            },
            ConnWriter {
                inner: Arc::new(Mutex::new(Box::new(w))),
                max_frame_size,
            },
        )
    }
}

/// Clamp a requested text write deadline to the allowed range
pub fn clamp_write_deadline(requested: Duration) -> Duration {
    requested.clamp(MIN_WRITE_DEADLINE, MAX_WRITE_DEADLINE)
}

/// Serialized writer shared by every task of a connection
#[derive(Clone)]
pub struct ConnWriter {
    inner: Arc<Mutex<BoxedWrite>>,
    max_frame_size: usize,
}

impl ConnWriter {
    /// Write an envelope blob as a text frame. The deadline is clamped to
    /// `[10 s, 3600 s]`.
    pub async fn write_text(&self, blob: String, deadline: Duration) -> Result<(), TransportError> {
        self.write_frame(Frame::text(blob), clamp_write_deadline(deadline))
            .await
    }

    /// Best-effort close frame with a short deadline
    pub async fn write_close(&self, reason: &str) -> Result<(), TransportError> {
        debug!("Writing close frame: {}", reason);
        self.write_frame(Frame::close(reason), CLOSE_DEADLINE).await
    }

    /// Write any frame under the guard with an exact deadline
    pub async fn write_frame(&self, frame: Frame, deadline: Duration) -> Result<(), TransportError> {
        let bytes = frame.encode(self.max_frame_size)?;

        let write = async {
            let mut w = self.inner.lock().await;
            w.write_all(&bytes).await?;
            w.flush().await?;
            Ok::<_, std::io::Error>(())
        };
        timeout(deadline, write)
            .await
            .map_err(|_| TransportError::Timeout("write"))??;

        trace!("Wrote {:?} frame ({} bytes)", frame.kind, bytes.len());
        Ok(())
    }

    /// Shut the write side down
    pub async fn shutdown(&self) {
        let mut w = self.inner.lock().await;
        let _ = timeout(CLOSE_DEADLINE, w.shutdown()).await;
    }
}

/// Single reader of a connection
pub struct ConnReader {
    inner: BoxedRead,
    decoder: FrameDecoder,
    buffer: BytesMut,
}

impl ConnReader {
    /// Read the next frame or fail once `deadline` elapses
    pub async fn read_message(&mut self, deadline: Duration) -> Result<Frame, TransportError> {
        timeout(deadline, self.read_frame())
            .await
            .map_err(|_| TransportError::Timeout("read"))?
    }

    async fn read_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.buffer)? {
                return Ok(frame);
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(TransportError::Closed("EOF".to_string()));
            }
            trace!("Read {} bytes, buffer now has {} bytes", n, self.buffer.len());
        }
    }
}
