//! TCP transport with length-prefixed framing.
//!
//! The socket is split into a [`FrameReader`] owned by the connection's read
//! loop and a [`FrameWriter`] shared by every sender. Both halves are generic
//! over the underlying stream so the framing can be exercised over an
//! in-memory pipe.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use crate::message::codec::LENGTH_PREFIX_SIZE;
use crate::{HtspError, Result};

/// Open a TCP connection within `timeout` and split it into framed halves.
pub async fn connect(
    address: &str,
    timeout: Duration,
    max_frame_size: u32,
) -> Result<(FrameReader<OwnedReadHalf>, FrameWriter<OwnedWriteHalf>)> {
    debug!(address, ?timeout, "Opening HTSP socket");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| HtspError::transport(format!("connect to {} timed out", address)))?
        .map_err(|e| HtspError::transport_io(format!("connect to {} failed", address), e))?;
    stream.set_nodelay(true)?;

    let (read, write) = stream.into_split();
    Ok((FrameReader::new(read, max_frame_size, timeout), FrameWriter::new(write)))
}

/// Reading half: yields one frame payload at a time.
pub struct FrameReader<R> {
    inner: R,
    max_frame_size: u32,
    /// Bound on receiving the rest of a frame once its prefix arrived.
    body_timeout: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: u32, body_timeout: Duration) -> Self {
        Self { inner, max_frame_size, body_timeout }
    }

    /// Read the next frame and return its payload (without the prefix).
    ///
    /// Waits indefinitely for the prefix; an idle server is not an error.
    pub async fn read_frame(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        match self.inner.read_exact(&mut prefix).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(HtspError::transport("connection closed by peer"));
            }
            Err(e) => return Err(HtspError::transport_io("socket read failed", e)),
        }

        let len = u32::from_be_bytes(prefix);
        if len > self.max_frame_size {
            return Err(HtspError::transport(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_size
            )));
        }

        let mut payload = BytesMut::zeroed(len as usize);
        if len > 0 {
            tokio::time::timeout(self.body_timeout, self.inner.read_exact(&mut payload))
                .await
                .map_err(|_| HtspError::transport("timed out reading frame body"))?
                .map_err(|e| HtspError::transport_io("socket read failed", e))?;
        }

        trace!(len, "Frame received");
        Ok(payload.freeze())
    }
}

/// Writing half: sends already-encoded frames.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Write one encoded frame (prefix included) within `timeout`.
    pub async fn write_frame(&mut self, frame: &[u8], timeout: Duration) -> Result<()> {
        let write = async {
            self.inner.write_all(frame).await?;
            self.inner.flush().await
        };
        tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| HtspError::transport("timed out writing frame"))?
            .map_err(|e| HtspError::transport_io("socket write failed", e))
    }

    /// Shut the write side down; errors are irrelevant at this point.
    pub async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}
