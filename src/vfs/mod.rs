//! Remote file reader over `fileOpen`/`fileRead`/`fileSeek`/`fileStat`/`fileClose`.
//!
//! Reads go through a local [`RingBuffer`] so that small consumer reads do
//! not each cost a round trip. The logical offset is what the consumer has
//! taken out of the buffer; the server-side offset runs ahead of it by the
//! buffered amount, which is why relative seeks are resolved locally.
//!
//! Recordings that are still being written get two extra behaviours: an
//! empty read is retried for a while before it counts as end of file, and
//! seeking close to the live edge flags the stream as real-time.

pub mod ring_buffer;

use parking_lot::Mutex;
use std::io::SeekFrom;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, trace, warn};

use crate::config::VfsConfig;
use crate::connection::Connection;
use crate::message::Message;
use crate::{HtspError, Result};

pub use ring_buffer::RingBuffer;

#[derive(Debug, Clone)]
struct OpenFile {
    id: u32,
    path: String,
    offset: u64,
    in_progress: bool,
    started_at: Option<SystemTime>,
    realtime: bool,
}

struct VfsState {
    file: Option<OpenFile>,
    buffer: RingBuffer,
}

pub struct VfsReader {
    conn: Weak<Connection>,
    config: VfsConfig,
    retry_delay: Duration,
    response_timeout: Duration,
    state: Mutex<VfsState>,
}

/// Whether `offset` is within `threshold_secs` of the end of a file that has
/// grown to `size` bytes over `elapsed_secs`.
pub fn near_live_edge(size: u64, offset: u64, elapsed_secs: u64, threshold_secs: u64) -> bool {
    if elapsed_secs == 0 {
        return true;
    }
    let bitrate = size / elapsed_secs;
    if bitrate == 0 {
        return true;
    }
    size.saturating_sub(offset) / bitrate < threshold_secs
}

impl VfsReader {
    pub fn new(conn: &Arc<Connection>) -> Arc<Self> {
        let config = conn.config();
        Arc::new(Self {
            conn: Arc::downgrade(conn),
            config: config.vfs.clone(),
            retry_delay: config.read_retry_delay(),
            response_timeout: config.response_timeout(),
            state: Mutex::new(VfsState { file: None, buffer: RingBuffer::new(config.vfs.buffer_size) }),
        })
    }

    fn connection(&self) -> Result<Arc<Connection>> {
        self.conn.upgrade().ok_or_else(|| HtspError::connection_lost("connection dropped"))
    }

    fn open_file(&self, context: &str) -> Result<OpenFile> {
        self.state
            .lock()
            .file
            .clone()
            .ok_or_else(|| HtspError::invalid_state(format!("{} without an open file", context)))
    }

    /// Open a file by server path, closing any file already open.
    pub async fn open(&self, path: &str) -> Result<()> {
        self.open_inner(path, false, None).await
    }

    /// Open the file of recording `recording_id`.
    ///
    /// `started_at` is when the recording began; it feeds the bitrate
    /// estimate for recordings still in progress.
    pub async fn open_recording(
        &self,
        recording_id: u32,
        in_progress: bool,
        started_at: Option<SystemTime>,
    ) -> Result<()> {
        self.open_inner(&format!("dvrfile/{}", recording_id), in_progress, started_at).await
    }

    async fn open_inner(
        &self,
        path: &str,
        in_progress: bool,
        started_at: Option<SystemTime>,
    ) -> Result<()> {
        let conn = self.connection()?;
        self.close().await;

        let msg = Message::new().with("file", path);
        let reply = conn.send_and_wait("fileOpen", msg, self.response_timeout).await?;
        let id = reply.require_u32("fileOpen", "id")?;
        info!(path, id, in_progress, "Opened remote file");

        let mut state = self.state.lock();
        state.buffer.reset();
        state.file = Some(OpenFile {
            id,
            path: path.to_string(),
            offset: 0,
            in_progress,
            started_at,
            realtime: false,
        });
        Ok(())
    }

    /// Read up to `out.len()` bytes at the logical offset.
    ///
    /// Returns 0 at end of file. On a recording in progress an empty server
    /// read is retried up to `read_retry_attempts` more times before that.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        let (file, free) = {
            let mut state = self.state.lock();
            let Some(file) = state.file.clone() else {
                return Err(HtspError::invalid_state("read without an open file"));
            };
            if state.buffer.len() >= out.len() {
                return Ok(Self::take(&mut state, out));
            }
            (file, state.buffer.free())
        };

        if free > 0 {
            let conn = self.connection()?;
            let data = self.fetch(&conn, &file, free).await?;
            let mut state = self.state.lock();
            if state.file.as_ref().map(|f| f.id) != Some(file.id) {
                return Err(HtspError::invalid_state("file closed during read"));
            }
            state.buffer.write(&data);
        }

        Ok(Self::take(&mut self.state.lock(), out))
    }

    fn take(state: &mut VfsState, out: &mut [u8]) -> usize {
        let n = state.buffer.read(out);
        if let Some(file) = state.file.as_mut() {
            file.offset += n as u64;
        }
        n
    }

    async fn fetch(&self, conn: &Connection, file: &OpenFile, size: usize) -> Result<bytes::Bytes> {
        let retries = if file.in_progress { self.config.read_retry_attempts } else { 0 };
        let mut attempt = 0;
        loop {
            let msg = Message::new().with("id", file.id).with("size", size as u64 as i64);
            let reply = conn.send_and_wait("fileRead", msg, self.response_timeout).await?;
            let data = reply.get_bin("data").cloned().unwrap_or_default();
            trace!(id = file.id, requested = size, received = data.len(), attempt, "fileRead");

            if !data.is_empty() || attempt >= retries {
                return Ok(data);
            }
            attempt += 1;
            debug!(id = file.id, attempt, "Empty read on growing file, retrying");
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Move the logical offset; returns the new offset.
    pub async fn seek(&self, pos: SeekFrom) -> Result<u64> {
        let conn = self.connection()?;
        let file = self.open_file("seek")?;

        let (offset, whence) = match pos {
            SeekFrom::Start(p) => (i64::try_from(p).unwrap_or(i64::MAX), "SEEK_SET"),
            SeekFrom::Current(delta) => (file.offset as i64 + delta, "SEEK_SET"),
            SeekFrom::End(delta) => (delta, "SEEK_END"),
        };
        if whence == "SEEK_SET" && offset < 0 {
            return Err(HtspError::invalid_state(format!("seek to negative offset {}", offset)));
        }

        let msg = Message::new().with("id", file.id).with("offset", offset).with("whence", whence);
        let reply = conn.send_and_wait("fileSeek", msg, self.response_timeout).await?;
        let new_offset = u64::try_from(reply.require_s64("fileSeek", "offset")?)
            .map_err(|_| HtspError::protocol("fileSeek", "negative offset in reply"))?;

        let realtime = match (file.in_progress, file.started_at) {
            (true, Some(started_at)) => {
                let size = self.size().await?;
                let elapsed = SystemTime::now()
                    .duration_since(started_at)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                near_live_edge(size, new_offset, elapsed, self.config.realtime_threshold_secs)
            }
            _ => false,
        };

        let mut state = self.state.lock();
        state.buffer.reset();
        if let Some(open) = state.file.as_mut().filter(|f| f.id == file.id) {
            open.offset = new_offset;
            open.realtime = realtime;
        }
        debug!(id = file.id, offset = new_offset, realtime, "Seeked");
        Ok(new_offset)
    }

    /// Current file size as reported by `fileStat`.
    pub async fn size(&self) -> Result<u64> {
        let conn = self.connection()?;
        let file = self.open_file("stat")?;
        let msg = Message::new().with("id", file.id);
        let reply = conn.send_and_wait("fileStat", msg, self.response_timeout).await?;
        u64::try_from(reply.require_s64("fileStat", "size")?)
            .map_err(|_| HtspError::protocol("fileStat", "negative size"))
    }

    /// Close the file; the `fileClose` RPC is best-effort.
    pub async fn close(&self) {
        let file = {
            let mut state = self.state.lock();
            state.buffer.reset();
            state.file.take()
        };
        let Some(file) = file else { return };

        debug!(id = file.id, path = %file.path, "Closing remote file");
        let Some(conn) = self.conn.upgrade().filter(|c| c.is_ready()) else { return };
        let msg = Message::new().with("id", file.id);
        if let Err(e) = conn.send_and_wait("fileClose", msg, self.response_timeout).await {
            warn!(id = file.id, error = %e, "fileClose failed");
        }
    }

    /// Reopen the file at the logical offset after a reconnect.
    ///
    /// Called from the rebuild hook, before the connection is ready.
    pub async fn reopen(&self, conn: &Connection) -> Result<()> {
        let Some(file) = self.state.lock().file.clone() else { return Ok(()) };

        let msg = Message::new().with("file", file.path.as_str());
        let reply = conn.send_and_wait_forced("fileOpen", msg, self.response_timeout).await?;
        let id = reply.require_u32("fileOpen", "id")?;

        if file.offset > 0 {
            let msg = Message::new()
                .with("id", id)
                .with("offset", file.offset as i64)
                .with("whence", "SEEK_SET");
            conn.send_and_wait_forced("fileSeek", msg, self.response_timeout).await?;
        }

        let mut state = self.state.lock();
        state.buffer.reset();
        if let Some(open) = state.file.as_mut().filter(|f| f.path == file.path) {
            open.id = id;
        }
        info!(path = %file.path, id, offset = file.offset, "Reopened remote file");
        Ok(())
    }

    /// Forget the open file without telling the server, whose handle is already gone.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        state.buffer.reset();
        if let Some(file) = state.file.take() {
            debug!(path = %file.path, "Discarding remote file");
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Logical offset of the next byte `read` returns.
    pub fn offset(&self) -> u64 {
        self.state.lock().file.as_ref().map(|f| f.offset).unwrap_or(0)
    }

    /// Whether the last seek landed close to the live edge of a growing recording.
    pub fn is_realtime_stream(&self) -> bool {
        self.state.lock().file.as_ref().is_some_and(|f| f.realtime)
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_edge_heuristic() {
        // 100 bytes/s; 500 bytes from the end is 5 s.
        assert!(near_live_edge(10_000, 9_500, 100, 10));
        // 2000 bytes from the end is 20 s.
        assert!(!near_live_edge(10_000, 8_000, 100, 10));
        assert!(near_live_edge(10_000, 0, 0, 10));
        assert!(near_live_edge(10_000, 12_000, 100, 10));
    }
}
