//! Bounded retention of a child's stderr.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line kept; longer lines are cut at this many bytes.
const MAX_LINE_BYTES: usize = 1024;

/// Ring buffer of the most recent stderr lines. Oldest lines are discarded
/// once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.capacity == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line.into());
    }

    fn push_bytes(&mut self, raw: &[u8]) {
        let raw = &raw[..raw.len().min(MAX_LINE_BYTES)];
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if !line.is_empty() {
            self.push(line.to_string());
        }
    }

    /// Retained lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    /// Number of lines discarded to stay within capacity.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Drain `reader` into `tail` until EOF or a read error.
///
/// Lines end at `\n` or `\r` (ffmpeg redraws status lines with `\r`). Bytes
/// past [`MAX_LINE_BYTES`] without a terminator are flushed as their own
/// line so memory stays bounded.
pub(crate) async fn collect<R>(mut reader: R, tail: Arc<Mutex<StderrTail>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        buf.reserve(4096);
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                while let Some(pos) = buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
                    let line = buf.split_to(pos + 1);
                    tail.lock().push_bytes(&line[..pos]);
                }
                if buf.len() > MAX_LINE_BYTES {
                    let line = buf.split();
                    tail.lock().push_bytes(&line);
                }
            }
            Err(e) => {
                tracing::debug!("stderr read error: {e}");
                break;
            }
        }
    }
    if !buf.is_empty() {
        tail.lock().push_bytes(&buf);
    }
}
