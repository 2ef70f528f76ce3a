//! Local file as a pipeline source, optionally paced to mimic a slow peer.

use std::io;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use seedcast_pipeline::ByteSource;
use tokio::time::Instant;
use tokio_util::io::ReaderStream;

/// Open `path` as a [`ByteSource`] of `chunk_size` chunks, released no
/// faster than `rate` bytes per second when set.
pub async fn file_source(path: &Path, chunk_size: usize, rate: Option<u64>) -> io::Result<ByteSource> {
    let file = tokio::fs::File::open(path).await?;
    let chunks = ReaderStream::with_capacity(file, chunk_size.max(1));
    Ok(match rate {
        Some(bytes_per_sec) if bytes_per_sec > 0 => Box::pin(throttle(chunks, bytes_per_sec)),
        _ => Box::pin(chunks),
    })
}

/// Delay each item so that the bytes released so far never exceed
/// `bytes_per_sec` times the elapsed time.
pub fn throttle<S>(stream: S, bytes_per_sec: u64) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
{
    let start = Instant::now();
    futures::stream::unfold((stream, 0u64), move |(mut stream, sent)| async move {
        let item = stream.next().await?;
        let due = start + Duration::from_secs_f64(sent as f64 / bytes_per_sec as f64);
        tokio::time::sleep_until(due).await;
        let sent = sent + item.as_ref().map_or(0, |b| b.len() as u64);
        Some((item, (stream, sent)))
    })
}
