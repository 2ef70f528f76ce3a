//! Inbound byte sources.

use std::io;
use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// A chunked byte stream ending in completion (`None`) or an error item.
///
/// A source handed to a request that joins an existing download is dropped
/// without ever being polled.
pub type ByteSource = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Wrap any stream of byte chunks as a [`ByteSource`].
pub fn from_stream<S>(stream: S) -> ByteSource
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'static,
{
    Box::pin(stream)
}

/// Wrap an async reader as a [`ByteSource`].
pub fn from_reader<R>(reader: R) -> ByteSource
where
    R: AsyncRead + Send + 'static,
{
    Box::pin(ReaderStream::new(reader))
}
