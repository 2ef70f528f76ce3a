//! The output side: transcoder stdout as a byte stream.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream};
use seedcast_av::ProcessOutcome;
use seedcast_core::{Error, PipelineKey};
use tokio::process::ChildStdout;
use tokio::sync::watch;
use tokio_util::io::ReaderStream;
use tokio_util::sync::DropGuard;

/// Final report for one transcode, published after cleanup ran.
#[derive(Debug, Clone)]
pub struct TranscodeOutcome {
    pub key: PipelineKey,
    /// `None` when the process never started.
    pub process: Option<ProcessOutcome>,
    /// Whether the temp file is gone.
    pub file_removed: bool,
    /// Bytes on disk when the process was started.
    pub bytes_at_start: u64,
    /// Why the download stopped feeding a live process, if it did. The
    /// output is truncated when this is set.
    pub download_error: Option<Arc<Error>>,
}

/// Cloneable handle resolving to the [`TranscodeOutcome`].
#[derive(Debug, Clone)]
pub struct TranscodeCompletion {
    rx: watch::Receiver<Option<TranscodeOutcome>>,
}

impl TranscodeCompletion {
    pub(crate) fn new(rx: watch::Receiver<Option<TranscodeOutcome>>) -> Self {
        Self { rx }
    }

    /// Wait for the process to exit and its cleanup to finish.
    ///
    /// Returns `None` if the pipeline was torn down before a report was made.
    pub async fn wait(&self) -> Option<TranscodeOutcome> {
        let mut rx = self.rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
    }

    /// The outcome, if already available.
    pub fn get(&self) -> Option<TranscodeOutcome> {
        self.rx.borrow().clone()
    }
}

enum Body {
    Live(ReaderStream<ChildStdout>),
    /// stdout is closed; waiting to learn whether the download failed.
    Settling(BoxFuture<'static, Option<TranscodeOutcome>>),
    Failed(Option<io::Error>),
}

/// Transcoded container bytes for the downstream consumer.
///
/// Dropping the stream terminates the transcoder; its temp file is then
/// cleaned up in the background.
///
/// If the download fails while the transcoder runs, the transcoder is
/// stopped and the stream ends with that error as its last item.
pub struct TranscodeStream {
    key: PipelineKey,
    body: Body,
    content_type: &'static str,
    completion: TranscodeCompletion,
    _terminate_on_drop: Option<DropGuard>,
}

impl std::fmt::Debug for TranscodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeStream")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

impl TranscodeStream {
    pub(crate) fn live(
        key: PipelineKey,
        stdout: ChildStdout,
        guard: DropGuard,
        completion: TranscodeCompletion,
    ) -> Self {
        let content_type = key.variant.content_type();
        Self {
            key,
            body: Body::Live(ReaderStream::new(stdout)),
            content_type,
            completion,
            _terminate_on_drop: Some(guard),
        }
    }

    /// A stream whose only item is `error`.
    pub(crate) fn failed(
        key: PipelineKey,
        error: seedcast_core::Error,
        completion: TranscodeCompletion,
    ) -> Self {
        let content_type = key.variant.content_type();
        Self {
            key,
            body: Body::Failed(Some(error.into_io())),
            content_type,
            completion,
            _terminate_on_drop: None,
        }
    }

    pub fn key(&self) -> &PipelineKey {
        &self.key
    }

    /// MIME type of the container being streamed.
    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn completion(&self) -> TranscodeCompletion {
        self.completion.clone()
    }

    /// Stop consuming. Same as dropping the stream.
    pub fn close(self) {}
}

impl Stream for TranscodeStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match &mut this.body {
                Body::Live(reader) => match Pin::new(reader).poll_next(cx) {
                    Poll::Ready(None) => {
                        let completion = this.completion.clone();
                        this.body = Body::Settling(async move { completion.wait().await }.boxed());
                    }
                    item => return item,
                },
                Body::Settling(outcome) => {
                    let outcome = ready!(outcome.poll_unpin(cx));
                    this.body = Body::Failed(None);
                    let err = outcome
                        .and_then(|o| o.download_error)
                        .map(|e| io::Error::new(e.io_kind(), e));
                    return Poll::Ready(err.map(Err));
                }
                Body::Failed(err) => return Poll::Ready(err.take().map(Err)),
            }
        }
    }
}
