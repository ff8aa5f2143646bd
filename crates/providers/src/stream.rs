//! Caller side of a streamed generation

use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::error::Result;

/// Text chunks forwarded from a provider as they arrive.
///
/// Dropping the stream or calling [`stop`](Self::stop) aborts the upstream
/// request.
#[derive(Debug)]
pub struct GenerationStream {
    provider: String,
    chunks: ReceiverStream<Result<String>>,
    forwarder: JoinHandle<()>,
    stopped: AtomicBool,
}

impl GenerationStream {
    pub(crate) fn new(
        provider: String,
        chunks: ReceiverStream<Result<String>>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            provider,
            chunks,
            forwarder,
            stopped: AtomicBool::new(false),
        }
    }

    /// Provider serving this stream.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Abort the upstream request. Later calls do nothing.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(provider = %self.provider, "Stopping generation stream");
            self.forwarder.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Stream for GenerationStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.is_stopped() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.chunks).poll_next(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}
