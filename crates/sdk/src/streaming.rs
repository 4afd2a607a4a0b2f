//! Failure-observing stream wrapper.
//!
//! [`DetectingStream`] passes every item of a server-streaming call through
//! untouched. The first error item is reported to the connection's
//! [`LeaderChangeDetector`]; later errors on the same stream are not, so one
//! broken stream causes at most one reconnection.

use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::Stream;
use tonic::Status;

use crate::detector::LeaderChangeDetector;

/// Server-streaming response wrapper that reports its first failure.
pub struct DetectingStream<S> {
    inner: S,
    detector: LeaderChangeDetector,
    observed: bool,
}

impl<S> DetectingStream<S> {
    pub(crate) fn new(inner: S, detector: LeaderChangeDetector) -> Self {
        Self { inner, detector, observed: false }
    }

    /// Returns whether a failure has been reported for this stream.
    #[must_use]
    pub fn has_observed_failure(&self) -> bool {
        self.observed
    }

    /// Unwraps the underlying stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S, T> Stream for DetectingStream<S>
where
    S: Stream<Item = Result<T, Status>> + Unpin,
{
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        if let Poll::Ready(Some(Err(status))) = &polled {
            if !self.observed {
                self.observed = true;
                self.detector.observe(status);
            }
        }
        polled
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<S> fmt::Debug for DetectingStream<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetectingStream")
            .field("detector", &self.detector)
            .field("observed", &self.observed)
            .finish_non_exhaustive()
    }
}
