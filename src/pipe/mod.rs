//! Lazy, cancellation-aware data pipes.
//!
//! A [`Pipe`] is a forward-only sequence of typed items pulled by exactly
//! one downstream consumer. Pulls observe a cancellation token, producers
//! may fail mid-stream, and a pipe can be closed early to release whatever
//! resources the producer holds.

use std::time::Duration;

use async_stream::stream;
use futures::stream::{BoxStream, StreamExt};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{PipelineError, Result};

enum PipeState<T> {
    Open(BoxStream<'static, Result<T>>),
    Closed,
}

/// A lazy, single-consumer, cancellation-aware sequence of items.
///
/// Pipes are the data plane of a pipeline: sources create them, transforms
/// wrap them, sinks drain them. A pipe carries a `stream_name` for
/// diagnostics and, when the producer knows its cardinality upfront, an
/// item `count` that downstream buffering can use for right-sizing.
pub struct Pipe<T> {
    name: String,
    count: Option<usize>,
    cancel: CancellationToken,
    state: PipeState<T>,
}

impl<T: Send + 'static> Pipe<T> {
    /// Wrap an existing stream of fallible items.
    pub fn new(
        name: impl Into<String>,
        stream: impl Stream<Item = Result<T>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            count: None,
            cancel: CancellationToken::new(),
            state: PipeState::Open(stream.fuse().boxed()),
        }
    }

    /// A pipe over an in-memory collection. The item count is known upfront.
    pub fn from_values(name: impl Into<String>, values: Vec<T>) -> Self {
        let count = values.len();
        Self::new(name, futures::stream::iter(values.into_iter().map(Ok))).with_count(count)
    }

    /// A pipe over an arbitrary iterator. No upfront count is recorded.
    pub fn from_iter<I>(name: impl Into<String>, iter: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::new(name, futures::stream::iter(iter.into_iter().map(Ok)))
    }

    /// A pipe fed by a channel, typically from a producing task.
    pub fn from_channel(name: impl Into<String>, rx: mpsc::Receiver<Result<T>>) -> Self {
        Self::new(name, ReceiverStream::new(rx))
    }

    /// An empty pipe. Valid input for any consumer.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, futures::stream::empty()).with_count(0)
    }

    /// Attach a known upfront item count.
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Attach the cancellation token pulls should observe.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The diagnostic identity of this stream.
    pub fn stream_name(&self) -> &str {
        &self.name
    }

    /// The upfront item count, when the producer knows it.
    pub fn count(&self) -> Option<usize> {
        self.count
    }

    /// The cancellation token pulls observe.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Pull the next item.
    ///
    /// Returns `None` at end of stream. A cancelled pull fails with
    /// [`PipelineError::Cancelled`] and releases the underlying producer;
    /// pulling a closed pipe fails with [`PipelineError::PipeClosed`].
    pub async fn next(&mut self) -> Option<Result<T>> {
        let stream = match &mut self.state {
            PipeState::Open(stream) => stream,
            PipeState::Closed => return Some(Err(PipelineError::PipeClosed(self.name.clone()))),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.state = PipeState::Closed;
                Some(Err(PipelineError::Cancelled))
            }
            item = stream.next() => item,
        }
    }

    /// Release the underlying producer. Idempotent; later pulls fail.
    pub async fn close(&mut self) {
        self.state = PipeState::Closed;
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, PipeState::Closed)
    }

    /// Map each item through `f`, preserving name, count, and cancellation.
    pub fn map<U, F>(self, f: F) -> Pipe<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let (name, count, cancel) = (self.name, self.count, self.cancel);
        let mut f = f;
        let stream = match self.state {
            PipeState::Open(stream) => stream.map(move |item| item.map(&mut f)).boxed(),
            PipeState::Closed => futures::stream::empty().boxed(),
        };
        Pipe {
            name,
            count,
            cancel,
            state: PipeState::Open(stream),
        }
    }

    /// Map each item through a fallible `f`. A mapping failure surfaces as
    /// the item's error and subsequent pulls see the remainder unchanged.
    pub fn try_map<U, F>(self, f: F) -> Pipe<U>
    where
        U: Send + 'static,
        F: FnMut(T) -> Result<U> + Send + 'static,
    {
        let (name, count, cancel) = (self.name, self.count, self.cancel);
        let mut f = f;
        let stream = match self.state {
            PipeState::Open(stream) => stream.map(move |item| item.and_then(&mut f)).boxed(),
            PipeState::Closed => futures::stream::empty().boxed(),
        };
        Pipe {
            name,
            count,
            cancel,
            state: PipeState::Open(stream),
        }
    }

    /// Group items into chunks of at most `size`, flushing a partial chunk
    /// when `timeout` elapses between the first pull of a chunk and its
    /// completion. Item order inside and across chunks is preserved.
    pub fn batched(mut self, size: usize, timeout: Option<Duration>) -> Pipe<Vec<T>> {
        let name = format!("{}/batched", self.name);
        let cancel = self.cancel.clone();
        let stream = stream! {
            loop {
                let mut chunk = Vec::with_capacity(size.min(64));
                let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
                loop {
                    let next = match deadline {
                        Some(deadline) => {
                            match tokio::time::timeout_at(deadline, self.next()).await {
                                Ok(next) => next,
                                Err(_) => break,
                            }
                        }
                        None => self.next().await,
                    };
                    match next {
                        Some(Ok(item)) => {
                            chunk.push(item);
                            if chunk.len() >= size {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            if !chunk.is_empty() {
                                yield Ok(chunk);
                            }
                            yield Err(e);
                            return;
                        }
                        None => {
                            if !chunk.is_empty() {
                                yield Ok(chunk);
                            }
                            return;
                        }
                    }
                }
                if !chunk.is_empty() {
                    yield Ok(chunk);
                }
            }
        };
        Pipe::new(name, stream).with_cancellation(cancel)
    }

    /// Drain the pipe into a vector. Stops at the first error.
    pub async fn collect(mut self) -> Result<Vec<T>> {
        let mut out = match self.count {
            Some(n) => Vec::with_capacity(n),
            None => Vec::new(),
        };
        while let Some(item) = self.next().await {
            out.push(item?);
        }
        Ok(out)
    }
}

impl<T> std::fmt::Debug for Pipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("name", &self.name)
            .field("count", &self.count)
            .field("closed", &matches!(self.state, PipeState::Closed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_pipe_is_valid() {
        let mut pipe = Pipe::<i32>::empty("nothing");
        assert_eq!(pipe.count(), Some(0));
        assert!(pipe.next().await.is_none());
        assert!(pipe.next().await.is_none());
    }

    #[tokio::test]
    async fn from_values_reports_count() {
        let pipe = Pipe::from_values("numbers", vec![1, 2, 3]);
        assert_eq!(pipe.count(), Some(3));
        use tokio_test::assert_ok;
        assert_eq!(assert_ok!(pipe.collect().await), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn producer_error_surfaces_on_pull() {
        let stream = stream! {
            yield Ok(1);
            yield Err(PipelineError::item("boom"));
        };
        let mut pipe = Pipe::new("failing", stream);
        assert_eq!(pipe.next().await.unwrap().unwrap(), 1);
        assert!(pipe.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn closed_pipe_rejects_iteration() {
        let mut pipe = Pipe::from_values("numbers", vec![1, 2]);
        assert_eq!(pipe.next().await.unwrap().unwrap(), 1);
        pipe.close().await;
        pipe.close().await;
        match pipe.next().await {
            Some(Err(PipelineError::PipeClosed(name))) => assert_eq!(name, "numbers"),
            other => panic!("expected PipeClosed, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn cancelled_pull_fails_with_cancellation() {
        let token = CancellationToken::new();
        let mut pipe =
            Pipe::from_values("numbers", vec![1, 2, 3]).with_cancellation(token.clone());
        assert_eq!(pipe.next().await.unwrap().unwrap(), 1);
        token.cancel();
        match pipe.next().await {
            Some(Err(PipelineError::Cancelled)) => {}
            other => panic!("expected Cancelled, got {:?}", other.map(|r| r.is_ok())),
        }
    }

    #[tokio::test]
    async fn batched_preserves_order() {
        let pipe = Pipe::from_values("numbers", (0..7).collect());
        let chunks = pipe.batched(3, None).collect().await.unwrap();
        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[tokio::test]
    async fn map_preserves_metadata() {
        let pipe = Pipe::from_values("numbers", vec![1, 2]).map(|n| n * 10);
        assert_eq!(pipe.stream_name(), "numbers");
        assert_eq!(pipe.count(), Some(2));
        assert_eq!(pipe.collect().await.unwrap(), vec![10, 20]);
    }
}
