//! Finite, non-restartable result streams.
//!
//! A [`ResultStream`] is the receiving half of a bounded channel. The producer
//! task ends the stream by dropping its [`ResultSender`]; the consumer ends it
//! early by dropping the stream, which producers observe through
//! [`ResultSender::closed`].

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::DhtError;

/// Buffer between a lookup task and its consumer.
pub const DEFAULT_STREAM_BUFFER: usize = 32;

pub struct ResultStream<T> {
    rx: mpsc::Receiver<Result<T, DhtError>>,
}

pub struct ResultSender<T> {
    tx: mpsc::Sender<Result<T, DhtError>>,
}

impl<T> Clone for ResultSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> ResultStream<T> {
    pub fn channel(buffer: usize) -> (ResultSender<T>, ResultStream<T>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (ResultSender { tx }, ResultStream { rx })
    }

    pub fn empty() -> Self {
        let (_, stream) = Self::channel(1);
        stream
    }

    /// A stream that yields exactly `items` and ends.
    pub fn from_vec(items: Vec<T>) -> Self {
        let (tx, rx) = mpsc::channel(items.len().max(1));
        for item in items {
            // Capacity covers every item, so try_send cannot fail.
            let _ = tx.try_send(Ok(item));
        }
        ResultStream { rx }
    }

    pub fn from_error(err: DhtError) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Err(err));
        ResultStream { rx }
    }

    /// Next item, or `None` once the producer is done.
    pub async fn next(&mut self) -> Option<Result<T, DhtError>> {
        self.rx.recv().await
    }

    /// Drain the stream, stopping at the first error.
    pub async fn read_all(mut self) -> Result<Vec<T>, DhtError> {
        let mut out = Vec::new();
        while let Some(item) = self.rx.recv().await {
            out.push(item?);
        }
        Ok(out)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T, DhtError>> + Send + 'static {
        futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }
}

impl<T> ResultSender<T> {
    /// Deliver one item. `false` means the consumer is gone and the producer
    /// should stop.
    pub async fn send(&self, item: Result<T, DhtError>) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Resolves when the consumer drops the stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
