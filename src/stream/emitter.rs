//! Channel-backed stream with an explicit control handle.
//!
//! # Design Decisions
//! - The stream is lazy: nothing is produced unless the consumer polls it
//! - `complete` and `fail` end the stream for every clone of the emitter;
//!   a new stream needs a new `emitter()` call
//! - The buffer is the downstream demand window. `emit` waits for room,
//!   `try_emit` refuses instead

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{self, MissedTickBehavior};

use crate::stream::StreamFailure;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EmitError<T> {
    #[error("stream already ended")]
    Ended(T),
    #[error("no downstream demand")]
    Full(T),
}

#[derive(Debug)]
enum Signal<T> {
    Item(T),
    Failed(StreamFailure),
    Completed,
}

/// Producer side. Clones share the same stream.
#[derive(Debug)]
pub struct Emitter<T> {
    tx: mpsc::Sender<Signal<T>>,
    ended: Arc<AtomicBool>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            ended: Arc::clone(&self.ended),
        }
    }
}

/// Create an emitter and the stream it feeds, buffering at most `buffer` items.
pub fn emitter<T>(buffer: usize) -> (Emitter<T>, EmitterStream<T>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (
        Emitter {
            tx,
            ended: Arc::new(AtomicBool::new(false)),
        },
        EmitterStream { rx, done: false },
    )
}

impl<T> Emitter<T> {
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst) || self.tx.is_closed()
    }

    /// Emit one item, waiting for buffer room.
    pub async fn emit(&self, item: T) -> Result<(), EmitError<T>> {
        if self.is_ended() {
            return Err(EmitError::Ended(item));
        }
        match self.tx.reserve().await {
            Ok(slot) => {
                slot.send(Signal::Item(item));
                Ok(())
            }
            Err(_) => Err(EmitError::Ended(item)),
        }
    }

    pub fn try_emit(&self, item: T) -> Result<(), EmitError<T>> {
        if self.is_ended() {
            return Err(EmitError::Ended(item));
        }
        match self.tx.try_reserve() {
            Ok(slot) => {
                slot.send(Signal::Item(item));
                Ok(())
            }
            Err(TrySendError::Full(())) => Err(EmitError::Full(item)),
            Err(TrySendError::Closed(())) => Err(EmitError::Ended(item)),
        }
    }

    /// End the stream normally once buffered items are consumed.
    pub async fn complete(&self) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(Signal::Completed).await;
        }
    }

    /// End the stream with a failure once buffered items are consumed.
    pub async fn fail(&self, reason: impl Into<String>) {
        if !self.ended.swap(true, Ordering::SeqCst) {
            let _ = self
                .tx
                .send(Signal::Failed(StreamFailure::new(reason)))
                .await;
        }
    }
}

/// Consumer side of an [`emitter`].
#[derive(Debug)]
pub struct EmitterStream<T> {
    rx: mpsc::Receiver<Signal<T>>,
    done: bool,
}

impl<T> Stream for EmitterStream<T> {
    type Item = Result<T, StreamFailure>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Item(item))) => Poll::Ready(Some(Ok(item))),
            Poll::Ready(Some(Signal::Failed(failure))) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(Some(Err(failure)))
            }
            Poll::Ready(Some(Signal::Completed)) | Poll::Ready(None) => {
                self.done = true;
                self.rx.close();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// An endless counter yielding `0, 1, 2, ...` once per `period`.
pub fn ticks(period: Duration) -> impl Stream<Item = u64> + Send {
    stream::unfold((None::<time::Interval>, 0u64), move |(interval, n)| async move {
        let mut interval = interval.unwrap_or_else(|| {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        interval.tick().await;
        Some((n, (Some(interval), n + 1)))
    })
}
