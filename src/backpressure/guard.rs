//! Admission control for an outgoing stream.
//!
//! # Modes
//! - Bounded (`max_inflight_messages > 0`): a send waits up to `max_block`
//!   for capacity, then fails alone with a [`SendTimeoutError`]. The stream
//!   keeps going.
//! - Unbounded (`max_inflight_messages = 0`): no in-flight limit. Records
//!   enter a demand window of `overflow_buffer` slots. A push-style
//!   [`send`](BackpressureGuard::send) that finds the window full ends the
//!   stream with a single [`BackpressureFailure`]. A pull-driven
//!   [`send_on_demand`](BackpressureGuard::send_on_demand) waits for a free
//!   slot and overflows only when the window stays full for `max_block`.
//!
//! # Outcome of each send
//! Exactly one of: accepted (later acknowledged or failed by the dispatcher),
//! rejected with a timeout, rejected by the terminal overflow, or refused
//! because the stream already ended.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time;

use crate::backpressure::inflight::{AdmissionError, InFlightCounter, InFlightPermit};
use crate::broker::Record;
use crate::config::ChannelConfig;
use crate::observability::metrics;

/// A single send exceeded its blocking deadline. Not terminal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "send on channel '{channel}' timed out after {waited_ms}ms waiting for in-flight capacity (limit {limit})"
)]
pub struct SendTimeoutError {
    pub channel: String,
    pub waited_ms: u64,
    pub limit: usize,
}

/// The stream outran downstream demand. Terminal for the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("backpressure overflow on channel '{channel}': {reason}")]
pub struct BackpressureFailure {
    pub channel: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    /// `None` selects unbounded mode.
    pub max_in_flight: Option<usize>,
    pub max_block: Duration,
    pub overflow_buffer: usize,
}

impl GuardConfig {
    pub fn from_channel(config: &ChannelConfig) -> Self {
        Self {
            max_in_flight: config.inflight_limit(),
            max_block: config.max_block(),
            overflow_buffer: config.overflow_buffer,
        }
    }

    pub fn bounded(limit: usize, max_block: Duration) -> Self {
        Self {
            max_in_flight: Some(limit),
            max_block,
            overflow_buffer: limit,
        }
    }

    pub fn unbounded(overflow_buffer: usize) -> Self {
        Self {
            max_in_flight: None,
            max_block: Duration::ZERO,
            overflow_buffer,
        }
    }

    fn queue_capacity(&self) -> usize {
        self.max_in_flight.unwrap_or(self.overflow_buffer).max(1)
    }
}

/// A record admitted to the stream, holding its in-flight slot until dropped.
#[derive(Debug)]
pub struct Admitted {
    seq: u64,
    record: Record,
    _permit: InFlightPermit,
}

impl Admitted {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn record(&self) -> &Record {
        &self.record
    }

    /// Give the record back, releasing the in-flight slot.
    pub fn into_record(self) -> Record {
        self.record
    }
}

/// What happened to one send.
#[derive(Debug)]
pub enum SendOutcome {
    Accepted { seq: u64 },
    RejectedTimeout { error: SendTimeoutError, record: Record },
    /// Carried by exactly one send: the one that overflowed.
    RejectedOverflow(BackpressureFailure),
    /// The stream ended earlier, by overflow or by close.
    Terminated(Record),
}

impl SendOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SendOutcome::Accepted { .. })
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Backpressure guard for one outgoing stream.
#[derive(Debug)]
pub struct BackpressureGuard {
    channel: String,
    config: GuardConfig,
    counter: Arc<InFlightCounter>,
    queue: mpsc::Sender<Admitted>,
    next_seq: AtomicU64,
    failure: OnceLock<BackpressureFailure>,
    terminated: AtomicBool,
    closed: watch::Sender<bool>,
}

impl BackpressureGuard {
    /// Build a guard and the receiving end its admitted records flow into.
    pub fn new(
        channel: impl Into<String>,
        config: GuardConfig,
    ) -> (Arc<Self>, mpsc::Receiver<Admitted>) {
        let channel = channel.into();
        let counter = match config.max_in_flight {
            Some(limit) => InFlightCounter::bounded(channel.clone(), limit),
            None => InFlightCounter::unbounded(channel.clone()),
        };
        let (queue, rx) = mpsc::channel(config.queue_capacity());
        let guard = Arc::new(Self {
            channel,
            config,
            counter,
            queue,
            next_seq: AtomicU64::new(0),
            failure: OnceLock::new(),
            terminated: AtomicBool::new(false),
            closed: watch::channel(false).0,
        });
        (guard, rx)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn in_flight(&self) -> usize {
        self.counter.count()
    }

    /// The terminal overflow, once it happened.
    pub fn failure(&self) -> Option<BackpressureFailure> {
        self.failure.get().cloned()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub async fn send(&self, record: Record) -> SendOutcome {
        if self.is_terminated() {
            return SendOutcome::Terminated(record);
        }

        let permit = match self.counter.acquire(self.config.max_block).await {
            Ok(permit) => permit,
            Err(AdmissionError::Timeout(waited)) => {
                let error = SendTimeoutError {
                    channel: self.channel.clone(),
                    waited_ms: waited.as_millis() as u64,
                    limit: self.counter.limit().unwrap_or(0),
                };
                tracing::warn!(
                    channel = %self.channel,
                    waited_ms = error.waited_ms,
                    in_flight = self.counter.count(),
                    "Send rejected; no in-flight capacity within max block"
                );
                metrics::record_send_timeout(&self.channel);
                return SendOutcome::RejectedTimeout { error, record };
            }
            Err(AdmissionError::Closed) => return SendOutcome::Terminated(record),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let admitted = Admitted {
            seq,
            record,
            _permit: permit,
        };
        match self.queue.try_send(admitted) {
            Ok(()) => SendOutcome::Accepted { seq },
            Err(TrySendError::Full(admitted)) => match self.overflow() {
                Some(failure) => SendOutcome::RejectedOverflow(failure),
                None => SendOutcome::Terminated(admitted.record),
            },
            Err(TrySendError::Closed(admitted)) => SendOutcome::Terminated(admitted.record),
        }
    }

    /// Send a record pulled from a demand-driven stream.
    ///
    /// Bounded mode behaves exactly like [`send`](Self::send). In unbounded
    /// mode the caller waits for a free slot in the demand window; the window
    /// staying full for `max_block` is the overflow.
    pub async fn send_on_demand(&self, record: Record) -> SendOutcome {
        if self.config.max_in_flight.is_some() {
            return self.send(record).await;
        }
        if self.is_terminated() {
            return SendOutcome::Terminated(record);
        }

        let mut closed = self.closed.subscribe();
        let slot = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => return SendOutcome::Terminated(record),
            slot = time::timeout(self.config.max_block, self.queue.reserve()) => slot,
        };
        let slot = match slot {
            Ok(Ok(slot)) => slot,
            Ok(Err(_)) => return SendOutcome::Terminated(record),
            Err(_) => {
                return match self.overflow() {
                    Some(failure) => SendOutcome::RejectedOverflow(failure),
                    None => SendOutcome::Terminated(record),
                }
            }
        };
        if self.is_terminated() {
            return SendOutcome::Terminated(record);
        }
        let permit = match self.counter.acquire(self.config.max_block).await {
            Ok(permit) => permit,
            Err(_) => return SendOutcome::Terminated(record),
        };

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        slot.send(Admitted {
            seq,
            record,
            _permit: permit,
        });
        SendOutcome::Accepted { seq }
    }

    /// End the stream on overflow. Returns the failure only to the first caller.
    fn overflow(&self) -> Option<BackpressureFailure> {
        let mut first = false;
        let failure = self
            .failure
            .get_or_init(|| {
                first = true;
                BackpressureFailure {
                    channel: self.channel.clone(),
                    reason: format!(
                        "outgoing stream exceeded downstream demand ({} buffered)",
                        self.config.overflow_buffer
                    ),
                }
            })
            .clone();
        self.close();
        if !first {
            return None;
        }
        tracing::error!(
            channel = %self.channel,
            buffered = self.config.overflow_buffer,
            "Backpressure overflow; outgoing stream terminated"
        );
        metrics::record_backpressure_failure(&self.channel);
        Some(failure)
    }

    /// Refuse further sends and release senders blocked on capacity.
    pub fn close(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.counter.close();
        self.closed.send_replace(true);
    }
}
