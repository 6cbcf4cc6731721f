//! In-flight send accounting.
//!
//! # Responsibilities
//! - Count sends admitted but not yet acknowledged or failed
//! - Enforce the optional `max_inflight_messages` bound
//! - Release capacity automatically when a permit drops
//!
//! # Design Decisions
//! - The bound is a semaphore; waiting for capacity is a timed acquire
//! - The count is incremented only after a permit is held, so
//!   `0 <= count <= limit` holds at every instant
//! - Closing the semaphore wakes every blocked sender with `Closed`

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

use crate::observability::metrics;

/// Why capacity could not be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    /// No capacity freed up within the blocking deadline.
    Timeout(Duration),
    /// The counter was closed while waiting.
    Closed,
}

/// Per-stream count of unacknowledged sends.
#[derive(Debug)]
pub struct InFlightCounter {
    channel: String,
    count: AtomicUsize,
    limit: Option<usize>,
    permits: Option<Arc<Semaphore>>,
    closed: AtomicBool,
}

impl InFlightCounter {
    pub fn bounded(channel: impl Into<String>, limit: usize) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.into(),
            count: AtomicUsize::new(0),
            limit: Some(limit),
            permits: Some(Arc::new(Semaphore::new(limit))),
            closed: AtomicBool::new(false),
        })
    }

    pub fn unbounded(channel: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.into(),
            count: AtomicUsize::new(0),
            limit: None,
            permits: None,
            closed: AtomicBool::new(false),
        })
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Take one unit of capacity, waiting at most `max_block` when bounded.
    pub async fn acquire(
        self: &Arc<Self>,
        max_block: Duration,
    ) -> Result<InFlightPermit, AdmissionError> {
        if self.is_closed() {
            return Err(AdmissionError::Closed);
        }
        let permit = match &self.permits {
            Some(semaphore) => {
                match time::timeout(max_block, Arc::clone(semaphore).acquire_owned()).await {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => return Err(AdmissionError::Closed),
                    Err(_) => return Err(AdmissionError::Timeout(max_block)),
                }
            }
            None => None,
        };
        Ok(self.admit(permit))
    }

    fn admit(self: &Arc<Self>, permit: Option<OwnedSemaphorePermit>) -> InFlightPermit {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_inflight(&self.channel, count);
        InFlightPermit {
            counter: Arc::clone(self),
            _permit: permit,
        }
    }

    /// Refuse new admissions and wake every blocked sender.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(semaphore) = &self.permits {
            semaphore.close();
        }
    }
}

/// A RAII guard holding one unit of in-flight capacity.
#[derive(Debug)]
pub struct InFlightPermit {
    counter: Arc<InFlightCounter>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let count = self.counter.count.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_inflight(&self.counter.channel, count);
    }
}
