//! Incoming channel.
//!
//! # Data Flow
//! ```text
//! resolve position (committed offset, else auto_offset_reset)
//!     → fetch(position, max_poll_records)
//!     → deliver each record to the application, advancing the local position
//!     → commit(local position)
//! ```
//!
//! # Design Decisions
//! - The local position is what the application has received. It wins over
//!   the broker's committed offset, so a lost commit never redelivers
//! - Fetch and commit failures disconnect the channel and are retried on
//!   recovery or after the retry backoff, whichever comes first

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time;

use crate::broker::{BrokerClient, BrokerError, BrokerResult, ConsumerRecord};
use crate::config::{ChannelConfig, ClientConfig, OffsetReset};
use crate::connector::wait_closed;
use crate::error::ConnectorResult;
use crate::health::{ConnectionMonitor, HealthRegistry};
use crate::recovery::Recoverable;

enum PollError {
    Retriable(String),
    Fatal(String),
    /// The application dropped its receiver.
    Detached,
}

pub(crate) struct SourceShared {
    name: String,
    topic: String,
    group_id: String,
    client: Arc<dyn BrokerClient>,
    client_config: ClientConfig,
    max_poll_records: usize,
    poll_interval: Duration,
    auto_offset_reset: OffsetReset,
    monitor: Arc<ConnectionMonitor>,
    registry: HealthRegistry,
    resume: Notify,
    position: Mutex<Option<u64>>,
    delivered: AtomicU64,
}

impl SourceShared {
    pub(crate) fn new(
        config: &ChannelConfig,
        client: Arc<dyn BrokerClient>,
        monitor: Arc<ConnectionMonitor>,
        registry: HealthRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            topic: config.topic().to_string(),
            group_id: config.group_id().to_string(),
            client,
            client_config: config.client.clone(),
            max_poll_records: config.max_poll_records,
            poll_interval: config.poll_interval(),
            auto_offset_reset: config.auto_offset_reset,
            monitor,
            registry,
            resume: Notify::new(),
            position: Mutex::new(None),
            delivered: AtomicU64::new(0),
        })
    }

    pub(crate) fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub(crate) fn close(&self) {
        self.monitor.close();
    }

    /// Poll until the channel closes, the receiver goes away, or a fatal error.
    pub(crate) async fn poll(self: Arc<Self>, records: mpsc::Sender<ConsumerRecord>) {
        let mut closed = self.monitor.closed_signal();
        let mut committed: Option<u64> = None;
        loop {
            let step = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => break,
                step = self.poll_once(&records, &mut committed) => step,
            };
            let pause = match step {
                Ok(0) => self.poll_interval,
                Ok(_) => continue,
                Err(PollError::Retriable(reason)) => {
                    tracing::debug!(channel = %self.name, reason = %reason, "Poll will be retried");
                    self.monitor.report_failure(reason);
                    self.client_config.retry_backoff()
                }
                Err(PollError::Fatal(reason)) => {
                    self.registry.report_fatal(&self.name, reason.clone());
                    self.monitor.close_with_reason(format!("fatal: {}", reason));
                    break;
                }
                Err(PollError::Detached) => {
                    tracing::info!(channel = %self.name, "Record receiver dropped; source stopping");
                    break;
                }
            };
            let resumed = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => false,
                _ = self.resume.notified() => true,
                _ = time::sleep(pause) => true,
            };
            if !resumed {
                break;
            }
        }
        tracing::debug!(channel = %self.name, "Source poller exited");
    }

    async fn poll_once(
        &self,
        records: &mpsc::Sender<ConsumerRecord>,
        committed: &mut Option<u64>,
    ) -> Result<usize, PollError> {
        let current = *self.position.lock();
        let offset = match current {
            Some(offset) => offset,
            None => {
                let (offset, from_commit) = self.resolve_position().await?;
                *self.position.lock() = Some(offset);
                if from_commit {
                    *committed = Some(offset);
                }
                tracing::info!(
                    channel = %self.name,
                    topic = %self.topic,
                    offset,
                    from_commit,
                    "Source position resolved"
                );
                offset
            }
        };

        let batch = self
            .call(
                "fetch",
                self.client.fetch(&self.topic, offset, self.max_poll_records),
            )
            .await?;
        let count = batch.len();
        for record in batch {
            let next = record.offset + 1;
            records
                .send(record)
                .await
                .map_err(|_| PollError::Detached)?;
            *self.position.lock() = Some(next);
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }

        let position = *self.position.lock();
        if let Some(position) = position {
            if *committed != Some(position) {
                self.call(
                    "commit",
                    self.client.commit(&self.group_id, &self.topic, position),
                )
                .await?;
                *committed = Some(position);
            }
        }
        Ok(count)
    }

    async fn resolve_position(&self) -> Result<(u64, bool), PollError> {
        let stored = self
            .call("committed", self.client.committed(&self.group_id, &self.topic))
            .await?;
        if let Some(offset) = stored {
            return Ok((offset, true));
        }
        let offset = match self.auto_offset_reset {
            OffsetReset::Earliest => 0,
            OffsetReset::Latest => {
                self.call("end_offset", self.client.end_offset(&self.topic))
                    .await?
            }
        };
        Ok((offset, false))
    }

    /// Run one broker call under the default API timeout.
    async fn call<T>(
        &self,
        operation: &str,
        request: impl Future<Output = BrokerResult<T>>,
    ) -> Result<T, PollError> {
        let timeout = self.client_config.api_timeout();
        match time::timeout(timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(BrokerError::Fatal(reason))) => Err(PollError::Fatal(reason)),
            Ok(Err(e)) => Err(PollError::Retriable(format!("{} failed: {}", operation, e))),
            Err(_) => Err(PollError::Retriable(format!(
                "{} timed out after {}ms",
                operation,
                timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl Recoverable for SourceShared {
    /// Resume polling from the local position. No broker call is made, so
    /// recovery itself cannot fail.
    async fn recover(&self) -> ConnectorResult<()> {
        tracing::debug!(
            channel = %self.name,
            position = ?*self.position.lock(),
            "Resuming consumption"
        );
        self.resume.notify_one();
        Ok(())
    }
}

/// Handle to a running incoming channel.
pub struct SourceHandle {
    shared: Arc<SourceShared>,
    records: mpsc::Receiver<ConsumerRecord>,
}

impl SourceHandle {
    pub(crate) fn new(shared: Arc<SourceShared>, records: mpsc::Receiver<ConsumerRecord>) -> Self {
        Self { shared, records }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.shared.monitor
    }

    /// Next record, or `None` once the channel stopped.
    pub async fn recv(&mut self) -> Option<ConsumerRecord> {
        self.records.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ConsumerRecord> {
        self.records.try_recv().ok()
    }

    /// Next offset to read, once resolved.
    pub fn position(&self) -> Option<u64> {
        *self.shared.position.lock()
    }

    /// Records handed to the application so far.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceHandle")
            .field("name", &self.shared.name)
            .field("topic", &self.shared.topic)
            .field("position", &self.position())
            .finish()
    }
}
