//! Outgoing channel.
//!
//! # Data Flow
//! ```text
//! application stream
//!     → pump: pull lazily, BackpressureGuard::send_on_demand
//!         → Rejection { record, error } when refused before admission
//!     → admission queue
//!     → dispatcher: client.send() bounded by request timeout, in admission order
//!     → Delivery { seq, Ok(metadata) | Err(per-message failure) }
//! ```
//!
//! # Design Decisions
//! - One dispatcher per channel, so acknowledgments follow admission order
//! - A retriable send failure keeps the record at the head of the queue and
//!   disconnects the channel; the record is retried on recovery or after
//!   the retry backoff, whichever comes first
//! - Overflow and stream failures are terminal; records still queued then
//!   fail one by one with the terminal error

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::time;

use crate::backpressure::{Admitted, BackpressureGuard, GuardConfig, SendOutcome};
use crate::broker::{BrokerClient, BrokerError, Record, RecordMetadata};
use crate::config::{ChannelConfig, ClientConfig};
use crate::connector::wait_closed;
use crate::error::{ConnectorError, ConnectorResult};
use crate::health::{ConnectionMonitor, HealthRegistry};
use crate::observability::metrics;
use crate::recovery::Recoverable;
use crate::stream::StreamFailure;

/// Counters of one sink's sends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SinkStats {
    pub accepted: u64,
    pub acknowledged: u64,
    pub timed_out: u64,
    pub failed: u64,
}

/// A stream record refused before admission, handed back with the reason.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub record: Record,
    pub error: ConnectorError,
}

/// Final result of one admitted record.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub seq: u64,
    pub result: Result<RecordMetadata, ConnectorError>,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    acknowledged: AtomicU64,
    timed_out: AtomicU64,
    failed: AtomicU64,
}

pub(crate) struct SinkShared {
    name: String,
    topic: String,
    client: Arc<dyn BrokerClient>,
    client_config: ClientConfig,
    monitor: Arc<ConnectionMonitor>,
    registry: HealthRegistry,
    guard: Arc<BackpressureGuard>,
    resume: Notify,
    failure: OnceLock<ConnectorError>,
    counters: Counters,
    deliveries: broadcast::Sender<Delivery>,
    rejections: broadcast::Sender<Rejection>,
    finished: watch::Sender<bool>,
}

impl SinkShared {
    pub(crate) fn new(
        config: &ChannelConfig,
        client: Arc<dyn BrokerClient>,
        monitor: Arc<ConnectionMonitor>,
        registry: HealthRegistry,
    ) -> (Arc<Self>, mpsc::Receiver<Admitted>) {
        let (guard, queue) =
            BackpressureGuard::new(&config.name, GuardConfig::from_channel(config));
        let (deliveries, _) = broadcast::channel(1024);
        let (rejections, _) = broadcast::channel(1024);
        let (finished, _) = watch::channel(false);
        let shared = Arc::new(Self {
            name: config.name.clone(),
            topic: config.topic().to_string(),
            client,
            client_config: config.client.clone(),
            monitor,
            registry,
            guard,
            resume: Notify::new(),
            failure: OnceLock::new(),
            counters: Counters::default(),
            deliveries,
            rejections,
            finished,
        });
        (shared, queue)
    }

    pub(crate) fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.monitor
    }

    pub(crate) fn close(&self) {
        self.guard.close();
        self.monitor.close();
    }

    fn closed_error(&self) -> ConnectorError {
        self.failure
            .get()
            .cloned()
            .unwrap_or_else(|| ConnectorError::Closed(self.name.clone()))
    }

    /// Record the sink's terminal failure. Only the first one sticks.
    fn terminate(&self, error: ConnectorError) {
        if self.failure.set(error.clone()).is_err() {
            return;
        }
        self.guard.close();
        self.monitor.close_with_reason(error.to_string());
    }

    /// Account for one send. A refused record comes back with the error.
    fn admit(&self, outcome: SendOutcome) -> Result<u64, (ConnectorError, Option<Record>)> {
        match outcome {
            SendOutcome::Accepted { seq } => {
                self.counters.accepted.fetch_add(1, Ordering::SeqCst);
                Ok(seq)
            }
            SendOutcome::RejectedTimeout { error, record } => {
                self.counters.timed_out.fetch_add(1, Ordering::SeqCst);
                Err((error.into(), Some(record)))
            }
            SendOutcome::RejectedOverflow(failure) => {
                let error = ConnectorError::from(failure);
                self.terminate(error.clone());
                Err((error, None))
            }
            SendOutcome::Terminated(record) => Err((self.closed_error(), Some(record))),
        }
    }

    fn reject(&self, record: Record, error: ConnectorError) {
        tracing::debug!(channel = %self.name, error = %error, "Stream record rejected");
        let _ = self.rejections.send(Rejection { record, error });
    }

    /// Pull the application stream until it ends, fails or the channel closes.
    pub(crate) async fn pump<S>(self: Arc<Self>, stream: S)
    where
        S: Stream<Item = Result<Record, StreamFailure>> + Send + 'static,
    {
        let mut stream = Box::pin(stream);
        let mut closed = self.monitor.closed_signal();
        loop {
            let item = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => break,
                item = stream.next() => item,
            };
            match item {
                None => {
                    tracing::info!(channel = %self.name, "Outgoing stream completed");
                    break;
                }
                Some(Err(failure)) => {
                    tracing::error!(channel = %self.name, error = %failure, "Outgoing stream failed");
                    self.terminate(failure.into());
                    break;
                }
                Some(Ok(record)) => {
                    let outcome = self.guard.send_on_demand(record).await;
                    if let Err((error, record)) = self.admit(outcome) {
                        let terminal = !matches!(error, ConnectorError::SendTimeout(_));
                        if let Some(record) = record {
                            self.reject(record, error);
                        }
                        if terminal {
                            break;
                        }
                    }
                }
            }
        }
        self.finished.send_replace(true);
    }

    /// Send admitted records to the broker in admission order.
    pub(crate) async fn dispatch(self: Arc<Self>, mut queue: mpsc::Receiver<Admitted>) {
        let mut closed = self.monitor.closed_signal();
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_closed(&mut closed) => None,
                next = queue.recv() => next,
            };
            let Some(admitted) = next else { break };
            if !self.deliver(admitted, &mut closed).await {
                break;
            }
        }

        queue.close();
        let error = self.closed_error();
        while let Some(admitted) = queue.recv().await {
            self.fail(admitted, error.clone());
        }
        tracing::debug!(channel = %self.name, "Sink dispatcher exited");
    }

    /// Deliver one record, retrying while the failure is retriable.
    /// Returns false when the channel ended with the record in hand.
    async fn deliver(&self, admitted: Admitted, closed: &mut watch::Receiver<bool>) -> bool {
        let request_timeout = self.client_config.request_timeout();
        loop {
            let attempt = tokio::select! {
                biased;
                _ = wait_closed(closed) => None,
                attempt = time::timeout(
                    request_timeout,
                    self.client.send(&self.topic, admitted.record()),
                ) => Some(attempt),
            };
            let Some(attempt) = attempt else {
                self.fail(admitted, self.closed_error());
                return false;
            };

            let reason = match attempt {
                Ok(Ok(metadata)) => {
                    self.acknowledge(admitted, metadata);
                    return true;
                }
                Ok(Err(e)) if e.is_retriable() => format!("send failed: {}", e),
                Ok(Err(BrokerError::Fatal(reason))) => {
                    self.fail(admitted, ConnectorError::Fatal(reason.clone()));
                    self.registry.report_fatal(&self.name, reason.clone());
                    self.monitor.close_with_reason(format!("fatal: {}", reason));
                    return false;
                }
                Ok(Err(e)) => {
                    self.fail(admitted, e.into());
                    return true;
                }
                Err(_) => format!("send timed out after {}ms", request_timeout.as_millis()),
            };

            tracing::debug!(
                channel = %self.name,
                seq = admitted.seq(),
                reason = %reason,
                "Send will be retried"
            );
            self.monitor.report_failure(reason);

            let resumed = tokio::select! {
                biased;
                _ = wait_closed(closed) => false,
                _ = self.resume.notified() => true,
                _ = time::sleep(self.client_config.retry_backoff()) => true,
            };
            if !resumed {
                self.fail(admitted, self.closed_error());
                return false;
            }
        }
    }

    fn acknowledge(&self, admitted: Admitted, metadata: RecordMetadata) {
        let seq = admitted.seq();
        drop(admitted);
        self.counters.acknowledged.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(channel = %self.name, seq, offset = metadata.offset, "Record acknowledged");
        let _ = self.deliveries.send(Delivery {
            seq,
            result: Ok(metadata),
        });
    }

    fn fail(&self, admitted: Admitted, error: ConnectorError) {
        let seq = admitted.seq();
        drop(admitted);
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        metrics::record_send_failure(&self.name);
        tracing::warn!(channel = %self.name, seq, error = %error, "Record delivery failed");
        let _ = self.deliveries.send(Delivery {
            seq,
            result: Err(error),
        });
    }
}

#[async_trait]
impl Recoverable for SinkShared {
    /// Release the record waiting at the head of the queue.
    async fn recover(&self) -> ConnectorResult<()> {
        tracing::debug!(
            channel = %self.name,
            queued = self.guard.in_flight(),
            "Resuming production"
        );
        self.resume.notify_one();
        Ok(())
    }
}

/// Handle to a running outgoing channel. Cheap to clone.
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<SinkShared>,
}

impl SinkHandle {
    pub(crate) fn new(shared: Arc<SinkShared>) -> Self {
        Self { shared }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn monitor(&self) -> &Arc<ConnectionMonitor> {
        &self.shared.monitor
    }

    pub fn guard(&self) -> &Arc<BackpressureGuard> {
        &self.shared.guard
    }

    pub fn stats(&self) -> SinkStats {
        let c = &self.shared.counters;
        SinkStats {
            accepted: c.accepted.load(Ordering::SeqCst),
            acknowledged: c.acknowledged.load(Ordering::SeqCst),
            timed_out: c.timed_out.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
        }
    }

    /// The terminal failure (overflow or stream failure), once captured.
    pub fn failure(&self) -> Option<ConnectorError> {
        self.shared.failure.get().cloned()
    }

    /// Subscribe to the outcome of every admitted record from now on.
    pub fn deliveries(&self) -> broadcast::Receiver<Delivery> {
        self.shared.deliveries.subscribe()
    }

    /// Stream records refused before admission (send timeouts, sends after
    /// the channel ended). Admitted records report through
    /// [`deliveries`](Self::deliveries) instead.
    pub fn rejections(&self) -> broadcast::Receiver<Rejection> {
        self.shared.rejections.subscribe()
    }

    /// Push one record alongside the stream. The caller gets the error
    /// directly; in unbounded mode a full window is an overflow.
    pub async fn send(&self, record: Record) -> ConnectorResult<u64> {
        let outcome = self.shared.guard.send(record).await;
        self.shared.admit(outcome).map_err(|(error, _)| error)
    }

    /// Wait until the application stream has ended, for whatever reason.
    pub async fn finished(&self) {
        let mut finished = self.shared.finished.subscribe();
        let _ = finished.wait_for(|finished| *finished).await;
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("name", &self.shared.name)
            .field("topic", &self.shared.topic)
            .field("stats", &self.stats())
            .finish()
    }
}
