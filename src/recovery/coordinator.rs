//! Per-channel recovery with coalescing.
//!
//! # Responsibilities
//! - Run a channel's recovery when its broker comes back
//! - Keep at most one recovery running per channel
//! - Turn a failed recovery into a probe failure
//!
//! # Design Decisions
//! - A trigger arriving during a run is satisfied by that run, not queued
//! - No retry limit: a failed run sends the channel back to DISCONNECTED,
//!   and the next successful probe triggers again
//! - Closed or detached channels never start a new run

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::ConnectorResult;
use crate::health::monitor::{ConnectionMonitor, ListenerId};
use crate::observability::metrics;

/// Something that can resume work after the broker comes back.
#[async_trait]
pub trait Recoverable: Send + Sync + 'static {
    async fn recover(&self) -> ConnectorResult<()>;
}

/// What a recovery trigger did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryTrigger {
    Started,
    /// A run for this channel was already in progress.
    Coalesced,
    /// Unknown, detached or closed channel.
    Skipped,
}

struct Entry {
    target: Arc<dyn Recoverable>,
    monitor: Arc<ConnectionMonitor>,
    listener: ListenerId,
    in_progress: Arc<AtomicBool>,
    runs: Arc<AtomicU64>,
}

/// Clears the in-progress flag however the run ends.
struct RunGuard(Arc<AtomicBool>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CoordinatorInner {
    entries: DashMap<String, Entry>,
}

impl CoordinatorInner {
    fn on_connected(&self, channel: &str) -> RecoveryTrigger {
        let Some(entry) = self.entries.get(channel) else {
            return RecoveryTrigger::Skipped;
        };
        if entry.monitor.is_closed() {
            return RecoveryTrigger::Skipped;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(channel, "Recovery trigger outside a runtime ignored");
            return RecoveryTrigger::Skipped;
        };
        if entry
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(channel, "Recovery already running; trigger coalesced");
            metrics::record_recovery(channel, "coalesced");
            return RecoveryTrigger::Coalesced;
        }

        let run = RunGuard(Arc::clone(&entry.in_progress));
        let target = Arc::clone(&entry.target);
        let monitor = Arc::clone(&entry.monitor);
        entry.runs.fetch_add(1, Ordering::SeqCst);
        drop(entry);

        let channel = channel.to_string();
        runtime.spawn(async move {
            let _run = run;
            tracing::info!(channel = %channel, "Recovery started");
            match target.recover().await {
                Ok(()) => {
                    tracing::info!(channel = %channel, "Recovery finished");
                    metrics::record_recovery(&channel, "succeeded");
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "Recovery failed");
                    metrics::record_recovery(&channel, "failed");
                    monitor.report_failure(format!("recovery failed: {}", e));
                }
            }
        });
        RecoveryTrigger::Started
    }
}

/// Drives recovery for every attached channel. Cheap to clone.
#[derive(Clone, Default)]
pub struct RecoveryCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl RecoveryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Recover `target` whenever `monitor` reconnects.
    pub fn attach(&self, monitor: Arc<ConnectionMonitor>, target: Arc<dyn Recoverable>) {
        let channel = monitor.channel().to_string();
        let weak: Weak<CoordinatorInner> = Arc::downgrade(&self.inner);
        let listener = monitor.on_transition(move |transition| {
            if !transition.is_reconnect() {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                inner.on_connected(&transition.channel);
            }
        });

        let previous = self.inner.entries.insert(
            channel,
            Entry {
                target,
                monitor,
                listener,
                in_progress: Arc::new(AtomicBool::new(false)),
                runs: Arc::new(AtomicU64::new(0)),
            },
        );
        if let Some(previous) = previous {
            previous.monitor.remove_listener(previous.listener);
        }
    }

    /// Stop recovering `channel`. A run already in progress finishes on its own.
    pub fn detach(&self, channel: &str) {
        if let Some((_, entry)) = self.inner.entries.remove(channel) {
            entry.monitor.remove_listener(entry.listener);
        }
    }

    /// Trigger recovery for `channel`.
    pub fn on_connected(&self, channel: &str) -> RecoveryTrigger {
        self.inner.on_connected(channel)
    }

    /// Number of recovery runs started for `channel`.
    pub fn runs(&self, channel: &str) -> u64 {
        self.inner
            .entries
            .get(channel)
            .map_or(0, |entry| entry.runs.load(Ordering::SeqCst))
    }

    pub fn is_recovering(&self, channel: &str) -> bool {
        self.inner
            .entries
            .get(channel)
            .is_some_and(|entry| entry.in_progress.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::error::ConnectorError;
    use crate::health::state::ConnectionState;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct Blocking {
        release: Notify,
        calls: AtomicU64,
    }

    #[async_trait]
    impl Recoverable for Blocking {
        async fn recover(&self) -> ConnectorResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Recoverable for Failing {
        async fn recover(&self) -> ConnectorResult<()> {
            Err(ConnectorError::Connectivity("resubscribe refused".into()))
        }
    }

    fn monitor() -> Arc<ConnectionMonitor> {
        ConnectionMonitor::new("c", "t", Arc::new(InMemoryBroker::new()))
    }

    #[tokio::test]
    async fn concurrent_triggers_run_once() {
        let coordinator = RecoveryCoordinator::new();
        let target = Arc::new(Blocking {
            release: Notify::new(),
            calls: AtomicU64::new(0),
        });
        coordinator.attach(monitor(), target.clone());

        assert_eq!(coordinator.on_connected("c"), RecoveryTrigger::Started);
        assert_eq!(coordinator.on_connected("c"), RecoveryTrigger::Coalesced);
        tokio::task::yield_now().await;
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.runs("c"), 1);

        target.release.notify_one();
        while coordinator.is_recovering("c") {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.on_connected("c"), RecoveryTrigger::Started);
        assert_eq!(coordinator.runs("c"), 2);
        target.release.notify_one();
    }

    #[tokio::test]
    async fn failed_recovery_disconnects_channel() {
        let coordinator = RecoveryCoordinator::new();
        let m = monitor();
        coordinator.attach(m.clone(), Arc::new(Failing));
        let mut events = m.subscribe();

        coordinator.on_connected("c");
        let transition = events.recv().await.unwrap();
        assert_eq!(transition.to, ConnectionState::Disconnected);
        assert!(transition.reason.unwrap().starts_with("recovery failed"));
    }

    #[tokio::test]
    async fn closed_or_detached_channels_are_skipped() {
        let coordinator = RecoveryCoordinator::new();
        assert_eq!(coordinator.on_connected("missing"), RecoveryTrigger::Skipped);

        let m = monitor();
        coordinator.attach(m.clone(), Arc::new(Failing));
        m.close();
        assert_eq!(coordinator.on_connected("c"), RecoveryTrigger::Skipped);

        let other = ConnectionMonitor::new("d", "t", Arc::new(InMemoryBroker::new()));
        coordinator.attach(other, Arc::new(Failing));
        coordinator.detach("d");
        assert_eq!(coordinator.on_connected("d"), RecoveryTrigger::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_transition_triggers_recovery() {
        let broker = InMemoryBroker::new();
        let coordinator = RecoveryCoordinator::new();
        let m = ConnectionMonitor::new("c", "t", Arc::new(broker.clone()));
        let target = Arc::new(Blocking {
            release: Notify::new(),
            calls: AtomicU64::new(0),
        });
        coordinator.attach(m.clone(), target.clone());

        m.start(crate::health::ProbeSettings::new(
            Duration::from_millis(100),
            Duration::from_millis(50),
            false,
        ))
        .unwrap();
        m.wait_for(ConnectionState::Connected).await;
        assert_eq!(coordinator.runs("c"), 0, "first connect is not a recovery");

        broker.set_reachable(false);
        m.wait_for(ConnectionState::Disconnected).await;
        broker.set_reachable(true);
        m.wait_for(ConnectionState::Connected).await;
        assert_eq!(coordinator.runs("c"), 1);

        target.release.notify_one();
        m.close();
    }
}
