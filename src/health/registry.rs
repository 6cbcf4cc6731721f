//! Aggregated readiness and liveness.
//!
//! # Responsibilities
//! - Track every registered channel's monitor
//! - Publish a fresh immutable `HealthSnapshot` on every status change
//! - Record fatal errors, the only thing that clears liveness
//!
//! # Design Decisions
//! - Readiness is the AND of `state == CONNECTED` over channels counted for
//!   readiness; zero channels is ready unless `empty_is_ready` is off
//! - Liveness never looks at broker reachability. An unreachable broker is an
//!   external condition, not a process failure
//! - `snapshot()` is a single atomic load; rebuilding happens on the writer side

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;

use crate::health::monitor::{ConnectionMonitor, ListenerId};
use crate::health::state::ConnectionState;
use crate::observability::metrics;

/// Up/down verdict of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

/// One channel's entry in the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub state: ConnectionState,
    pub reason: String,
    /// Whether this check takes part in the readiness verdict.
    pub readiness: bool,
}

/// A recorded unrecoverable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatalRecord {
    pub channel: String,
    pub reason: String,
}

/// Immutable health view. Old snapshots stay valid and can be shared freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub ready: bool,
    pub alive: bool,
    pub checks: Vec<HealthCheck>,
    pub fatal: Vec<FatalRecord>,
}

impl HealthSnapshot {
    pub fn check(&self, name: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.name == name)
    }
}

/// How a channel takes part in health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOptions {
    pub readiness: bool,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self { readiness: true }
    }
}

struct Registration {
    monitor: Arc<ConnectionMonitor>,
    listener: ListenerId,
    options: HealthOptions,
}

#[derive(Default)]
struct Entries {
    channels: BTreeMap<String, Registration>,
    fatal: BTreeMap<String, String>,
}

struct RegistryInner {
    empty_is_ready: bool,
    entries: Mutex<Entries>,
    snapshot: ArcSwap<HealthSnapshot>,
}

impl RegistryInner {
    /// Rebuild and publish under the entries lock so publications stay ordered.
    fn refresh(&self) {
        let entries = self.entries.lock();
        let snapshot = self.build(&entries);
        metrics::record_health(snapshot.ready, snapshot.alive);
        self.snapshot.store(Arc::new(snapshot));
    }

    fn build(&self, entries: &Entries) -> HealthSnapshot {
        let checks: Vec<HealthCheck> = entries
            .channels
            .iter()
            .map(|(name, registration)| {
                let status = registration.monitor.status();
                HealthCheck {
                    name: name.clone(),
                    status: if status.state.is_ready() {
                        CheckStatus::Up
                    } else {
                        CheckStatus::Down
                    },
                    state: status.state,
                    reason: status.describe(),
                    readiness: registration.options.readiness,
                }
            })
            .collect();

        let counted: Vec<&HealthCheck> = checks.iter().filter(|c| c.readiness).collect();
        let ready = if counted.is_empty() {
            self.empty_is_ready
        } else {
            counted.iter().all(|c| c.status == CheckStatus::Up)
        };

        let fatal: Vec<FatalRecord> = entries
            .fatal
            .iter()
            .map(|(channel, reason)| FatalRecord {
                channel: channel.clone(),
                reason: reason.clone(),
            })
            .collect();

        HealthSnapshot {
            ready,
            alive: fatal.is_empty(),
            checks,
            fatal,
        }
    }
}

/// Registry of channel health. Cheap to clone.
#[derive(Clone)]
pub struct HealthRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(true)
    }
}

impl HealthRegistry {
    pub fn new(empty_is_ready: bool) -> Self {
        let inner = Arc::new(RegistryInner {
            empty_is_ready,
            entries: Mutex::new(Entries::default()),
            snapshot: ArcSwap::from_pointee(HealthSnapshot {
                ready: empty_is_ready,
                alive: true,
                checks: Vec::new(),
                fatal: Vec::new(),
            }),
        });
        Self { inner }
    }

    /// Register (or replace) a channel.
    pub fn register(&self, name: &str, monitor: Arc<ConnectionMonitor>, options: HealthOptions) {
        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let listener = monitor.on_transition(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.refresh();
            }
        });

        let previous = self.inner.entries.lock().channels.insert(
            name.to_string(),
            Registration {
                monitor,
                listener,
                options,
            },
        );
        if let Some(previous) = previous {
            previous.monitor.remove_listener(previous.listener);
        }
        tracing::debug!(channel = name, readiness = options.readiness, "Channel registered for health");
        self.inner.refresh();
    }

    pub fn deregister(&self, name: &str) {
        let removed = self.inner.entries.lock().channels.remove(name);
        if let Some(registration) = removed {
            registration.monitor.remove_listener(registration.listener);
            tracing::debug!(channel = name, "Channel deregistered from health");
            self.inner.refresh();
        }
    }

    /// Record an unrecoverable error, halt the channel, and clear liveness.
    pub fn report_fatal(&self, channel: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::error!(
            channel,
            reason = %reason,
            "Fatal connector error; channel halted, external remediation required"
        );
        let monitor = {
            let mut entries = self.inner.entries.lock();
            entries.fatal.insert(channel.to_string(), reason.clone());
            entries
                .channels
                .get(channel)
                .map(|registration| Arc::clone(&registration.monitor))
        };
        if let Some(monitor) = monitor {
            monitor.close_with_reason(format!("fatal: {}", reason));
        }
        self.inner.refresh();
    }

    /// The current snapshot. A single atomic load; never blocks.
    pub fn snapshot(&self) -> Arc<HealthSnapshot> {
        self.inner.snapshot.load_full()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.snapshot.load().ready
    }

    pub fn is_alive(&self) -> bool {
        self.inner.snapshot.load().alive
    }

    pub fn channel_state(&self, name: &str) -> Option<ConnectionState> {
        self.inner
            .snapshot
            .load()
            .check(name)
            .map(|check| check.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::health::monitor::ProbeSettings;
    use std::time::Duration;

    fn monitor(name: &str) -> Arc<ConnectionMonitor> {
        ConnectionMonitor::new(name, name, Arc::new(InMemoryBroker::new()))
    }

    #[test]
    fn empty_registry_follows_policy() {
        assert!(HealthRegistry::new(true).snapshot().ready);
        assert!(!HealthRegistry::new(false).snapshot().ready);
        assert!(HealthRegistry::new(false).snapshot().alive);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_only_when_every_channel_connected() {
        let registry = HealthRegistry::default();
        let a = monitor("a");
        let b = monitor("b");
        registry.register("a", a.clone(), HealthOptions::default());
        registry.register("b", b.clone(), HealthOptions::default());
        assert!(!registry.is_ready());

        let settings =
            ProbeSettings::new(Duration::from_millis(100), Duration::from_millis(50), false);
        a.start(settings.clone()).unwrap();
        a.wait_for(ConnectionState::Connected).await;
        assert!(!registry.is_ready(), "b is still INIT");

        b.start(settings).unwrap();
        b.wait_for(ConnectionState::Connected).await;
        assert!(registry.is_ready());

        b.report_failure("send failed");
        let snapshot = registry.snapshot();
        assert!(!snapshot.ready);
        assert!(snapshot.alive, "connectivity never clears liveness");
        let check = snapshot.check("b").unwrap();
        assert_eq!(check.status, CheckStatus::Down);
        assert_eq!(check.reason, "send failed");

        a.close();
        b.close();
    }

    #[test]
    fn readiness_disabled_channel_is_reported_but_not_counted() {
        let registry = HealthRegistry::default();
        let quiet = monitor("quiet");
        registry.register("quiet", quiet.clone(), HealthOptions { readiness: false });
        quiet.report_failure("down");

        let snapshot = registry.snapshot();
        assert!(snapshot.ready);
        assert_eq!(snapshot.check("quiet").unwrap().status, CheckStatus::Down);
    }

    #[test]
    fn fatal_error_clears_liveness_and_closes_channel() {
        let registry = HealthRegistry::default();
        let broken = monitor("broken");
        registry.register("broken", broken.clone(), HealthOptions::default());

        registry.report_fatal("broken", "corrupted offsets");
        let snapshot = registry.snapshot();
        assert!(!snapshot.alive);
        assert_eq!(snapshot.fatal[0].reason, "corrupted offsets");
        assert_eq!(broken.current_state(), ConnectionState::Closed);
    }

    #[test]
    fn snapshots_are_immutable() {
        let registry = HealthRegistry::default();
        let m = monitor("m");
        registry.register("m", m.clone(), HealthOptions::default());
        let before = registry.snapshot();
        m.report_failure("gone");
        let after = registry.snapshot();
        assert_eq!(before.check("m").unwrap().state, ConnectionState::Init);
        assert_eq!(after.check("m").unwrap().state, ConnectionState::Disconnected);
    }

    #[test]
    fn deregistered_channel_stops_affecting_readiness() {
        let registry = HealthRegistry::default();
        let m = monitor("m");
        registry.register("m", m.clone(), HealthOptions::default());
        assert!(!registry.is_ready());
        registry.deregister("m");
        assert!(registry.is_ready());
        m.report_failure("ignored");
        assert!(registry.snapshot().checks.is_empty());
    }
}
