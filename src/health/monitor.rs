//! Active connectivity monitoring.
//!
//! # Responsibilities
//! - Periodically probe the broker (and optionally the topic) for one channel
//! - Own the channel's ConnectionState; every write goes through `publish`
//! - Notify listeners and subscribers of every status change, in order
//!
//! # Design Decisions
//! - Probe failures are never fatal; the loop retries on the same interval
//!   until `close()`, with no retry limit and no separate backoff
//! - Readers load an `ArcSwap` and never block; writers are serialized by a
//!   single mutex so transitions are applied in completion order
//! - Listeners run while the publication is serialized. They must not call
//!   back into `report_failure`/`close` on the same monitor

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::broker::BrokerClient;
use crate::config::ChannelConfig;
use crate::error::{ConnectorError, ConnectorResult};
use crate::health::state::{ChannelStatus, ConnectionState, Probe, ProbeOutcome, Transition};
use crate::observability::metrics;

/// Callback invoked on every published status change.
pub type TransitionListener = Arc<dyn Fn(&Transition) + Send + Sync>;

/// Handle returned by [`ConnectionMonitor::on_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Probe cadence and verification settings.
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub verify_topic: bool,
    pub verification_timeout: Duration,
}

impl ProbeSettings {
    pub fn new(interval: Duration, timeout: Duration, verify_topic: bool) -> Self {
        Self {
            interval,
            timeout,
            verify_topic,
            verification_timeout: timeout,
        }
    }

    pub fn from_channel(config: &ChannelConfig) -> Self {
        Self {
            interval: Duration::from_millis(config.probe.interval_ms),
            timeout: Duration::from_millis(config.probe.timeout_ms),
            verify_topic: config.health_topic_verification_enabled,
            verification_timeout: config.verification_timeout(),
        }
    }
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, TransitionListener)>,
}

/// Connection monitor for a single channel.
pub struct ConnectionMonitor {
    channel: String,
    topic: String,
    client: Arc<dyn BrokerClient>,
    status: ArcSwap<ChannelStatus>,
    publish_lock: Mutex<()>,
    listeners: RwLock<Listeners>,
    events: broadcast::Sender<Transition>,
    closed: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionMonitor")
            .field("channel", &self.channel)
            .field("topic", &self.topic)
            .field("state", &self.current_state())
            .finish()
    }
}

impl ConnectionMonitor {
    pub fn new(
        channel: impl Into<String>,
        topic: impl Into<String>,
        client: Arc<dyn BrokerClient>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            channel: channel.into(),
            topic: topic.into(),
            client,
            status: ArcSwap::from_pointee(ChannelStatus::initial()),
            publish_lock: Mutex::new(()),
            listeners: RwLock::new(Listeners::default()),
            events,
            closed,
            task: Mutex::new(None),
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn current_state(&self) -> ConnectionState {
        self.status.load().state
    }

    /// The latest published status. Never blocks.
    pub fn status(&self) -> Arc<ChannelStatus> {
        self.status.load_full()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Receiver that flips to `true` when the channel closes.
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Subscribe to status changes published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    /// Register a callback run, in order, for every status change.
    pub fn on_transition<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Transition) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners.next_id += 1;
        let id = ListenerId(listeners.next_id);
        listeners.entries.push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().entries.retain(|(existing, _)| *existing != id);
    }

    /// Start the probe loop.
    pub fn start(self: &Arc<Self>, settings: ProbeSettings) -> ConnectorResult<()> {
        if self.is_closed() {
            return Err(ConnectorError::Closed(self.channel.clone()));
        }
        let mut task = self.task.lock();
        if task.is_some() {
            return Err(ConnectorError::AlreadyStarted(self.channel.clone()));
        }

        // A failure reported before the loop started already moved the
        // channel past INIT; CONNECTING only ever follows INIT.
        self.publish(|current| {
            if current.state != ConnectionState::Init {
                return None;
            }
            Some(ChannelStatus {
                state: ConnectionState::Connecting,
                reason: None,
                last_probe: current.last_probe.clone(),
                since: Instant::now(),
            })
        });

        tracing::info!(
            channel = %self.channel,
            interval_ms = settings.interval.as_millis() as u64,
            timeout_ms = settings.timeout.as_millis() as u64,
            verify_topic = settings.verify_topic,
            "Connection monitor starting"
        );

        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move { monitor.run(settings).await }));
        Ok(())
    }

    async fn run(self: Arc<Self>, settings: ProbeSettings) {
        let mut closed = self.closed.subscribe();
        let mut ticker = time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *closed.borrow() {
                break;
            }
            tokio::select! {
                _ = closed.changed() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                _ = closed.changed() => break,
                _ = self.probe_once(&settings) => {}
            }
        }

        tracing::debug!(channel = %self.channel, "Connection monitor loop exited");
    }

    /// Run one probe and apply its verdict.
    pub async fn probe_once(&self, settings: &ProbeSettings) -> Probe {
        let started = Instant::now();
        let outcome = match time::timeout(settings.timeout, self.client.probe()).await {
            Ok(Ok(())) if settings.verify_topic => self.verify_topic(settings).await,
            Ok(Ok(())) => ProbeOutcome::Reachable,
            Ok(Err(e)) => ProbeOutcome::Failed(e.to_string()),
            Err(_) => ProbeOutcome::Failed(format!(
                "probe timed out after {}ms",
                settings.timeout.as_millis()
            )),
        };
        metrics::record_probe(&self.channel, outcome.label(), started.elapsed());

        if let ProbeOutcome::Failed(reason) = &outcome {
            tracing::debug!(channel = %self.channel, reason = %reason, "Probe failed");
        }

        let probe = Probe {
            at: started,
            outcome,
        };
        let (state, reason) = probe.verdict();
        let recorded = probe.clone();
        self.publish(move |current| {
            Some(ChannelStatus {
                state,
                reason,
                last_probe: Some(recorded),
                since: if current.state == state {
                    current.since
                } else {
                    Instant::now()
                },
            })
        });
        probe
    }

    async fn verify_topic(&self, settings: &ProbeSettings) -> ProbeOutcome {
        match time::timeout(
            settings.verification_timeout,
            self.client.topic_exists(&self.topic),
        )
        .await
        {
            Ok(Ok(true)) => ProbeOutcome::Reachable,
            Ok(Ok(false)) => ProbeOutcome::TopicMissing,
            Ok(Err(e)) => ProbeOutcome::Failed(format!("topic verification failed: {}", e)),
            Err(_) => ProbeOutcome::Failed(format!(
                "topic verification timed out after {}ms",
                settings.verification_timeout.as_millis()
            )),
        }
    }

    /// Record a failure observed outside the probe loop (send, fetch, recovery).
    pub fn report_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.publish(move |current| {
            Some(ChannelStatus {
                state: ConnectionState::Disconnected,
                reason: Some(reason),
                last_probe: current.last_probe.clone(),
                since: if current.state == ConnectionState::Disconnected {
                    current.since
                } else {
                    Instant::now()
                },
            })
        });
    }

    /// Transition to CLOSED and stop probing. Idempotent.
    pub fn close(&self) {
        self.close_with_reason("closed");
    }

    /// Like [`close`](Self::close), recording why the channel ended.
    pub fn close_with_reason(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let transition = self.publish(move |current| {
            Some(ChannelStatus {
                state: ConnectionState::Closed,
                reason: Some(reason),
                last_probe: current.last_probe.clone(),
                since: Instant::now(),
            })
        });
        self.closed.send_replace(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if transition.is_some() {
            tracing::info!(channel = %self.channel, "Connection monitor closed");
        }
    }

    /// Wait until the channel reaches `target`, or closes.
    pub async fn wait_for(&self, target: ConnectionState) -> ConnectionState {
        let mut events = self.subscribe();
        loop {
            let current = self.current_state();
            if current == target || current.is_terminal() {
                return current;
            }
            match events.recv().await {
                Ok(t) if t.to == target || t.to.is_terminal() => return t.to,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.current_state(),
            }
        }
    }

    /// Serialize a status write and fan the change out.
    ///
    /// A CLOSED channel never changes again.
    fn publish(
        &self,
        next: impl FnOnce(&ChannelStatus) -> Option<ChannelStatus>,
    ) -> Option<Transition> {
        let _guard = self.publish_lock.lock();
        let current = self.status.load_full();
        if current.state.is_terminal() {
            return None;
        }
        let next = next(&current)?;
        let changed = next.state != current.state || next.reason != current.reason;
        let transition = Transition {
            channel: self.channel.clone(),
            from: current.state,
            to: next.state,
            reason: next.reason.clone(),
        };
        self.status.store(Arc::new(next));
        if !changed {
            return None;
        }

        if transition.is_state_change() {
            tracing::info!(
                channel = %self.channel,
                from = %transition.from,
                to = %transition.to,
                reason = transition.reason.as_deref().unwrap_or(""),
                "Channel state changed"
            );
            metrics::record_channel_state(&self.channel, transition.to);
        } else {
            tracing::debug!(
                channel = %self.channel,
                state = %transition.to,
                reason = transition.reason.as_deref().unwrap_or(""),
                "Channel status reason changed"
            );
        }

        let listeners: Vec<TransitionListener> = self
            .listeners
            .read()
            .entries
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&transition);
        }
        let _ = self.events.send(transition.clone());
        Some(transition)
    }
}
