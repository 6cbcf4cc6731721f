//! Connector channels.
//!
//! # Data Flow
//! ```text
//! ConnectorConfig + Arc<dyn BrokerClient>
//!     → Connector::new
//!     → sink(name, stream) / source(name)
//!         → ConnectionMonitor (registered with HealthRegistry)
//!         → RecoveryCoordinator::attach
//!         → supervised channel tasks
//! ```
//!
//! # Design Decisions
//! - Channels are built explicitly from configuration values; nothing is
//!   looked up from a container
//! - A panicking channel task is a fatal error for that channel
//! - Closing the connector closes every channel; closed channels never recover

pub mod sink;
pub mod source;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::stream::Stream;
use tokio::sync::{mpsc, watch};

use crate::broker::{BrokerClient, Record};
use crate::config::validation::validate_config;
use crate::config::{ChannelConfig, ConnectorConfig, Direction};
use crate::error::{ConnectorError, ConnectorResult};
use crate::health::{
    ConnectionMonitor, HealthOptions, HealthRegistry, HealthSnapshot, ProbeSettings,
};
use crate::recovery::RecoveryCoordinator;
use crate::stream::StreamFailure;

pub use sink::{Delivery, Rejection, SinkHandle, SinkStats};
pub use source::SourceHandle;

use sink::SinkShared;
use source::SourceShared;

/// Resolve once the channel's closed flag is set.
pub(crate) async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

enum Channel {
    Sink(Arc<SinkShared>),
    Source(Arc<SourceShared>),
}

impl Channel {
    fn close(&self) {
        match self {
            Channel::Sink(sink) => sink.close(),
            Channel::Source(source) => source.close(),
        }
    }

    fn monitor(&self) -> &Arc<ConnectionMonitor> {
        match self {
            Channel::Sink(sink) => sink.monitor(),
            Channel::Source(source) => source.monitor(),
        }
    }
}

/// A set of incoming and outgoing channels sharing one broker client.
pub struct Connector {
    config: ConnectorConfig,
    client: Arc<dyn BrokerClient>,
    registry: HealthRegistry,
    recovery: RecoveryCoordinator,
    channels: DashMap<String, Channel>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, client: Arc<dyn BrokerClient>) -> ConnectorResult<Self> {
        if let Err(errors) = validate_config(&config) {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ConnectorError::Config(joined));
        }
        let registry = HealthRegistry::new(config.health.empty_is_ready);
        Ok(Self {
            config,
            client,
            registry,
            recovery: RecoveryCoordinator::new(),
            channels: DashMap::new(),
        })
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn recovery(&self) -> &RecoveryCoordinator {
        &self.recovery
    }

    /// The current health snapshot. Never blocks.
    pub fn health(&self) -> Arc<HealthSnapshot> {
        self.registry.snapshot()
    }

    /// Start the outgoing channel `name`, feeding it from `stream`.
    pub fn sink<S>(&self, name: &str, stream: S) -> ConnectorResult<SinkHandle>
    where
        S: Stream<Item = Result<Record, StreamFailure>> + Send + 'static,
    {
        let (config, monitor) = self.prepare(name, Direction::Outgoing)?;
        let (shared, queue) = SinkShared::new(
            &config,
            Arc::clone(&self.client),
            Arc::clone(&monitor),
            self.registry.clone(),
        );
        monitor.start(ProbeSettings::from_channel(&config))?;
        self.recovery.attach(Arc::clone(&monitor), shared.clone());
        self.channels
            .insert(name.to_string(), Channel::Sink(shared.clone()));

        self.supervise(name, &monitor, "dispatcher", shared.clone().dispatch(queue));
        self.supervise(name, &monitor, "stream", shared.clone().pump(stream));

        tracing::info!(
            channel = name,
            topic = config.topic(),
            max_inflight = config.max_inflight_messages,
            "Outgoing channel started"
        );
        Ok(SinkHandle::new(shared))
    }

    /// Start the incoming channel `name`.
    pub fn source(&self, name: &str) -> ConnectorResult<SourceHandle> {
        let (config, monitor) = self.prepare(name, Direction::Incoming)?;
        let shared = SourceShared::new(
            &config,
            Arc::clone(&self.client),
            Arc::clone(&monitor),
            self.registry.clone(),
        );
        let (records, receiver) = mpsc::channel(config.max_poll_records.max(1));
        monitor.start(ProbeSettings::from_channel(&config))?;
        self.recovery.attach(Arc::clone(&monitor), shared.clone());
        self.channels
            .insert(name.to_string(), Channel::Source(shared.clone()));

        self.supervise(name, &monitor, "poller", shared.clone().poll(records));

        tracing::info!(
            channel = name,
            topic = config.topic(),
            group_id = config.group_id(),
            "Incoming channel started"
        );
        Ok(SourceHandle::new(shared, receiver))
    }

    /// Close one channel. Returns false if it was not started.
    pub fn close_channel(&self, name: &str) -> bool {
        let Some((_, channel)) = self.channels.remove(name) else {
            return false;
        };
        self.recovery.detach(name);
        channel.close();
        true
    }

    /// Close every channel.
    pub fn close(&self) {
        let names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.close_channel(&name);
        }
        tracing::info!("Connector closed");
    }

    /// Names of channels currently started.
    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn monitor(&self, name: &str) -> Option<Arc<ConnectionMonitor>> {
        self.channels.get(name).map(|c| Arc::clone(c.monitor()))
    }

    fn prepare(
        &self,
        name: &str,
        direction: Direction,
    ) -> ConnectorResult<(ChannelConfig, Arc<ConnectionMonitor>)> {
        let config = self
            .config
            .channel(name)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownChannel(name.to_string()))?;
        if config.direction != direction {
            return Err(ConnectorError::DirectionMismatch {
                channel: name.to_string(),
                configured: config.direction.as_str(),
                requested: direction.as_str(),
            });
        }
        if self.channels.contains_key(name) {
            return Err(ConnectorError::AlreadyStarted(name.to_string()));
        }

        let monitor = ConnectionMonitor::new(name, config.topic(), Arc::clone(&self.client));
        if config.health_enabled {
            self.registry.register(
                name,
                Arc::clone(&monitor),
                HealthOptions {
                    readiness: config.health_readiness_enabled,
                },
            );
        }
        Ok((config, monitor))
    }

    /// Spawn a channel task; a panic becomes a fatal error for the channel.
    fn supervise<F>(
        &self,
        channel: &str,
        monitor: &Arc<ConnectionMonitor>,
        task: &'static str,
        future: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let registry = self.registry.clone();
        let monitor = Arc::clone(monitor);
        let channel = channel.to_string();
        tokio::spawn(async move {
            match handle.await {
                Err(e) if e.is_panic() => {
                    let reason = format!("{} task panicked", task);
                    registry.report_fatal(&channel, reason.clone());
                    monitor.close_with_reason(format!("fatal: {}", reason));
                }
                _ => {}
            }
        });
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        for channel in self.channels.iter() {
            channel.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::health::ConnectionState;
    use futures_util::stream;
    use std::time::Duration;

    type Item = Result<Record, StreamFailure>;

    fn config() -> ConnectorConfig {
        let mut out = ChannelConfig::new("out", Direction::Outgoing);
        out.probe.interval_ms = 100;
        out.probe.timeout_ms = 50;
        let mut inc = ChannelConfig::new("in", Direction::Incoming);
        inc.topic = Some("out".into());
        inc.auto_offset_reset = crate::config::OffsetReset::Earliest;
        inc.probe.interval_ms = 100;
        inc.probe.timeout_ms = 50;
        ConnectorConfig {
            channels: vec![out, inc],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn channel_lookup_errors() {
        let connector = Connector::new(config(), Arc::new(InMemoryBroker::new())).unwrap();
        assert!(matches!(
            connector.source("nope"),
            Err(ConnectorError::UnknownChannel(_))
        ));
        assert!(matches!(
            connector.source("out"),
            Err(ConnectorError::DirectionMismatch { .. })
        ));
        let _sink = connector.sink("out", stream::empty::<Item>()).unwrap();
        assert!(matches!(
            connector.sink("out", stream::empty::<Item>()),
            Err(ConnectorError::AlreadyStarted(_))
        ));
        connector.close();
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = config();
        config.channels.push(ChannelConfig::new("out", Direction::Outgoing));
        assert!(matches!(
            Connector::new(config, Arc::new(InMemoryBroker::new())),
            Err(ConnectorError::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn records_flow_from_sink_to_source() {
        let broker = InMemoryBroker::new();
        let connector = Connector::new(config(), Arc::new(broker.clone())).unwrap();
        let records = (0..4).map(|i| Ok::<_, StreamFailure>(Record::from_i32(i)));
        let sink = connector.sink("out", stream::iter(records)).unwrap();
        let mut source = connector.source("in").unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let record = source.recv().await.unwrap();
            seen.push(record.value_i32().unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(sink.stats().acknowledged, 4);

        sink.monitor().wait_for(ConnectionState::Connected).await;
        source.monitor().wait_for(ConnectionState::Connected).await;
        assert!(connector.health().ready);
        connector.close();
        assert!(!connector.health().ready);
        assert!(connector.health().alive);
    }

    #[tokio::test(start_paused = true)]
    async fn health_disabled_channel_is_not_registered() {
        let mut config = config();
        config.channels[0].health_enabled = false;
        let connector = Connector::new(config, Arc::new(InMemoryBroker::new())).unwrap();
        let _sink = connector.sink("out", stream::pending::<Item>()).unwrap();
        assert!(connector.health().check("out").is_none());
        assert!(connector.health().ready);
        connector.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn channel_starts_from_connecting() {
        let broker = InMemoryBroker::unreachable(crate::broker::UnreachableMode::Refuse);
        let connector = Connector::new(config(), Arc::new(broker)).unwrap();
        let records = (0..4).map(|i| Ok::<_, StreamFailure>(Record::from_i32(i)));
        let sink = connector.sink("out", stream::iter(records)).unwrap();
        let mut events = sink.monitor().subscribe();
        assert_ne!(sink.monitor().current_state(), ConnectionState::Init);

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.to, ConnectionState::Connecting);
        assert_ne!(first.from, ConnectionState::Init);
        connector.close();
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_stream_is_fatal() {
        let connector = Connector::new(config(), Arc::new(InMemoryBroker::new())).unwrap();
        let exploding = stream::poll_fn(|_| -> std::task::Poll<Option<Item>> {
            panic!("application stream bug")
        });
        let sink = connector.sink("out", exploding).unwrap();
        sink.monitor().wait_for(ConnectionState::Closed).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let health = connector.health();
        assert!(!health.alive);
        assert_eq!(health.fatal[0].channel, "out");
    }
}
