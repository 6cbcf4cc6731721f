//! Shared utilities for integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, Stream};

use resilient_connector::broker::{InMemoryBroker, Record};
use resilient_connector::config::{ChannelConfig, ConnectorConfig, Direction};
use resilient_connector::stream::StreamFailure;
use resilient_connector::Connector;

/// Channel config with a fast probe loop, so paused-clock tests stay short.
pub fn channel(name: &str, direction: Direction, topic: &str) -> ChannelConfig {
    let mut config = ChannelConfig::new(name, direction);
    config.topic = Some(topic.to_string());
    config.probe.interval_ms = 100;
    config.probe.timeout_ms = 50;
    config.health_topic_verification_timeout_ms = 50;
    config
}

pub fn connector(broker: &InMemoryBroker, channels: Vec<ChannelConfig>) -> Connector {
    let config = ConnectorConfig {
        channels,
        ..Default::default()
    };
    Connector::new(config, Arc::new(broker.clone())).unwrap()
}

/// A finite stream of big-endian integers.
#[allow(dead_code)]
pub fn ints(values: Vec<i32>) -> impl Stream<Item = Result<Record, StreamFailure>> + Send + 'static {
    stream::iter(values.into_iter().map(|v| Ok(Record::from_i32(v))))
}

/// Decode every record in `topic` as an integer.
#[allow(dead_code)]
pub fn topic_ints(broker: &InMemoryBroker, topic: &str) -> Vec<i32> {
    broker
        .records(topic)
        .iter()
        .filter_map(|r| {
            let bytes: [u8; 4] = r.value.as_slice().try_into().ok()?;
            Some(i32::from_be_bytes(bytes))
        })
        .collect()
}

/// Poll `condition` every 10ms of (paused) time until it holds or `limit` elapses.
#[allow(dead_code)]
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
