//! Failure injection tests for the connector.
//!
//! Every test runs on a paused clock: timers fire as soon as all tasks are
//! idle, so outages of minutes take no wall time.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};

use resilient_connector::backpressure::SendOutcome;
use resilient_connector::broker::{
    BrokerClient, BrokerError, BrokerResult, ConsumerRecord, InMemoryBroker, Record,
    RecordMetadata, UnreachableMode,
};
use resilient_connector::config::{ConnectorConfig, Direction, OffsetReset};
use resilient_connector::health::ConnectionState;
use resilient_connector::stream::emitter;
use resilient_connector::{Connector, ConnectorError};

mod common;

#[tokio::test(start_paused = true)]
async fn test_sink_without_broker_delivers_queued_records_after_reconnect() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Refuse);
    let connector = common::connector(
        &broker,
        vec![common::channel("out", Direction::Outgoing, "readings")],
    );
    let (emitter, stream) = emitter(16);
    let sink = connector.sink("out", stream).unwrap();
    let mut deliveries = sink.deliveries();

    sink.monitor().wait_for(ConnectionState::Disconnected).await;
    let health = connector.health();
    assert!(!health.ready);
    assert!(health.alive);

    for i in 1..=3 {
        emitter.emit(Record::from_i32(i)).await.unwrap();
    }
    assert!(common::wait_until(Duration::from_secs(1), || sink.stats().accepted == 3).await);

    // Queued, not lost, while the outage lasts.
    time::sleep(Duration::from_secs(5)).await;
    assert!(broker.records("readings").is_empty());
    assert!(!connector.health().ready);
    assert!(connector.health().alive);

    broker.set_reachable(true);
    sink.monitor().wait_for(ConnectionState::Connected).await;

    let mut acknowledged = Vec::new();
    while acknowledged.len() < 3 {
        let delivery = deliveries.recv().await.unwrap();
        assert!(delivery.result.is_ok(), "unexpected failure: {:?}", delivery.result);
        acknowledged.push(delivery.seq);
    }
    assert_eq!(acknowledged, vec![0, 1, 2]);
    assert!(connector.health().ready);

    // Exactly once, in emission order.
    time::sleep(Duration::from_secs(2)).await;
    assert_eq!(common::topic_ints(&broker, "readings"), vec![1, 2, 3]);
    assert_eq!(sink.stats().acknowledged, 3);
    assert_eq!(sink.stats().failed, 0);

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_source_with_topic_verification_sees_exactly_five_values() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Refuse);
    let mut config = common::channel("in", Direction::Incoming, "numbers");
    config.health_topic_verification_enabled = true;
    let connector = common::connector(&broker, vec![config]);
    let mut source = connector.source("in").unwrap();

    source.monitor().wait_for(ConnectionState::Disconnected).await;
    assert!(!connector.health().ready);
    assert!(connector.health().alive);

    broker.set_reachable(true);
    source.monitor().wait_for(ConnectionState::Connected).await;
    assert!(connector.health().ready);

    for i in 0..5 {
        broker.produce("numbers", Record::from_i32(i));
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        let record: ConsumerRecord = time::timeout(Duration::from_secs(5), source.recv())
            .await
            .expect("record within deadline")
            .expect("source still running");
        seen.push(record.value_i32().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    time::sleep(Duration::from_secs(2)).await;
    assert!(source.try_recv().is_none(), "duplicate delivery");
    assert_eq!(source.delivered(), 5);
    assert_eq!(source.position(), Some(5));

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_source_without_verification_sees_exactly_five_values() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Refuse);
    let mut config = common::channel("in", Direction::Incoming, "numbers");
    config.auto_offset_reset = OffsetReset::Earliest;
    let connector = common::connector(&broker, vec![config]);
    let mut source = connector.source("in").unwrap();

    source.monitor().wait_for(ConnectionState::Disconnected).await;
    assert!(!connector.health().ready);
    assert!(connector.health().alive);

    broker.set_reachable(true);
    source.monitor().wait_for(ConnectionState::Connected).await;
    for i in 0..5 {
        broker.produce("numbers", Record::from_i32(i));
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        let record = time::timeout(Duration::from_secs(5), source.recv())
            .await
            .expect("record within deadline")
            .expect("source still running");
        seen.push(record.value_i32().unwrap());
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    time::sleep(Duration::from_secs(2)).await;
    assert!(source.try_recv().is_none(), "duplicate delivery");
    assert_eq!(source.delivered(), 5);

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_sink_delivers_every_record_to_healthy_broker() {
    let broker = InMemoryBroker::new();
    let mut config = common::channel("out", Direction::Outgoing, "readings");
    config.max_inflight_messages = 0;
    let connector = common::connector(&broker, vec![config]);

    let sink = connector
        .sink("out", common::ints((0..300).collect()))
        .unwrap();
    sink.finished().await;
    assert!(
        common::wait_until(Duration::from_secs(5), || sink.stats().acknowledged == 300).await
    );

    assert!(sink.failure().is_none());
    assert!(sink.guard().failure().is_none());
    let stats = sink.stats();
    assert_eq!(stats.accepted, 300);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        common::topic_ints(&broker, "readings"),
        (0..300).collect::<Vec<_>>()
    );
    assert_ne!(sink.monitor().current_state(), ConnectionState::Closed);

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_stream_overflow_fails_exactly_once() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Blackhole);
    let mut config = common::channel("out", Direction::Outgoing, "readings");
    config.max_inflight_messages = 0;
    config.overflow_buffer = 8;
    config.max_block_ms = 500;
    let connector = common::connector(&broker, vec![config]);

    let started = Instant::now();
    let sink = connector
        .sink("out", common::ints((0..1000).collect()))
        .unwrap();
    sink.finished().await;
    assert!(started.elapsed() >= Duration::from_millis(500));

    let failure = sink.failure().expect("overflow captured");
    assert!(matches!(failure, ConnectorError::BackpressureOverflow(_)));
    let captured = sink.guard().failure().expect("guard keeps the failure");

    assert_eq!(sink.monitor().current_state(), ConnectionState::Closed);
    let health = connector.health();
    assert!(!health.ready);
    assert!(health.alive, "overflow is not a process failure");
    assert!(health
        .check("out")
        .unwrap()
        .reason
        .contains("backpressure overflow"));

    // The stream has ended; later sends never raise a second overflow.
    for i in 0..5 {
        let outcome = sink.guard().send(Record::from_i32(i)).await;
        assert!(matches!(outcome, SendOutcome::Terminated(_)));
    }
    assert_eq!(sink.guard().failure(), Some(captured));

    // Every admitted record got an explicit per-message failure.
    assert!(
        common::wait_until(Duration::from_secs(1), || {
            let stats = sink.stats();
            stats.failed == stats.accepted
        })
        .await
    );
    assert!(sink.stats().accepted <= 9);
    assert_eq!(sink.guard().in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pushed_records_overrunning_window_overflow_at_once() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Blackhole);
    let mut config = common::channel("out", Direction::Outgoing, "readings");
    config.max_inflight_messages = 0;
    config.overflow_buffer = 4;
    let connector = common::connector(&broker, vec![config]);
    let (_emitter, stream) = emitter(1);
    let sink = connector.sink("out", stream).unwrap();

    let mut accepted = 0;
    let first = loop {
        match sink.send(Record::from_i32(accepted)).await {
            Ok(_) => accepted += 1,
            Err(e) => break e,
        }
        assert!(accepted <= 5, "window never filled");
    };
    assert!(matches!(first, ConnectorError::BackpressureOverflow(_)));
    let captured = sink.failure().expect("overflow captured").to_string();
    assert_eq!(first.to_string(), captured);

    for i in 0..3 {
        let err = sink.send(Record::from_i32(100 + i)).await.unwrap_err();
        assert_eq!(err.to_string(), captured, "no second failure");
    }
    let kept = sink.guard().failure().map(ConnectorError::from);
    assert_eq!(kept.map(|e| e.to_string()), Some(captured));
    assert!(connector.health().alive);
}

#[tokio::test(start_paused = true)]
async fn test_bounded_sink_times_out_sends_without_ending_stream() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Refuse);
    let mut config = common::channel("out", Direction::Outgoing, "readings");
    config.max_inflight_messages = 2;
    config.max_block_ms = 50;
    let connector = common::connector(&broker, vec![config]);

    let started = Instant::now();
    let sink = connector.sink("out", common::ints((0..6).collect())).unwrap();
    let mut rejections = sink.rejections();
    sink.finished().await;
    let elapsed = started.elapsed();

    let stats = sink.stats();
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.timed_out, 4);
    assert!(
        elapsed <= Duration::from_millis(250),
        "sends hung past their deadline: {:?}",
        elapsed
    );
    assert!(sink.failure().is_none(), "timeouts are not terminal");

    // Each timed-out stream record comes back to the application.
    for value in 2..6 {
        let rejection = rejections.try_recv().expect("rejection for timed-out record");
        assert_eq!(rejection.record, Record::from_i32(value));
        assert!(matches!(rejection.error, ConnectorError::SendTimeout(_)));
        assert!(rejection.error.is_recoverable());
    }
    assert!(rejections.try_recv().is_err());

    let err = sink.send(Record::from_i32(99)).await.unwrap_err();
    assert!(matches!(err, ConnectorError::SendTimeout(_)));
    assert!(err.is_recoverable());

    assert_ne!(sink.monitor().current_state(), ConnectionState::Closed);
    let health = connector.health();
    assert!(!health.ready);
    assert!(health.alive);

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_liveness_survives_long_outage() {
    let broker = InMemoryBroker::unreachable(UnreachableMode::Blackhole);
    let connector = common::connector(
        &broker,
        vec![
            common::channel("out", Direction::Outgoing, "t"),
            common::channel("in", Direction::Incoming, "t"),
        ],
    );
    let (_emitter, stream) = emitter(4);
    let sink = connector.sink("out", stream).unwrap();
    let _source = connector.source("in").unwrap();
    sink.monitor().wait_for(ConnectionState::Disconnected).await;

    for _ in 0..20 {
        time::sleep(Duration::from_secs(30)).await;
        let health = connector.health();
        assert!(health.alive);
        assert!(!health.ready);
        assert!(health.fatal.is_empty());
    }
    let check = connector.health().check("out").cloned().unwrap();
    assert_eq!(check.state, ConnectionState::Disconnected);
    assert!(check.reason.contains("timed out"));

    connector.close();
}

#[tokio::test(start_paused = true)]
async fn test_readiness_tracks_every_channel() {
    let broker = InMemoryBroker::new();
    let connector = common::connector(
        &broker,
        vec![
            common::channel("a", Direction::Incoming, "t"),
            common::channel("b", Direction::Incoming, "t"),
        ],
    );
    let a = connector.source("a").unwrap();
    let b = connector.source("b").unwrap();
    a.monitor().wait_for(ConnectionState::Connected).await;
    b.monitor().wait_for(ConnectionState::Connected).await;
    assert!(connector.health().ready);

    for step in 0..40 {
        if step % 10 == 0 {
            broker.set_reachable(step % 20 != 0);
        }
        time::sleep(Duration::from_millis(37)).await;
        let health = connector.health();
        let all_connected = health
            .checks
            .iter()
            .all(|c| c.state == ConnectionState::Connected);
        assert_eq!(health.ready, all_connected);
        assert!(health.alive);
    }

    connector.close();
}

/// Broker whose log is corrupted: every send is fatal.
struct CorruptedBroker(InMemoryBroker);

#[async_trait]
impl BrokerClient for CorruptedBroker {
    async fn probe(&self) -> BrokerResult<()> {
        self.0.probe().await
    }

    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        self.0.topic_exists(topic).await
    }

    async fn send(&self, _topic: &str, _record: &Record) -> BrokerResult<RecordMetadata> {
        Err(BrokerError::Fatal("log segment corrupted".into()))
    }

    async fn fetch(
        &self,
        topic: &str,
        offset: u64,
        max_records: usize,
    ) -> BrokerResult<Vec<ConsumerRecord>> {
        self.0.fetch(topic, offset, max_records).await
    }

    async fn commit(&self, group: &str, topic: &str, offset: u64) -> BrokerResult<()> {
        self.0.commit(group, topic, offset).await
    }

    async fn committed(&self, group: &str, topic: &str) -> BrokerResult<Option<u64>> {
        self.0.committed(group, topic).await
    }

    async fn end_offset(&self, topic: &str) -> BrokerResult<u64> {
        self.0.end_offset(topic).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_broker_error_clears_liveness() {
    let config = ConnectorConfig {
        channels: vec![common::channel("out", Direction::Outgoing, "t")],
        ..Default::default()
    };
    let connector =
        Connector::new(config, Arc::new(CorruptedBroker(InMemoryBroker::new()))).unwrap();
    let sink = connector.sink("out", common::ints(vec![1])).unwrap();
    let mut deliveries = sink.deliveries();

    sink.monitor().wait_for(ConnectionState::Closed).await;
    let health = connector.health();
    assert!(!health.alive);
    assert!(!health.ready);
    assert_eq!(health.fatal[0].channel, "out");
    assert_eq!(health.fatal[0].reason, "log segment corrupted");

    let delivery = deliveries.recv().await.unwrap();
    assert!(matches!(delivery.result, Err(ConnectorError::Fatal(_))));
    assert_eq!(sink.stats().failed, 1);
}
