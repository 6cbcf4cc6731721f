//! In-process broker with a reachability switch.
//!
//! # Responsibilities
//! - Keep append-only topic logs and committed offsets per consumer group
//! - Simulate an outage: refused connections or a black hole
//! - Auto-create topics on first use, like a default broker configuration
//!
//! # Design Decisions
//! - Reachability is checked when a call starts; a black-holed call never
//!   completes even if the broker comes back, exactly like a lost request
//! - Cloning shares the same broker state

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broker::{
    BrokerClient, BrokerError, BrokerResult, ConsumerRecord, Record, RecordMetadata,
};

/// How calls behave while the broker is unreachable.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnreachableMode {
    /// Calls fail immediately with `BrokerError::Unreachable`.
    Refuse = 0,
    /// Calls never complete; only the caller's deadline ends them.
    Blackhole = 1,
}

impl From<u8> for UnreachableMode {
    fn from(val: u8) -> Self {
        match val {
            1 => UnreachableMode::Blackhole,
            _ => UnreachableMode::Refuse,
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Record>>,
    commits: HashMap<(String, String), u64>,
}

#[derive(Debug)]
struct Inner {
    reachable: AtomicBool,
    mode: AtomicU8,
    auto_create_topics: AtomicBool,
    state: Mutex<BrokerState>,
}

/// A shared, in-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    /// Create a reachable broker with topic auto-creation enabled.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                reachable: AtomicBool::new(true),
                mode: AtomicU8::new(UnreachableMode::Refuse as u8),
                auto_create_topics: AtomicBool::new(true),
                state: Mutex::new(BrokerState::default()),
            }),
        }
    }

    /// Create a broker that starts unreachable.
    pub fn unreachable(mode: UnreachableMode) -> Self {
        let broker = Self::new();
        broker.set_unreachable_mode(mode);
        broker.set_reachable(false);
        broker
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        tracing::debug!(reachable, "In-memory broker reachability changed");
    }

    pub fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    pub fn set_unreachable_mode(&self, mode: UnreachableMode) {
        self.inner.mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn set_auto_create_topics(&self, enabled: bool) {
        self.inner.auto_create_topics.store(enabled, Ordering::SeqCst);
    }

    /// Create `topic` if it does not exist yet.
    pub fn create_topic(&self, topic: &str) {
        self.inner
            .state
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default();
    }

    /// Snapshot of every record appended to `topic`.
    pub fn records(&self, topic: &str) -> Vec<Record> {
        self.inner
            .state
            .lock()
            .topics
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Append directly, bypassing reachability. Stands in for an external producer.
    pub fn produce(&self, topic: &str, record: Record) -> u64 {
        let mut state = self.inner.state.lock();
        let log = state.topics.entry(topic.to_string()).or_default();
        log.push(record);
        (log.len() - 1) as u64
    }

    async fn gate(&self) -> BrokerResult<()> {
        if self.is_reachable() {
            return Ok(());
        }
        match UnreachableMode::from(self.inner.mode.load(Ordering::SeqCst)) {
            UnreachableMode::Refuse => Err(BrokerError::Unreachable(
                "connection refused".to_string(),
            )),
            UnreachableMode::Blackhole => {
                futures_util::future::pending::<BrokerResult<()>>().await
            }
        }
    }

    fn ensure_topic(&self, state: &mut BrokerState, topic: &str) -> BrokerResult<()> {
        if state.topics.contains_key(topic) {
            return Ok(());
        }
        if self.inner.auto_create_topics.load(Ordering::SeqCst) {
            state.topics.insert(topic.to_string(), Vec::new());
            tracing::debug!(topic, "In-memory broker auto-created topic");
            Ok(())
        } else {
            Err(BrokerError::UnknownTopic(topic.to_string()))
        }
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn probe(&self) -> BrokerResult<()> {
        self.gate().await
    }

    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool> {
        self.gate().await?;
        Ok(self.inner.state.lock().topics.contains_key(topic))
    }

    async fn send(&self, topic: &str, record: &Record) -> BrokerResult<RecordMetadata> {
        self.gate().await?;
        let mut state = self.inner.state.lock();
        self.ensure_topic(&mut state, topic)?;
        let log = state.topics.entry(topic.to_string()).or_default();
        log.push(record.clone());
        Ok(RecordMetadata {
            topic: topic.to_string(),
            offset: (log.len() - 1) as u64,
        })
    }

    async fn fetch(
        &self,
        topic: &str,
        offset: u64,
        max_records: usize,
    ) -> BrokerResult<Vec<ConsumerRecord>> {
        self.gate().await?;
        let mut state = self.inner.state.lock();
        self.ensure_topic(&mut state, topic)?;
        let log = state.topics.get(topic).map(Vec::as_slice).unwrap_or_default();
        Ok(log
            .iter()
            .enumerate()
            .skip(offset as usize)
            .take(max_records)
            .map(|(i, record)| ConsumerRecord {
                topic: topic.to_string(),
                offset: i as u64,
                record: record.clone(),
            })
            .collect())
    }

    async fn commit(&self, group: &str, topic: &str, offset: u64) -> BrokerResult<()> {
        self.gate().await?;
        self.inner
            .state
            .lock()
            .commits
            .insert((group.to_string(), topic.to_string()), offset);
        Ok(())
    }

    async fn committed(&self, group: &str, topic: &str) -> BrokerResult<Option<u64>> {
        self.gate().await?;
        Ok(self
            .inner
            .state
            .lock()
            .commits
            .get(&(group.to_string(), topic.to_string()))
            .copied())
    }

    async fn end_offset(&self, topic: &str) -> BrokerResult<u64> {
        self.gate().await?;
        let mut state = self.inner.state.lock();
        self.ensure_topic(&mut state, topic)?;
        Ok(state.topics.get(topic).map_or(0, |log| log.len() as u64))
    }
}
