//! Broker client abstraction.
//!
//! # Data Flow
//! ```text
//! ConnectionMonitor ── probe() / topic_exists() ──▶ BrokerClient
//! Sink dispatcher   ── send() ────────────────────▶ BrokerClient
//! Source poller     ── fetch() / commit() ────────▶ BrokerClient
//! ```
//!
//! # Design Decisions
//! - The connector core only talks to the broker through `BrokerClient`
//! - Callers own every deadline; the client itself never enforces timeouts
//! - `InMemoryBroker` is a full implementation with a reachability switch,
//!   used by the integration tests and the simulator binary

pub mod memory;
pub mod record;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::{InMemoryBroker, UnreachableMode};
pub use record::{ConsumerRecord, Record, RecordMetadata};

/// Errors reported by a broker client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached (connection refused, no route, ...).
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The topic does not exist and was not created.
    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    /// The broker refused this particular request. Retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The client is in a state it cannot leave on its own.
    #[error("fatal client error: {0}")]
    Fatal(String),
}

impl BrokerError {
    /// Whether the same request may succeed once connectivity returns.
    pub fn is_retriable(&self) -> bool {
        matches!(self, BrokerError::Unreachable(_) | BrokerError::UnknownTopic(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Fatal(_))
    }
}

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Operations the connector needs from a message broker.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Check that the cluster answers at all.
    async fn probe(&self) -> BrokerResult<()>;

    /// Administrative check that `topic` exists.
    async fn topic_exists(&self, topic: &str) -> BrokerResult<bool>;

    /// Append a record to `topic`.
    async fn send(&self, topic: &str, record: &Record) -> BrokerResult<RecordMetadata>;

    /// Read up to `max_records` records starting at `offset`.
    async fn fetch(
        &self,
        topic: &str,
        offset: u64,
        max_records: usize,
    ) -> BrokerResult<Vec<ConsumerRecord>>;

    /// Store `offset` as the next position to read for `group`.
    async fn commit(&self, group: &str, topic: &str, offset: u64) -> BrokerResult<()>;

    /// The last committed position for `group`, if any.
    async fn committed(&self, group: &str, topic: &str) -> BrokerResult<Option<u64>>;

    /// Offset one past the last record currently in `topic`.
    async fn end_offset(&self, topic: &str) -> BrokerResult<u64>;
}
