//! Connector error taxonomy.
//!
//! # Propagation
//! ```text
//! Connectivity / TopicVerification → absorbed by the probe loop, visible only as readiness
//! SendTimeout                      → returned to whoever issued that send
//! BackpressureOverflow             → delivered once through the stream's failure slot
//! Stream                           → the application's own failure, captured like an overflow
//! Fatal                            → clears liveness, halts the channel, logged at error
//! ```

use thiserror::Error;

use crate::backpressure::{BackpressureFailure, SendTimeoutError};
use crate::broker::BrokerError;
use crate::config::loader::ConfigError;
use crate::stream::StreamFailure;

/// Errors surfaced by the connector.
#[derive(Debug, Clone, Error)]
pub enum ConnectorError {
    /// The broker could not be reached, or answered with a retriable error.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// The broker is reachable but the channel's topic does not exist.
    #[error("topic not found: {topic}")]
    TopicVerification { topic: String },

    /// A single send waited longer than its blocking deadline.
    #[error(transparent)]
    SendTimeout(#[from] SendTimeoutError),

    /// The outgoing stream emitted faster than downstream demand.
    #[error(transparent)]
    BackpressureOverflow(#[from] BackpressureFailure),

    /// The application failed its own outgoing stream.
    #[error(transparent)]
    Stream(#[from] StreamFailure),

    /// Unrecoverable condition; requires external remediation.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("no channel named '{0}' is configured")]
    UnknownChannel(String),

    #[error("channel '{channel}' is configured as {configured}, not {requested}")]
    DirectionMismatch {
        channel: String,
        configured: &'static str,
        requested: &'static str,
    },

    #[error("channel '{0}' is already started")]
    AlreadyStarted(String),

    #[error("channel '{0}' is closed")]
    Closed(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl ConnectorError {
    /// Whether the condition resolves on its own once the broker is back.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Connectivity(_)
                | ConnectorError::TopicVerification { .. }
                | ConnectorError::SendTimeout(_)
        )
    }

    /// Only fatal errors may clear liveness.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectorError::Fatal(_))
    }
}

impl From<BrokerError> for ConnectorError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Fatal(reason) => ConnectorError::Fatal(reason),
            BrokerError::UnknownTopic(topic) => ConnectorError::TopicVerification { topic },
            other => ConnectorError::Connectivity(other.to_string()),
        }
    }
}

impl From<ConfigError> for ConnectorError {
    fn from(err: ConfigError) -> Self {
        ConnectorError::Config(err.to_string())
    }
}

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;
