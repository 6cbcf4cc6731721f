//! Resilient broker connector.
//!
//! Connectivity monitoring, health reporting, backpressure and automatic
//! recovery for message-broker channels.

// Core
pub mod broker;
pub mod config;
pub mod connector;
pub mod error;
pub mod stream;

// Resilience
pub mod backpressure;
pub mod health;
pub mod recovery;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;

pub use config::schema::ConnectorConfig;
pub use connector::{Connector, SinkHandle, SourceHandle};
pub use error::{ConnectorError, ConnectorResult};
pub use health::{HealthRegistry, HealthSnapshot};
