//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ConnectorConfig (validated, immutable)
//!     → handed to Connector::new by value
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; channels read their settings at start
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, ChannelConfig, ClientConfig, ConnectorConfig, Direction, HealthConfig,
    ObservabilityConfig, OffsetReset, ProbeConfig,
};
