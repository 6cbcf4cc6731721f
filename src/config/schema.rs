//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the connector.
//! All types derive Serde traits for deserialization from config files. Channel
//! options also accept the dashed and dotted keys used by broker client
//! configuration (`max-inflight-messages`, `max.block.ms`, ...).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the connector.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,

    /// Health endpoint settings.
    pub admin: AdminConfig,

    /// Registry-wide health policy.
    pub health: HealthConfig,

    /// Channel definitions.
    pub channels: Vec<ChannelConfig>,
}

impl ConnectorConfig {
    /// Find a channel by name.
    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }
}

/// Whether a channel reads from or writes to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Incoming => "incoming",
            Direction::Outgoing => "outgoing",
        }
    }
}

/// Where a consumer starts when its group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    Earliest,
    #[default]
    Latest,
}

/// A single connector channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Unique channel identifier for logging/metrics/health.
    pub name: String,

    pub direction: Direction,

    /// Topic to read or write. Defaults to the channel name.
    #[serde(default)]
    pub topic: Option<String>,

    /// Consumer group for incoming channels. Defaults to the channel name.
    #[serde(default, alias = "group.id")]
    pub group_id: Option<String>,

    /// Connectivity probe cadence.
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Register the channel with the health registry at all.
    #[serde(default = "default_true", alias = "health-enabled")]
    pub health_enabled: bool,

    /// Count the channel in the readiness verdict.
    #[serde(default = "default_true", alias = "health-readiness-enabled")]
    pub health_readiness_enabled: bool,

    /// Require the topic to exist before reporting CONNECTED.
    #[serde(default, alias = "health-topic-verification-enabled")]
    pub health_topic_verification_enabled: bool,

    /// Deadline for the topic existence check.
    #[serde(
        default = "default_verification_timeout_ms",
        alias = "health-topic-verification-timeout-ms"
    )]
    pub health_topic_verification_timeout_ms: u64,

    /// Bound on unacknowledged outgoing sends. `0` disables the bound.
    #[serde(
        default = "default_max_inflight_messages",
        alias = "max-inflight-messages"
    )]
    pub max_inflight_messages: usize,

    /// How long a send may wait for in-flight capacity.
    #[serde(default = "default_max_block_ms", alias = "max.block.ms")]
    pub max_block_ms: u64,

    /// Demand window of an unbounded outgoing stream before it overflows.
    #[serde(default = "default_overflow_buffer", alias = "overflow-buffer")]
    pub overflow_buffer: usize,

    /// Broker client timeouts.
    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default = "default_max_poll_records", alias = "max.poll.records")]
    pub max_poll_records: usize,

    /// Pause between polls that returned nothing.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default, alias = "auto.offset.reset")]
    pub auto_offset_reset: OffsetReset,
}

fn default_true() -> bool {
    true
}

fn default_verification_timeout_ms() -> u64 {
    2000
}

fn default_max_inflight_messages() -> usize {
    1024
}

fn default_max_block_ms() -> u64 {
    60_000
}

fn default_overflow_buffer() -> usize {
    256
}

fn default_max_poll_records() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    100
}

impl ChannelConfig {
    /// A channel with every option at its default.
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            topic: None,
            group_id: None,
            probe: ProbeConfig::default(),
            health_enabled: true,
            health_readiness_enabled: true,
            health_topic_verification_enabled: false,
            health_topic_verification_timeout_ms: default_verification_timeout_ms(),
            max_inflight_messages: default_max_inflight_messages(),
            max_block_ms: default_max_block_ms(),
            overflow_buffer: default_overflow_buffer(),
            client: ClientConfig::default(),
            max_poll_records: default_max_poll_records(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_offset_reset: OffsetReset::default(),
        }
    }

    pub fn topic(&self) -> &str {
        self.topic.as_deref().unwrap_or(&self.name)
    }

    pub fn group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.name)
    }

    /// The in-flight bound, if one is configured.
    pub fn inflight_limit(&self) -> Option<usize> {
        (self.max_inflight_messages > 0).then_some(self.max_inflight_messages)
    }

    pub fn max_block(&self) -> Duration {
        Duration::from_millis(self.max_block_ms)
    }

    pub fn verification_timeout(&self) -> Duration {
        Duration::from_millis(self.health_topic_verification_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Connectivity probe configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Per-probe deadline in milliseconds.
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            timeout_ms: 2000,
        }
    }
}

/// Broker client timeouts.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a single produce or fetch request.
    #[serde(alias = "request.timeout.ms")]
    pub request_timeout_ms: u64,

    /// Deadline for administrative calls (committed offsets, metadata).
    #[serde(alias = "default.api.timeout.ms")]
    pub default_api_timeout_ms: u64,

    /// Pause before retrying a request that failed on connectivity.
    #[serde(alias = "retry.backoff.ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
            default_api_timeout_ms: 60_000,
            retry_backoff_ms: 100,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_millis(self.default_api_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Registry-wide health policy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Readiness verdict when no channel is registered.
    pub empty_is_ready: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            empty_is_ready: true,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub log_json: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_json: false,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Health endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the health endpoint.
    pub enabled: bool,

    /// Health endpoint bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
