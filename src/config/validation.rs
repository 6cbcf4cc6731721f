//! Configuration validation.
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ConnectorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use thiserror::Error;

use crate::config::schema::{ConnectorConfig, Direction};

/// A semantic problem in an otherwise well-formed config.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("channel name must not be empty")]
    EmptyChannelName,

    #[error("channel '{0}' is defined more than once")]
    DuplicateChannel(String),

    #[error("channel '{0}' has an empty topic")]
    EmptyTopic(String),

    #[error("channel '{channel}': {field} must be greater than zero")]
    MustBePositive { channel: String, field: &'static str },
}

pub fn validate_config(config: &ConnectorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for channel in &config.channels {
        let name = channel.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::EmptyChannelName);
            continue;
        }
        if !seen.insert(name) {
            errors.push(ValidationError::DuplicateChannel(name.to_string()));
        }
        if channel.topic().trim().is_empty() {
            errors.push(ValidationError::EmptyTopic(name.to_string()));
        }

        let positive = |value: u64, field: &'static str, errors: &mut Vec<ValidationError>| {
            if value == 0 {
                errors.push(ValidationError::MustBePositive {
                    channel: name.to_string(),
                    field,
                });
            }
        };

        positive(channel.probe.interval_ms, "probe.interval_ms", &mut errors);
        positive(channel.probe.timeout_ms, "probe.timeout_ms", &mut errors);
        positive(
            channel.health_topic_verification_timeout_ms,
            "health_topic_verification_timeout_ms",
            &mut errors,
        );
        positive(
            channel.client.request_timeout_ms,
            "client.request_timeout_ms",
            &mut errors,
        );
        positive(
            channel.client.default_api_timeout_ms,
            "client.default_api_timeout_ms",
            &mut errors,
        );
        // A zero backoff turns every refused call into a busy loop.
        positive(
            channel.client.retry_backoff_ms,
            "client.retry_backoff_ms",
            &mut errors,
        );

        match channel.direction {
            Direction::Outgoing => {
                // Bounded: the per-send deadline. Unbounded: how long a full
                // demand window is tolerated before it counts as overflow.
                positive(channel.max_block_ms, "max_block_ms", &mut errors);
                if channel.inflight_limit().is_none() {
                    positive(channel.overflow_buffer as u64, "overflow_buffer", &mut errors);
                }
            }
            Direction::Incoming => {
                positive(channel.max_poll_records as u64, "max_poll_records", &mut errors);
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
