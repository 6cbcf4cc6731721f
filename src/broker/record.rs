//! Record types exchanged with the broker.
//!
//! Payloads are opaque bytes; (de)serialization belongs to the application.

use serde::{Deserialize, Serialize};

/// An outgoing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Option<String>,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            value: value.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Record carrying a big-endian `i32`, the layout of the common integer serializer.
    pub fn from_i32(value: i32) -> Self {
        Self::new(value.to_be_bytes().to_vec())
    }

    /// Lossy UTF-8 view of the payload.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

/// Broker acknowledgment for a sent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub offset: u64,
}

/// A record read from a topic, with its position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumerRecord {
    pub topic: String,
    pub offset: u64,
    pub record: Record,
}

impl ConsumerRecord {
    /// Decode the payload as a big-endian `i32`.
    pub fn value_i32(&self) -> Option<i32> {
        let bytes: [u8; 4] = self.record.value.as_slice().try_into().ok()?;
        Some(i32::from_be_bytes(bytes))
    }
}
