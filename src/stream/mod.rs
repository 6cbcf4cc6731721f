//! Outgoing message streams.
//!
//! A sink consumes any `Stream<Item = Result<Record, StreamFailure>>`. An
//! `Err` item is the application failing its own stream; it ends the stream.
//! [`emitter`] builds such a stream from explicit `emit`/`complete`/`fail`
//! calls; [`ticks`] is a periodic counter used to generate traffic.

pub mod emitter;

use thiserror::Error;

pub use emitter::{emitter, ticks, EmitError, Emitter, EmitterStream};

/// The application ended its stream with an error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stream failed: {reason}")]
pub struct StreamFailure {
    pub reason: String,
}

impl StreamFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
