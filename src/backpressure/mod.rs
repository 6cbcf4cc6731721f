//! Backpressure for outgoing streams.
//!
//! # Data Flow
//! ```text
//! producer ── send() / send_on_demand() ──▶ BackpressureGuard ── Admitted ──▶ sink dispatcher ──▶ broker
//!                                                │                                  │
//!                                           InFlightCounter ◀──── permit dropped ───┘ (ack or per-message failure)
//! ```
//!
//! `send` is for push-style producers; `send_on_demand` is for pull-driven
//! streams and waits for demand in unbounded mode.

pub mod guard;
pub mod inflight;

pub use guard::{
    Admitted, BackpressureFailure, BackpressureGuard, GuardConfig, SendOutcome, SendTimeoutError,
};
pub use inflight::{AdmissionError, InFlightCounter, InFlightPermit};
