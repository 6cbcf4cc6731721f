//! Channel health subsystem.
//!
//! # Data Flow
//! ```text
//! Connection monitor (monitor.rs):
//!     Periodic timer
//!     → probe broker (and topic, when verification is on)
//!     → publish ChannelStatus (state.rs)
//!
//! Failures observed elsewhere (sink send, source fetch, recovery):
//!     → monitor.report_failure()
//!     → publish DISCONNECTED with the reason
//!
//! Registry (registry.rs):
//!     Listener on every monitor
//!     → rebuild HealthSnapshot { ready, alive, checks }
//! ```
//!
//! # Design Decisions
//! - Readiness follows connectivity; liveness only follows fatal errors
//! - Health state is per channel

pub mod monitor;
pub mod registry;
pub mod state;

pub use monitor::{ConnectionMonitor, ListenerId, ProbeSettings, TransitionListener};
pub use registry::{
    CheckStatus, FatalRecord, HealthCheck, HealthOptions, HealthRegistry, HealthSnapshot,
};
pub use state::{ChannelStatus, ConnectionState, Probe, ProbeOutcome, Transition};
