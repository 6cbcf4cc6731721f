//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Every state transition is logged with the channel name as a field
//! - Terminal overflows and fatal errors log at error level exactly once
//! - Metrics are cheap (atomic increments)

pub mod logging;
pub mod metrics;
