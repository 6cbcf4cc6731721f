//! Automatic recovery after reconnection.
//!
//! # Data Flow
//! ```text
//! ConnectionMonitor ── DISCONNECTED → CONNECTED ──▶ RecoveryCoordinator::on_connected
//!                                                        │ (one run per channel at a time)
//!                                                        ▼
//!                                            Recoverable::recover (sink / source)
//!                                                        │ Err
//!                                                        ▼
//!                                            monitor.report_failure → DISCONNECTED
//! ```

pub mod coordinator;

pub use coordinator::{Recoverable, RecoveryCoordinator, RecoveryTrigger};
