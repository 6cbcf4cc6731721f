//! Health endpoints.
//!
//! `GET /health` returns the full snapshot, `/health/ready` and
//! `/health/live` the same body with 200 or 503 depending on the flag.

pub mod handlers;

use axum::{routing::get, Router};

use crate::health::HealthRegistry;
use self::handlers::*;

pub fn setup_admin_router(registry: HealthRegistry) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/health/ready", get(get_readiness))
        .route("/health/live", get(get_liveness))
        .with_state(registry)
}
