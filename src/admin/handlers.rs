use axum::{extract::State, http::StatusCode, Json};

use crate::health::{HealthRegistry, HealthSnapshot};

fn status_for(flag: bool) -> StatusCode {
    if flag {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

pub async fn get_health(
    State(registry): State<HealthRegistry>,
) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = registry.snapshot();
    (
        status_for(snapshot.ready && snapshot.alive),
        Json(HealthSnapshot::clone(&snapshot)),
    )
}

pub async fn get_readiness(
    State(registry): State<HealthRegistry>,
) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = registry.snapshot();
    (status_for(snapshot.ready), Json(HealthSnapshot::clone(&snapshot)))
}

pub async fn get_liveness(
    State(registry): State<HealthRegistry>,
) -> (StatusCode, Json<HealthSnapshot>) {
    let snapshot = registry.snapshot();
    (status_for(snapshot.alive), Json(HealthSnapshot::clone(&snapshot)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::health::{ConnectionMonitor, HealthOptions};
    use std::sync::Arc;

    #[tokio::test]
    async fn unreachable_channel_is_unready_but_live() {
        let registry = HealthRegistry::default();
        let monitor = ConnectionMonitor::new("out", "t", Arc::new(InMemoryBroker::new()));
        registry.register("out", monitor.clone(), HealthOptions::default());
        monitor.report_failure("broker unreachable: connection refused");

        let (status, Json(body)) = get_readiness(State(registry.clone())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.checks[0].reason, "broker unreachable: connection refused");

        let (status, _) = get_liveness(State(registry.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = get_health(State(registry)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn fatal_error_fails_liveness() {
        let registry = HealthRegistry::default();
        registry.report_fatal("in", "offset store corrupted");
        let (status, Json(body)) = get_liveness(State(registry)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body.fatal[0].reason, "offset store corrupted");
    }

    #[test]
    fn snapshot_serializes_states_in_upper_case() {
        let registry = HealthRegistry::default();
        let monitor = ConnectionMonitor::new("out", "t", Arc::new(InMemoryBroker::new()));
        registry.register("out", monitor, HealthOptions::default());
        let json = serde_json::to_value(&*registry.snapshot()).unwrap();
        assert_eq!(json["checks"][0]["state"], "INIT");
        assert_eq!(json["checks"][0]["status"], "down");
        assert_eq!(json["ready"], false);
    }
}
