//! `/health` endpoint.

use chrono::{DateTime, Utc};
use murmur_telemetry::MetricsSnapshot;
use serde::Serialize;

use crate::gateway::Gateway;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"healthy"` while the listener is up.
    pub status: &'static str,
    /// Currently admitted client connections.
    pub connections: usize,
    pub max_connections: usize,
    pub started_at: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
}

pub fn health_check(gateway: &Gateway, started_at: DateTime<Utc>) -> HealthResponse {
    HealthResponse {
        status: "healthy",
        connections: gateway.admission().count(),
        max_connections: gateway.admission().max(),
        started_at,
        metrics: gateway.metrics().snapshot(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::auth::StaticVerifier;
    use murmur_core::UpstreamCredentials;
    use murmur_telemetry::RelayMetrics;
    use murmur_upstream::{DriverConfig, TtsDriver};

    #[test]
    fn reports_admission_and_metrics() {
        let metrics = Arc::new(RelayMetrics::new());
        metrics.connection_rejected();
        let gateway = Gateway::new(
            5,
            8,
            Arc::new(TtsDriver::new(DriverConfig::new(
                "ws://127.0.0.1:1",
                UpstreamCredentials::new("a", "k"),
            ))),
            Arc::new(StaticVerifier::new()),
            metrics,
        );
        assert!(gateway.admission().acquire());

        let json = serde_json::to_value(health_check(&gateway, Utc::now())).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["connections"], 1);
        assert_eq!(json["maxConnections"], 5);
        assert_eq!(json["metrics"]["connectionsRejected"], 1);
        assert!(json["startedAt"].is_string());
    }
}
