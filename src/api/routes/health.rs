//! Liveness endpoint

use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;

use crate::api::state::ApiState;
use crate::incident::NotificationCounts;
use crate::liveness::LivenessReport;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok` or `stalled`
    pub status: &'static str,

    #[serde(flatten)]
    pub liveness: LivenessReport,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationCounts>,
}

/// GET /api/v1/health
///
/// Answers 503 while any collector or the aggregator is stalled, so an
/// external uptime check can watch the monitor itself.
pub async fn health_check(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let liveness = state.liveness.report(chrono::Utc::now(), state.stall_after);
    let code = if liveness.stalled {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    let response = HealthResponse {
        status: if liveness.stalled { "stalled" } else { "ok" },
        liveness,
        notifications: state.incidents.as_ref().map(|m| m.notification_counts()),
    };

    (code, Json(response))
}
