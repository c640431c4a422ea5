use axum::{extract::State, http::StatusCode, Json};
use serde_json::json;

use crate::state::AppState;

/// Liveness contract: 200 only when the database answers; the body breaks
/// out each subsystem.
pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<serde_json::Value>) {
    let database_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();

    let queue = if state.queue.is_running() { "ok" } else { "down" };
    let storage = if state.storage.is_some() {
        "ok"
    } else {
        "unconfigured"
    };

    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "database": if database_ok { "ok" } else { "down" },
            "queue": queue,
            "storage": storage,
        })),
    )
}
