use crate::commands;
use crate::state::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/jobs",
            post(commands::jobs::create_job).get(commands::jobs::list_jobs),
        )
        .route("/api/v1/jobs/{id}/commit", post(commands::jobs::commit_job))
        .route(
            "/api/v1/jobs/{id}",
            get(commands::jobs::get_job).delete(commands::jobs::delete_job),
        )
}
