use crate::commands;
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/datasets", get(commands::datasets::list_datasets))
        .route(
            "/api/v1/datasets/{id}/rows",
            get(commands::datasets::list_dataset_rows),
        )
        .route(
            "/api/v1/datasets/{id}",
            axum::routing::delete(commands::datasets::delete_dataset),
        )
}
