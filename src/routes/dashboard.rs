use crate::commands;
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/dashboard", get(commands::dashboard::get_dashboard))
}
