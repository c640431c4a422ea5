use crate::commands;
use crate::state::AppState;
use axum::{routing::get, Router};

pub fn router() -> Router<AppState> {
    Router::new().route("/api/v1/clicks", get(commands::clicks::list_clicks))
}
