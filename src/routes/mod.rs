use crate::state::AppState;
use axum::Router;

pub mod ad_spends;
pub mod clicks;
pub mod dashboard;
pub mod datasets;
pub mod jobs;
pub mod system;

pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(system::router())
        .merge(jobs::router())
        .merge(datasets::router())
        .merge(dashboard::router())
        .merge(ad_spends::router())
        .merge(clicks::router())
}
