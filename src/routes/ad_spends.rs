use crate::commands;
use crate::state::AppState;
use axum::{
    routing::{get, patch, post},
    Router,
};

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/v1/ad_spends",
            get(commands::ad_spends::list_ad_spends).post(commands::ad_spends::create_ad_spend),
        )
        .route(
            "/api/v1/ad_spends/bulk",
            post(commands::ad_spends::bulk_create_ad_spends),
        )
        .route(
            "/api/v1/ad_spends/{id}",
            patch(commands::ad_spends::update_ad_spend)
                .delete(commands::ad_spends::delete_ad_spend),
        )
        .route(
            "/api/v1/ad_spends/{id}/allocate",
            post(commands::ad_spends::allocate_ad_spend),
        )
}
