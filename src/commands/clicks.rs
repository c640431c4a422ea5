use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::NaiveDate;
use serde::Deserialize;

use crate::db::ClickRow;
use crate::error::MarketDashResult;
use crate::middleware::auth::Claims;
use crate::state::AppState;
use crate::tenancy;

#[derive(Deserialize)]
pub struct ClickListQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub channel: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Owner's click rows across all click datasets, filtered and paginated.
pub async fn list_clicks(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<ClickListQuery>,
) -> MarketDashResult<Json<Vec<ClickRow>>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let rows: Vec<ClickRow> = sqlx::query_as(
        r#"
        SELECT * FROM click_rows
        WHERE ($1::date IS NULL OR date >= $1)
          AND ($2::date IS NULL OR date <= $2)
          AND ($3::text IS NULL OR channel = $3)
        ORDER BY date DESC, id DESC
        LIMIT $4 OFFSET $5
        "#,
    )
    .bind(query.start_date)
    .bind(query.end_date)
    .bind(&query.channel)
    .bind(limit)
    .bind(offset)
    .fetch_all(tx.conn())
    .await?;
    tx.rollback().await?;
    Ok(Json(rows))
}
