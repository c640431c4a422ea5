use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::{ClickRow, Dataset, TransactionRow};
use crate::error::{MarketDashError, MarketDashResult};
use crate::middleware::auth::Claims;
use crate::state::AppState;
use crate::tenancy;

const DEFAULT_PAGE: i64 = 100;
const MAX_PAGE: i64 = 1000;

#[derive(Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl Pagination {
    fn clamp(&self) -> (i64, i64) {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

pub async fn list_datasets(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> MarketDashResult<Json<Vec<Dataset>>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let datasets: Vec<Dataset> =
        sqlx::query_as("SELECT * FROM datasets ORDER BY uploaded_at DESC")
            .fetch_all(tx.conn())
            .await?;
    tx.rollback().await?;
    Ok(Json(datasets))
}

#[derive(Serialize)]
pub struct DatasetRowsResponse {
    pub dataset_id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub limit: i64,
    pub offset: i64,
    pub rows: serde_json::Value,
}

/// Paginated rows of one dataset; the row shape follows the dataset type.
pub async fn list_dataset_rows(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(dataset_id): Path<i64>,
    Query(page): Query<Pagination>,
) -> MarketDashResult<Json<DatasetRowsResponse>> {
    let (limit, offset) = page.clamp();

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let dataset: Option<Dataset> = sqlx::query_as("SELECT * FROM datasets WHERE id = $1")
        .bind(dataset_id)
        .fetch_optional(tx.conn())
        .await?;
    // a foreign dataset is invisible under RLS: same 404 as a missing one
    let dataset = dataset.ok_or(MarketDashError::NotFound)?;

    let rows = if dataset.kind == "transaction" {
        let rows: Vec<TransactionRow> = sqlx::query_as(
            "SELECT * FROM transaction_rows WHERE dataset_id = $1 ORDER BY date, id LIMIT $2 OFFSET $3",
        )
        .bind(dataset_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(tx.conn())
        .await?;
        serde_json::to_value(rows)?
    } else {
        let rows: Vec<ClickRow> = sqlx::query_as(
            "SELECT * FROM click_rows WHERE dataset_id = $1 ORDER BY date, id LIMIT $2 OFFSET $3",
        )
        .bind(dataset_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(tx.conn())
        .await?;
        serde_json::to_value(rows)?
    };
    tx.rollback().await?;

    Ok(Json(DatasetRowsResponse {
        dataset_id,
        kind: dataset.kind,
        limit,
        offset,
        rows,
    }))
}

/// Delete a dataset; its rows cascade at the store.
pub async fn delete_dataset(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(dataset_id): Path<i64>,
) -> MarketDashResult<Json<serde_json::Value>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let deleted = sqlx::query("DELETE FROM datasets WHERE id = $1")
        .bind(dataset_id)
        .execute(tx.conn())
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(MarketDashError::NotFound);
    }
    tx.commit().await?;
    Ok(Json(json!({"deleted": dataset_id})))
}
