use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::{AdSpend, AdSpendAllocation, Dataset};
use crate::error::{MarketDashError, MarketDashResult};
use crate::middleware::auth::Claims;
use crate::state::AppState;
use crate::tenancy::{self, TenantTx};

/// The frontend sends "" or "__all__" for "no sub id".
fn clean_sub_id(sub_id: Option<String>) -> Option<String> {
    sub_id.filter(|s| !s.is_empty() && s != "__all__")
}

#[derive(Deserialize)]
pub struct AdSpendPayload {
    pub date: NaiveDate,
    pub amount: Decimal,
    pub sub_id: Option<String>,
    #[serde(default)]
    pub clicks: i32,
}

pub async fn create_ad_spend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<AdSpendPayload>,
) -> MarketDashResult<(StatusCode, Json<AdSpend>)> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let created: AdSpend = sqlx::query_as(
        r#"
        INSERT INTO ad_spends (user_id, date, sub_id, amount, clicks)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(claims.user_id)
    .bind(payload.date)
    .bind(clean_sub_id(payload.sub_id))
    .bind(payload.amount)
    .bind(payload.clicks)
    .fetch_one(tx.conn())
    .await?;
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn bulk_create_ad_spends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(items): Json<Vec<AdSpendPayload>>,
) -> MarketDashResult<(StatusCode, Json<Vec<AdSpend>>)> {
    if items.is_empty() {
        return Ok((StatusCode::CREATED, Json(Vec::new())));
    }

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let mut created = Vec::with_capacity(items.len());
    for item in items {
        let row: AdSpend = sqlx::query_as(
            r#"
            INSERT INTO ad_spends (user_id, date, sub_id, amount, clicks)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(claims.user_id)
        .bind(item.date)
        .bind(clean_sub_id(item.sub_id))
        .bind(item.amount)
        .bind(item.clicks)
        .fetch_one(tx.conn())
        .await?;
        created.push(row);
    }
    tx.commit().await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[derive(Deserialize)]
pub struct AdSpendListQuery {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_ad_spends(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<AdSpendListQuery>,
) -> MarketDashResult<Json<Vec<AdSpend>>> {
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let offset = query.offset.unwrap_or(0).max(0);

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let rows: Vec<AdSpend> = sqlx::query_as(
        r#"
        SELECT * FROM ad_spends
        WHERE ($1::date IS NULL OR date >= $1)
          AND ($2::date IS NULL OR date <= $2)
        ORDER BY date DESC, id DESC
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(query.start_date)
    .bind(query.end_date)
    .bind(limit)
    .bind(offset)
    .fetch_all(tx.conn())
    .await?;
    tx.rollback().await?;
    Ok(Json(rows))
}

#[derive(Deserialize)]
pub struct AdSpendUpdate {
    pub date: Option<NaiveDate>,
    pub amount: Option<Decimal>,
    pub sub_id: Option<String>,
    pub clicks: Option<i32>,
}

pub async fn update_ad_spend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(ad_spend_id): Path<i64>,
    Json(payload): Json<AdSpendUpdate>,
) -> MarketDashResult<Json<AdSpend>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let existing: Option<AdSpend> = sqlx::query_as("SELECT * FROM ad_spends WHERE id = $1")
        .bind(ad_spend_id)
        .fetch_optional(tx.conn())
        .await?;
    let existing = existing.ok_or(MarketDashError::NotFound)?;

    let date = payload.date.unwrap_or(existing.date);
    let amount = payload.amount.unwrap_or(existing.amount);
    let clicks = payload.clicks.unwrap_or(existing.clicks);
    let sub_id = match payload.sub_id {
        Some(s) => clean_sub_id(Some(s)),
        None => existing.sub_id,
    };

    let updated: AdSpend = sqlx::query_as(
        r#"
        UPDATE ad_spends SET date = $2, amount = $3, sub_id = $4, clicks = $5
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(ad_spend_id)
    .bind(date)
    .bind(amount)
    .bind(sub_id)
    .bind(clicks)
    .fetch_one(tx.conn())
    .await?;
    tx.commit().await?;
    Ok(Json(updated))
}

pub async fn delete_ad_spend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(ad_spend_id): Path<i64>,
) -> MarketDashResult<Json<serde_json::Value>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let deleted = sqlx::query("DELETE FROM ad_spends WHERE id = $1")
        .bind(ad_spend_id)
        .execute(tx.conn())
        .await?;
    if deleted.rows_affected() == 0 {
        return Err(MarketDashError::NotFound);
    }
    tx.commit().await?;
    Ok(Json(json!({"deleted": ad_spend_id})))
}

#[derive(Deserialize)]
pub struct AllocateRequest {
    pub dataset_id: i64,
}

#[derive(Serialize)]
pub struct AllocateResponse {
    pub ad_spend_id: i64,
    pub dataset_id: i64,
    pub allocated: Decimal,
    pub matched_rows: i32,
    pub unallocated: bool,
    pub already_applied: bool,
}

/// Distribute an ad spend's amount over the dataset's transaction rows for
/// the spend's (date, sub_id), proportionally to revenue. Equal split when
/// every match has zero revenue; recorded as unallocated when nothing
/// matches. The allocation ledger makes a re-run a no-op and a concurrent
/// double-apply a conflict.
pub async fn allocate_ad_spend(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(ad_spend_id): Path<i64>,
    Json(payload): Json<AllocateRequest>,
) -> MarketDashResult<Json<AllocateResponse>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;

    let ad_spend: Option<AdSpend> = sqlx::query_as("SELECT * FROM ad_spends WHERE id = $1")
        .bind(ad_spend_id)
        .fetch_optional(tx.conn())
        .await?;
    let ad_spend = ad_spend.ok_or(MarketDashError::NotFound)?;

    let dataset: Option<Dataset> = sqlx::query_as("SELECT * FROM datasets WHERE id = $1")
        .bind(payload.dataset_id)
        .fetch_optional(tx.conn())
        .await?;
    let dataset = dataset.ok_or(MarketDashError::NotFound)?;
    if dataset.kind != "transaction" {
        return Err(MarketDashError::Validation(
            "Ad spend allocation applies to transaction datasets only".into(),
        ));
    }

    let prior: Option<AdSpendAllocation> = sqlx::query_as(
        "SELECT * FROM ad_spend_allocations WHERE ad_spend_id = $1 AND dataset_id = $2",
    )
    .bind(ad_spend_id)
    .bind(dataset.id)
    .fetch_optional(tx.conn())
    .await?;
    if let Some(prior) = prior {
        return Ok(Json(AllocateResponse {
            ad_spend_id,
            dataset_id: dataset.id,
            allocated: prior.allocated,
            matched_rows: prior.matched_rows,
            unallocated: prior.unallocated,
            already_applied: true,
        }));
    }

    let matches: Vec<(i64, Decimal)> = sqlx::query_as(
        r#"
        SELECT id, revenue FROM transaction_rows
        WHERE dataset_id = $1
          AND date = $2
          AND ($3::text IS NULL OR sub_id = $3)
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(dataset.id)
    .bind(ad_spend.date)
    .bind(&ad_spend.sub_id)
    .fetch_all(tx.conn())
    .await?;

    if matches.is_empty() {
        record_allocation(&mut tx, claims.user_id, ad_spend_id, dataset.id, Decimal::ZERO, 0, true)
            .await?;
        tx.commit().await?;
        return Ok(Json(AllocateResponse {
            ad_spend_id,
            dataset_id: dataset.id,
            allocated: Decimal::ZERO,
            matched_rows: 0,
            unallocated: true,
            already_applied: false,
        }));
    }

    let shares = distribute(ad_spend.amount, &matches);
    let ids: Vec<i64> = matches.iter().map(|(id, _)| *id).collect();

    sqlx::query(
        r#"
        UPDATE transaction_rows AS t
        SET cost = t.cost + s.share,
            profit = t.revenue - (t.cost + s.share) - t.commission
        FROM (SELECT unnest($1::bigint[]) AS id, unnest($2::numeric[]) AS share) AS s
        WHERE t.id = s.id
        "#,
    )
    .bind(&ids)
    .bind(&shares)
    .execute(tx.conn())
    .await?;

    record_allocation(
        &mut tx,
        claims.user_id,
        ad_spend_id,
        dataset.id,
        ad_spend.amount,
        matches.len() as i32,
        false,
    )
    .await?;
    tx.commit().await?;

    Ok(Json(AllocateResponse {
        ad_spend_id,
        dataset_id: dataset.id,
        allocated: ad_spend.amount,
        matched_rows: matches.len() as i32,
        unallocated: false,
        already_applied: false,
    }))
}

async fn record_allocation(
    tx: &mut TenantTx,
    user_id: i64,
    ad_spend_id: i64,
    dataset_id: i64,
    allocated: Decimal,
    matched_rows: i32,
    unallocated: bool,
) -> MarketDashResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO ad_spend_allocations
            (user_id, ad_spend_id, dataset_id, allocated, matched_rows, unallocated)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(user_id)
    .bind(ad_spend_id)
    .bind(dataset_id)
    .bind(allocated)
    .bind(matched_rows)
    .bind(unallocated)
    .execute(tx.conn())
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
            MarketDashError::Conflict("Allocation already applied concurrently".into()),
        ),
        Err(e) => Err(e.into()),
    }
}

/// Shares proportional to revenue at the column's 4-dp scale; all-zero
/// revenue splits equally. The rounding remainder lands on the last row so
/// the shares always sum to exactly `amount`.
fn distribute(amount: Decimal, matches: &[(i64, Decimal)]) -> Vec<Decimal> {
    let total_revenue: Decimal = matches.iter().map(|(_, r)| *r).sum();
    let count = Decimal::from(matches.len() as i64);

    let mut shares: Vec<Decimal> = matches
        .iter()
        .map(|(_, revenue)| {
            let share = if total_revenue.is_zero() {
                amount / count
            } else {
                amount * *revenue / total_revenue
            };
            share.round_dp(4)
        })
        .collect();

    let assigned: Decimal = shares.iter().sum();
    if let Some(last) = shares.last_mut() {
        *last += amount - assigned;
    }
    shares
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(n: i64, scale: u32) -> Decimal {
        Decimal::new(n, scale)
    }

    #[test]
    fn proportional_split() {
        // S4: 30 over revenues 100 and 200 -> 10 and 20
        let matches = vec![(1, dec(100, 0)), (2, dec(200, 0))];
        let shares = distribute(dec(30, 0), &matches);
        assert_eq!(shares, vec![dec(10, 0), dec(20, 0)]);
    }

    #[test]
    fn zero_revenue_splits_equally_to_the_cent() {
        let matches = vec![(1, Decimal::ZERO), (2, Decimal::ZERO), (3, Decimal::ZERO)];
        let shares = distribute(dec(100, 0), &matches);
        let total: Decimal = shares.iter().sum();
        assert_eq!(total, dec(100, 0));
        // equal split with the remainder on the last row
        assert_eq!(shares[0], shares[1]);
        assert!((shares[2] - shares[0]).abs() < dec(1, 3));
    }

    #[test]
    fn rounding_remainder_preserves_total() {
        let matches = vec![(1, dec(1, 0)), (2, dec(1, 0)), (3, dec(1, 0))];
        let shares = distribute(dec(1, 0), &matches);
        let total: Decimal = shares.iter().sum();
        assert_eq!(total, dec(1, 0));
    }

    #[test]
    fn single_row_takes_everything() {
        let shares = distribute(dec(75, 1), &[(9, dec(3, 0))]);
        assert_eq!(shares, vec![dec(75, 1)]);
    }

    #[test]
    fn sub_id_placeholders_normalize_to_null() {
        assert_eq!(clean_sub_id(Some("".into())), None);
        assert_eq!(clean_sub_id(Some("__all__".into())), None);
        assert_eq!(clean_sub_id(Some("abc".into())), Some("abc".into()));
        assert_eq!(clean_sub_id(None), None);
    }
}
