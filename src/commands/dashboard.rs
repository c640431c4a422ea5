use axum::{
    extract::{Query, State},
    Extension, Json,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};

use crate::error::MarketDashResult;
use crate::middleware::auth::Claims;
use crate::state::AppState;
use crate::tenancy;

const DEFAULT_TOP_PRODUCTS: usize = 50;
const MAX_TOP_PRODUCTS: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct DashboardFilters {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub product: Option<String>,
    pub min_value: Option<Decimal>,
    pub max_value: Option<Decimal>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub sub_id: Option<String>,
    pub top_products: Option<usize>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Kpis {
    pub total_revenue: Decimal,
    pub total_cost: Decimal,
    pub total_commission: Decimal,
    pub total_profit: Decimal,
    pub total_rows: i64,
    pub distinct_orders: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct PeriodAggregation {
    pub period: NaiveDate,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub commission: Decimal,
    pub profit: Decimal,
    pub row_count: i64,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ProductAggregation {
    pub product: String,
    pub revenue: Decimal,
    pub cost: Decimal,
    pub commission: Decimal,
    pub profit: Decimal,
    pub row_count: i64,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub kpis: Kpis,
    pub period_aggregations: Vec<PeriodAggregation>,
    pub product_aggregations: Vec<ProductAggregation>,
}

/// Filters compose as conjunctions over the owner's rows. RLS already pins
/// the owner; the explicit user_id predicate keeps the (user_id, ...)
/// indexes in play.
fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, owner_id: i64, filters: &DashboardFilters) {
    qb.push(" WHERE user_id = ").push_bind(owner_id);
    if let Some(start) = filters.start_date {
        qb.push(" AND date >= ").push_bind(start);
    }
    if let Some(end) = filters.end_date {
        qb.push(" AND date <= ").push_bind(end);
    }
    if let Some(product) = &filters.product {
        qb.push(" AND product ILIKE ")
            .push_bind(format!("%{}%", escape_like(product)));
    }
    if let Some(min) = filters.min_value {
        qb.push(" AND revenue >= ").push_bind(min);
    }
    if let Some(max) = filters.max_value {
        qb.push(" AND revenue <= ").push_bind(max);
    }
    if let Some(platform) = &filters.platform {
        qb.push(" AND platform = ").push_bind(platform.clone());
    }
    if let Some(category) = &filters.category {
        qb.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(sub_id) = &filters.sub_id {
        qb.push(" AND sub_id = ").push_bind(sub_id.clone());
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// KPIs plus period and product aggregations, all read from one snapshot.
pub async fn get_dashboard(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Query(filters): Query<DashboardFilters>,
) -> MarketDashResult<Json<DashboardResponse>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;

    let mut kpi_query = QueryBuilder::new(
        r#"
        SELECT
            COALESCE(SUM(revenue), 0)    AS total_revenue,
            COALESCE(SUM(cost), 0)       AS total_cost,
            COALESCE(SUM(commission), 0) AS total_commission,
            COALESCE(SUM(profit), 0)     AS total_profit,
            COUNT(*)                     AS total_rows,
            COUNT(DISTINCT order_id)     AS distinct_orders
        FROM transaction_rows
        "#,
    );
    push_filters(&mut kpi_query, claims.user_id, &filters);
    let mut kpis: Kpis = kpi_query.build_query_as().fetch_one(tx.conn()).await?;

    let mut period_query = QueryBuilder::new(
        r#"
        SELECT
            date                         AS period,
            COALESCE(SUM(revenue), 0)    AS revenue,
            COALESCE(SUM(cost), 0)       AS cost,
            COALESCE(SUM(commission), 0) AS commission,
            COALESCE(SUM(profit), 0)     AS profit,
            COUNT(*)                     AS row_count
        FROM transaction_rows
        "#,
    );
    push_filters(&mut period_query, claims.user_id, &filters);
    period_query.push(" GROUP BY date ORDER BY date ASC");
    let mut periods: Vec<PeriodAggregation> =
        period_query.build_query_as().fetch_all(tx.conn()).await?;

    let mut product_query = QueryBuilder::new(
        r#"
        SELECT
            product,
            COALESCE(SUM(revenue), 0)    AS revenue,
            COALESCE(SUM(cost), 0)       AS cost,
            COALESCE(SUM(commission), 0) AS commission,
            COALESCE(SUM(profit), 0)     AS profit,
            COUNT(*)                     AS row_count
        FROM transaction_rows
        "#,
    );
    push_filters(&mut product_query, claims.user_id, &filters);
    product_query.push(" GROUP BY product ORDER BY SUM(revenue) DESC, product ASC");
    let grouped: Vec<ProductAggregation> =
        product_query.build_query_as().fetch_all(tx.conn()).await?;
    tx.rollback().await?;

    let top_k = filters
        .top_products
        .unwrap_or(DEFAULT_TOP_PRODUCTS)
        .clamp(1, MAX_TOP_PRODUCTS);
    let mut products = truncate_with_other(grouped, top_k);

    // presentation rounding happens here and only here
    kpis.total_revenue = kpis.total_revenue.round_dp(2);
    kpis.total_cost = kpis.total_cost.round_dp(2);
    kpis.total_commission = kpis.total_commission.round_dp(2);
    kpis.total_profit = kpis.total_profit.round_dp(2);
    for p in &mut periods {
        p.revenue = p.revenue.round_dp(2);
        p.cost = p.cost.round_dp(2);
        p.commission = p.commission.round_dp(2);
        p.profit = p.profit.round_dp(2);
    }
    for p in &mut products {
        p.revenue = p.revenue.round_dp(2);
        p.cost = p.cost.round_dp(2);
        p.commission = p.commission.round_dp(2);
        p.profit = p.profit.round_dp(2);
    }

    Ok(Json(DashboardResponse {
        kpis,
        period_aggregations: periods,
        product_aggregations: products,
    }))
}

/// Keep the top K products and fold the tail into a residual "other" bucket.
fn truncate_with_other(
    mut grouped: Vec<ProductAggregation>,
    top_k: usize,
) -> Vec<ProductAggregation> {
    if grouped.len() <= top_k {
        return grouped;
    }
    let tail = grouped.split_off(top_k);
    let mut other = ProductAggregation {
        product: "other".to_string(),
        revenue: Decimal::ZERO,
        cost: Decimal::ZERO,
        commission: Decimal::ZERO,
        profit: Decimal::ZERO,
        row_count: 0,
    };
    for item in tail {
        other.revenue += item.revenue;
        other.cost += item.cost;
        other.commission += item.commission;
        other.profit += item.profit;
        other.row_count += item.row_count;
    }
    grouped.push(other);
    grouped
}
