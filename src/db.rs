#![allow(dead_code)]
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{FromRow, Pool, Postgres};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{MarketDashError, MarketDashResult};

pub type DbPool = Pool<Postgres>;

pub async fn init_pool_with_options(opts: PgConnectOptions) -> MarketDashResult<DbPool> {
    // connect_lazy_with returns the pool immediately. It does not validate connection.
    Ok(PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(std::time::Duration::from_secs(30))
        .idle_timeout(std::time::Duration::from_secs(120))
        .max_lifetime(std::time::Duration::from_secs(300))
        .connect_lazy_with(opts))
}

pub async fn init_pool(database_url: &str) -> MarketDashResult<DbPool> {
    let opts = PgConnectOptions::from_str(database_url)
        .map_err(|e| MarketDashError::Internal(format!("Invalid DB URL: {}", e)))?;

    init_pool_with_options(opts).await
}

pub async fn init_database(pool: &DbPool) -> MarketDashResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    let _ = ensure_seeds(pool).await;
    tracing::info!("Database ready");
    Ok(())
}

/// Seed a development login when ADMIN_EMAIL is set. Production users come
/// from the external registration/billing services.
async fn ensure_seeds(pool: &DbPool) -> MarketDashResult<()> {
    let Ok(admin_email) = std::env::var("ADMIN_EMAIL") else {
        return Ok(());
    };

    let exists: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users WHERE email = $1")
        .bind(&admin_email)
        .fetch_one(pool)
        .await
        .unwrap_or((0,));
    if exists.0 == 0 {
        let password = std::env::var("ADMIN_PASSWORD").unwrap_or_else(|_| "admin".to_string());
        if let Ok(hash) = bcrypt::hash(&password, bcrypt::DEFAULT_COST) {
            let _ = sqlx::query(
                "INSERT INTO users (email, password_hash) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(&admin_email)
            .bind(hash)
            .execute(pool)
            .await;
        }
    }
    Ok(())
}

// Job/dataset lifecycle states. Kept as plain strings in the tables; these
// constants are the only spellings the code writes.
pub mod job_status {
    pub const QUEUED: &str = "queued";
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

pub mod dataset_status {
    pub const PENDING: &str = "pending";
    pub const PROCESSING: &str = "processing";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
}

pub mod chunk_status {
    pub const QUEUED: &str = "queued";
    pub const OK: &str = "ok";
    pub const FAILED: &str = "failed";
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Dataset {
    pub id: i64,
    pub user_id: i64,
    pub filename: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub row_count: i32,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct TransactionRow {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub platform: Option<String>,
    pub category: Option<String>,
    pub product: String,
    pub status: Option<String>,
    pub sub_id: Option<String>,
    pub order_id: Option<String>,
    pub product_id: Option<String>,
    pub revenue: Decimal,
    pub commission: Decimal,
    pub cost: Decimal,
    pub profit: Decimal,
    pub quantity: i32,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct ClickRow {
    pub id: i64,
    pub dataset_id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub channel: String,
    pub sub_id: Option<String>,
    pub clicks: i32,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct AdSpend {
    pub id: i64,
    pub user_id: i64,
    pub date: NaiveDate,
    pub sub_id: Option<String>,
    pub amount: Decimal,
    pub clicks: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct AdSpendAllocation {
    pub id: i64,
    pub user_id: i64,
    pub ad_spend_id: i64,
    pub dataset_id: i64,
    pub allocated: Decimal,
    pub matched_rows: i32,
    pub unallocated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct Job {
    pub job_id: Uuid,
    pub dataset_id: i64,
    pub user_id: i64,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub kind: String,
    pub storage_key: String,
    pub status: String,
    pub total_chunks: i32,
    pub chunks_done: i32,
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, FromRow)]
pub struct JobChunk {
    pub job_id: Uuid,
    pub chunk_index: i32,
    pub user_id: i64,
    pub storage_key: String,
    pub status: String,
    pub error: Option<String>,
    pub attempts: i32,
}
