use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::{dataset_status, job_status, Job, JobChunk};
use crate::error::{MarketDashError, MarketDashResult};
use crate::ingest::normalizer::RowKind;
use crate::middleware::auth::Claims;
use crate::queue::Task;
use crate::state::AppState;
use crate::tenancy;

const UPLOAD_TTL_SECS: u64 = 3600;

#[derive(Deserialize)]
pub struct CreateJobRequest {
    pub filename: String,
    #[serde(rename = "type", default = "default_job_type")]
    pub kind: String,
}

fn default_job_type() -> String {
    "transaction".to_string()
}

#[derive(Serialize)]
pub struct CreateJobResponse {
    pub job_id: Uuid,
    pub dataset_id: i64,
    pub upload_url: String,
    pub storage_key: String,
    pub expires_in: u64,
}

/// Create Dataset (pending) + Job (queued) and hand back a presigned PUT for
/// `uploads/{job_id}/{filename}`.
pub async fn create_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(payload): Json<CreateJobRequest>,
) -> MarketDashResult<(StatusCode, Json<CreateJobResponse>)> {
    let storage = state.storage()?.clone();

    if state.queue.is_saturated() {
        return Err(MarketDashError::Unavailable(
            "Processing queue is saturated, retry later".into(),
        ));
    }
    if payload.filename.is_empty() || !payload.filename.ends_with(".csv") {
        return Err(MarketDashError::Validation(
            "filename must be a non-empty CSV filename".into(),
        ));
    }
    if RowKind::parse(&payload.kind).is_none() {
        return Err(MarketDashError::Validation(
            "type must be 'transaction' or 'click'".into(),
        ));
    }

    let job_id = Uuid::new_v4();
    let storage_key = format!("uploads/{}/{}", job_id, payload.filename);

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let dataset_id: i64 = sqlx::query_scalar(
        "INSERT INTO datasets (user_id, filename, type, status) VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(claims.user_id)
    .bind(&payload.filename)
    .bind(&payload.kind)
    .bind(dataset_status::PENDING)
    .fetch_one(tx.conn())
    .await?;
    sqlx::query(
        r#"
        INSERT INTO jobs (job_id, dataset_id, user_id, type, storage_key, status)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(job_id)
    .bind(dataset_id)
    .bind(claims.user_id)
    .bind(&payload.kind)
    .bind(&storage_key)
    .bind(job_status::QUEUED)
    .execute(tx.conn())
    .await?;
    tx.commit().await?;

    let upload_url = storage
        .presign_put(
            &storage_key,
            "text/csv",
            std::time::Duration::from_secs(UPLOAD_TTL_SECS),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id,
            dataset_id,
            upload_url,
            storage_key,
            expires_in: UPLOAD_TTL_SECS,
        }),
    ))
}

/// Enqueue processing for an uploaded file: queued -> running. A second
/// commit of the same job conflicts.
pub async fn commit_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<Uuid>,
) -> MarketDashResult<(StatusCode, Json<serde_json::Value>)> {
    let storage = state.storage()?.clone();

    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let job: Option<Job> = sqlx::query_as("SELECT * FROM jobs WHERE job_id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(tx.conn())
        .await?;
    let job = job.ok_or(MarketDashError::NotFound)?;

    if job.status != job_status::QUEUED {
        return Err(MarketDashError::Conflict(format!(
            "Job already committed (status: {})",
            job.status
        )));
    }
    if !storage.exists(&job.storage_key).await? {
        return Err(MarketDashError::Validation(
            "File not found in storage. Upload to the presigned URL before committing.".into(),
        ));
    }

    sqlx::query("UPDATE jobs SET status = $2 WHERE job_id = $1")
        .bind(job_id)
        .bind(job_status::RUNNING)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;

    if let Err(e) = state.queue.try_enqueue(Task::ProcessJob {
        job_id,
        owner_id: claims.user_id,
    }) {
        // back out so a later commit can retry once the queue drains
        let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
        sqlx::query("UPDATE jobs SET status = $2 WHERE job_id = $1")
            .bind(job_id)
            .bind(job_status::QUEUED)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;
        return Err(e);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "status": job_status::RUNNING,
            "message": "File uploaded, processing scheduled.",
        })),
    ))
}

#[derive(Serialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub dataset_id: i64,
    pub status: String,
    pub total_chunks: i32,
    pub chunks_done: i32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub errors: Vec<serde_json::Value>,
}

fn job_errors(job: &Job, failed_chunks: Vec<JobChunk>) -> Vec<serde_json::Value> {
    let mut errors: Vec<serde_json::Value> = Vec::new();
    if let Some(failure) = job.meta.get("failure").and_then(|v| v.as_str()) {
        errors.push(json!({"reason": failure}));
    }
    for chunk in failed_chunks {
        if let Some(error) = chunk.error {
            errors.push(json!({"chunk_index": chunk.chunk_index, "error": error}));
        }
    }
    if let Some(rows) = job.meta.get("errors").and_then(|v| v.as_array()) {
        errors.extend(rows.iter().cloned());
    }
    errors
}

pub async fn get_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<Uuid>,
) -> MarketDashResult<Json<JobStatusResponse>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let job: Option<Job> = sqlx::query_as("SELECT * FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(tx.conn())
        .await?;
    let job = job.ok_or(MarketDashError::NotFound)?;

    let failed_chunks: Vec<JobChunk> = sqlx::query_as(
        "SELECT * FROM job_chunks WHERE job_id = $1 AND status = 'failed' ORDER BY chunk_index",
    )
    .bind(job_id)
    .fetch_all(tx.conn())
    .await?;
    tx.rollback().await?;

    let errors = job_errors(&job, failed_chunks);
    Ok(Json(JobStatusResponse {
        job_id: job.job_id,
        dataset_id: job.dataset_id,
        status: job.status,
        total_chunks: job.total_chunks,
        chunks_done: job.chunks_done,
        created_at: job.created_at,
        errors,
    }))
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> MarketDashResult<Json<Vec<JobStatusResponse>>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let jobs: Vec<Job> = sqlx::query_as("SELECT * FROM jobs ORDER BY created_at DESC LIMIT 50")
        .fetch_all(tx.conn())
        .await?;
    tx.rollback().await?;

    Ok(Json(
        jobs.into_iter()
            .map(|job| {
                let errors = job_errors(&job, Vec::new());
                JobStatusResponse {
                    job_id: job.job_id,
                    dataset_id: job.dataset_id,
                    status: job.status,
                    total_chunks: job.total_chunks,
                    chunks_done: job.chunks_done,
                    created_at: job.created_at,
                    errors,
                }
            })
            .collect(),
    ))
}

/// Drop the job record and its uploaded objects. Rows already committed stay
/// with their dataset; deleting the dataset is the way to drop those.
pub async fn delete_job(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<Uuid>,
) -> MarketDashResult<Json<serde_json::Value>> {
    let mut tx = tenancy::begin(&state.pool, claims.user_id).await?;
    let job: Option<Job> = sqlx::query_as("SELECT * FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(tx.conn())
        .await?;
    let job = job.ok_or(MarketDashError::NotFound)?;

    let chunk_keys: Vec<(String,)> =
        sqlx::query_as("SELECT storage_key FROM job_chunks WHERE job_id = $1")
            .bind(job_id)
            .fetch_all(tx.conn())
            .await?;
    sqlx::query("DELETE FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;

    if let Ok(storage) = state.storage() {
        let _ = storage.delete(&job.storage_key).await;
        for (key,) in chunk_keys {
            let _ = storage.delete(&key).await;
        }
    }

    Ok(Json(json!({"deleted": job_id})))
}
