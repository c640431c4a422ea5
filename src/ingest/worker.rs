use std::collections::HashSet;
use std::time::{Duration, Instant};

use futures::StreamExt;
use rand::Rng;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineMode;
use crate::db::{chunk_status, dataset_status, job_status, Job};
use crate::error::{MarketDashError, MarketDashResult};
use crate::ingest::chunker::split_csv;
use crate::ingest::encoding::decode_bytes;
use crate::ingest::normalizer::{
    check_schema, normalize_row, sniff_delimiter, ColumnMap, NormalizedClick,
    NormalizedRow, NormalizedTransaction, RowKind,
};
use crate::queue::Task;
use crate::state::AppState;
use crate::tenancy::{self, TenantTx};

const MAX_ATTEMPTS: u32 = 3;

/// Entry point for the worker pool: dispatch, retry transient failures with
/// backoff, and convert exhaustion or permanent failures into a failed job.
pub async fn run_task(
    state: &AppState,
    task: Task,
    cancel: CancellationToken,
) -> MarketDashResult<()> {
    let hard_limit = Duration::from_secs(state.config.hard_timeout_s);

    let mut attempt = 0;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(hard_limit, dispatch(state, &task, &cancel)).await;

        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => MarketDashError::Internal("hard time limit exceeded".into()),
        };

        let retryable = err.is_transient() && attempt < MAX_ATTEMPTS && !cancel.is_cancelled();
        if !retryable {
            record_task_failure(state, &task, &err).await;
            return Err(err);
        }

        let delay = backoff_delay(attempt);
        tracing::warn!(job_id = %task.job_id(), attempt, "transient failure, retrying in {:?}: {}", delay, err);
        tokio::select! {
            _ = cancel.cancelled() => {
                record_task_failure(state, &task, &err).await;
                return Err(err);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Exponential backoff with jitter so parallel retries spread out.
fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1 << attempt.min(6));
    base + Duration::from_millis(rand::thread_rng().gen_range(0..500))
}

async fn dispatch(state: &AppState, task: &Task, cancel: &CancellationToken) -> MarketDashResult<()> {
    match *task {
        Task::ProcessJob { job_id, owner_id } => process_job(state, job_id, owner_id, cancel).await,
        Task::ProcessChunk {
            job_id,
            owner_id,
            chunk_index,
        } => process_chunk(state, job_id, owner_id, chunk_index, cancel).await,
    }
}

async fn record_task_failure(state: &AppState, task: &Task, err: &MarketDashError) {
    let result = match *task {
        Task::ProcessJob { job_id, owner_id } => {
            fail_job(state, job_id, owner_id, &err.to_string()).await
        }
        Task::ProcessChunk {
            job_id,
            owner_id,
            chunk_index,
        } => fail_chunk(state, job_id, owner_id, chunk_index, &err.to_string()).await,
    };
    if let Err(e) = result {
        tracing::error!(job_id = %task.job_id(), "failed to record task failure: {}", e);
    }
}

async fn load_job(tx: &mut TenantTx, job_id: Uuid) -> MarketDashResult<Option<Job>> {
    Ok(sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
        .bind(job_id)
        .fetch_optional(tx.conn())
        .await?)
}

/// Fetch the whole object, spooling to the configured temp dir when one is
/// set so large uploads do not sit in memory during the download.
async fn fetch_object(
    state: &AppState,
    key: &str,
    cancel: &CancellationToken,
) -> MarketDashResult<Vec<u8>> {
    let storage = state.storage()?;
    let mut stream = storage.stream_get(key).await?;

    if let Some(dir) = &state.config.upload_temp_dir {
        let path = dir.join(format!("md-{}.part", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path).await?;
        let copy = async {
            use tokio::io::AsyncWriteExt;
            while let Some(part) = stream.next().await {
                file.write_all(&part?).await?;
            }
            file.flush().await?;
            Ok::<_, MarketDashError>(())
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(MarketDashError::Internal("cancelled".into())),
            r = copy => r,
        };
        let bytes = match result {
            Ok(()) => tokio::fs::read(&path).await.map_err(MarketDashError::from),
            Err(e) => Err(e),
        };
        let _ = tokio::fs::remove_file(&path).await;
        return bytes;
    }

    let mut buf = Vec::new();
    loop {
        let part = tokio::select! {
            _ = cancel.cancelled() => return Err(MarketDashError::Internal("cancelled".into())),
            part = stream.next() => part,
        };
        match part {
            Some(part) => buf.extend_from_slice(&part?),
            None => break,
        }
    }
    Ok(buf)
}

async fn process_job(
    state: &AppState,
    job_id: Uuid,
    owner_id: i64,
    cancel: &CancellationToken,
) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, owner_id).await?;
    let Some(job) = load_job(&mut tx, job_id).await? else {
        tracing::warn!(%job_id, "job not found, dropping task");
        return Ok(());
    };
    if job.status == job_status::COMPLETED || job.status == job_status::FAILED {
        return Ok(());
    }
    let kind = RowKind::parse(&job.kind)
        .ok_or_else(|| MarketDashError::Internal(format!("unknown job type '{}'", job.kind)))?;

    // A retried job restarts its lazy chunk counters; fingerprints make the
    // replayed inserts no-ops.
    sqlx::query(
        "UPDATE jobs SET total_chunks = 0, chunks_done = 0, meta = meta - 'errors' WHERE job_id = $1",
    )
    .bind(job_id)
    .execute(tx.conn())
    .await?;
    sqlx::query("UPDATE datasets SET status = $2 WHERE id = $1")
        .bind(job.dataset_id)
        .bind(dataset_status::PROCESSING)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;

    let content = fetch_object(state, &job.storage_key, cancel).await?;

    match state.config.pipeline_mode {
        PipelineMode::InMemory => {
            ingest_in_memory(state, &job, kind, &content, cancel).await
        }
        PipelineMode::PersistedChunks => split_and_enqueue(state, &job, &content).await,
    }
}

/// Default path: one pass over the file, batches committed as they fill.
async fn ingest_in_memory(
    state: &AppState,
    job: &Job,
    kind: RowKind,
    content: &[u8],
    cancel: &CancellationToken,
) -> MarketDashResult<()> {
    let soft_deadline = Instant::now() + Duration::from_secs(state.config.soft_timeout_s);
    let text = decode_bytes(content);

    let mut parsed = match parse_records(&text, kind, job.user_id) {
        Ok(parsed) => parsed,
        Err(reason) => {
            // Unparseable header is permanent: no batch can ever succeed.
            fail_job(state, job.job_id, job.user_id, &reason).await?;
            return Ok(());
        }
    };

    let batch_size = state.config.batch_size.max(1);
    let mut timed_out = false;

    while !parsed.rows.is_empty() {
        let batch: Vec<NormalizedRow> = parsed
            .rows
            .drain(..batch_size.min(parsed.rows.len()))
            .collect();
        commit_batch(state, job, &batch).await?;

        // a limit hit after the final batch is not a failure
        if parsed.rows.is_empty() {
            break;
        }
        if cancel.is_cancelled() {
            timed_out = true;
            fail_job(state, job.job_id, job.user_id, "worker shutdown").await?;
            break;
        }
        if Instant::now() >= soft_deadline {
            timed_out = true;
            fail_job(state, job.job_id, job.user_id, "timeout").await?;
            break;
        }
    }

    if !timed_out {
        finalize_job(state, job, &parsed.errors).await?;
    }
    Ok(())
}

/// Large-file path: persist header-bearing slices as their own objects and
/// fan out one task per slice.
async fn split_and_enqueue(state: &AppState, job: &Job, content: &[u8]) -> MarketDashResult<()> {
    let storage = state.storage()?.clone();
    let slices = split_csv(content, state.config.chunk_bytes);

    let mut tx = tenancy::begin(&state.pool, job.user_id).await?;
    for (index, slice) in slices.iter().enumerate() {
        let chunk_key = format!("jobs/{}/chunks/{}.csv", job.job_id, index);
        storage
            .put(&chunk_key, bytes::Bytes::from(slice.clone()))
            .await?;
        sqlx::query(
            r#"
            INSERT INTO job_chunks (job_id, chunk_index, user_id, storage_key, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (job_id, chunk_index) DO NOTHING
            "#,
        )
        .bind(job.job_id)
        .bind(index as i32)
        .bind(job.user_id)
        .bind(&chunk_key)
        .bind(chunk_status::QUEUED)
        .execute(tx.conn())
        .await?;
    }
    sqlx::query("UPDATE jobs SET total_chunks = $2 WHERE job_id = $1")
        .bind(job.job_id)
        .bind(slices.len() as i32)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;

    if slices.is_empty() {
        finalize_job(state, job, &[]).await?;
        return Ok(());
    }

    // Fan out from a detached task: awaiting queue capacity inside this
    // worker could deadlock it against its own backlog.
    let queue = state.queue.clone();
    let job_id = job.job_id;
    let owner_id = job.user_id;
    let count = slices.len();
    tokio::spawn(async move {
        for chunk_index in 0..count as i32 {
            let task = Task::ProcessChunk {
                job_id,
                owner_id,
                chunk_index,
            };
            if let Err(e) = queue.enqueue_wait(task).await {
                tracing::error!(%job_id, chunk_index, "chunk enqueue failed: {}", e);
                break;
            }
        }
    });
    Ok(())
}

async fn process_chunk(
    state: &AppState,
    job_id: Uuid,
    owner_id: i64,
    chunk_index: i32,
    cancel: &CancellationToken,
) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, owner_id).await?;
    let Some(job) = load_job(&mut tx, job_id).await? else {
        tracing::warn!(%job_id, "job gone, dropping chunk task");
        return Ok(());
    };
    let chunk: Option<(String, String)> = sqlx::query_as(
        "SELECT storage_key, status FROM job_chunks WHERE job_id = $1 AND chunk_index = $2",
    )
    .bind(job_id)
    .bind(chunk_index)
    .fetch_optional(tx.conn())
    .await?;
    let Some((chunk_key, status)) = chunk else {
        tracing::warn!(%job_id, chunk_index, "chunk record missing");
        return Ok(());
    };
    if status == chunk_status::OK {
        return Ok(());
    }
    sqlx::query(
        "UPDATE job_chunks SET attempts = attempts + 1 WHERE job_id = $1 AND chunk_index = $2",
    )
    .bind(job_id)
    .bind(chunk_index)
    .execute(tx.conn())
    .await?;
    tx.commit().await?;

    let kind = RowKind::parse(&job.kind)
        .ok_or_else(|| MarketDashError::Internal(format!("unknown job type '{}'", job.kind)))?;

    let content = fetch_object(state, &chunk_key, cancel).await?;
    let text = decode_bytes(&content);

    let parsed = match parse_records(&text, kind, owner_id) {
        Ok(parsed) => parsed,
        Err(reason) => {
            fail_chunk(state, job_id, owner_id, chunk_index, &reason).await?;
            return Ok(());
        }
    };

    // One transaction per chunk: rows, chunk status and progress move
    // together, so a redelivered chunk can never double-count.
    let mut tx = tenancy::begin(&state.pool, owner_id).await?;
    insert_rows(&mut tx, job.dataset_id, &parsed.rows).await?;
    sqlx::query(
        "UPDATE job_chunks SET status = $3, error = NULL WHERE job_id = $1 AND chunk_index = $2",
    )
    .bind(job_id)
    .bind(chunk_index)
    .bind(chunk_status::OK)
    .execute(tx.conn())
    .await?;
    let done: i32 = sqlx::query_scalar(
        "UPDATE jobs SET chunks_done = chunks_done + 1 WHERE job_id = $1 RETURNING chunks_done",
    )
    .bind(job_id)
    .fetch_one(tx.conn())
    .await?;
    append_row_errors(&mut tx, job_id, Some(chunk_index), &parsed.errors).await?;
    tx.commit().await?;

    if done >= job.total_chunks {
        complete_if_all_ok(state, &job).await?;
    }
    Ok(())
}

/// Parsed chunk: surviving rows (deduplicated within the chunk) plus
/// per-row rejections. A bad header is a hard error.
#[derive(Debug)]
struct ParsedRecords {
    rows: Vec<NormalizedRow>,
    errors: Vec<(usize, String)>,
}

fn parse_records(text: &str, kind: RowKind, owner_id: i64) -> Result<ParsedRecords, String> {
    let first_line = text.lines().next().unwrap_or_default();
    if first_line.trim().is_empty() {
        return Err("empty file: missing header row".into());
    }
    let delimiter = sniff_delimiter(first_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| format!("unparseable header: {}", e))?
        .iter()
        .map(str::to_string)
        .collect();
    let map = ColumnMap::detect(&headers);
    check_schema(kind, &map)?;

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for (index, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                errors.push((index, format!("malformed line: {}", e)));
                continue;
            }
        };
        if record.iter().all(|f| f.trim().is_empty()) {
            continue;
        }
        match normalize_row(kind, &map, &record, owner_id) {
            Ok(row) => {
                let fp = match &row {
                    NormalizedRow::Transaction(t) => &t.fingerprint,
                    NormalizedRow::Click(c) => &c.fingerprint,
                };
                if seen.insert(fp.clone()) {
                    rows.push(row);
                }
            }
            Err(reason) => errors.push((index, reason)),
        }
    }
    Ok(ParsedRecords { rows, errors })
}

/// Commit one batch atomically and advance the lazy chunk counters.
async fn commit_batch(state: &AppState, job: &Job, batch: &[NormalizedRow]) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, job.user_id).await?;
    insert_rows(&mut tx, job.dataset_id, batch).await?;
    sqlx::query(
        "UPDATE jobs SET total_chunks = total_chunks + 1, chunks_done = chunks_done + 1 WHERE job_id = $1",
    )
    .bind(job.job_id)
    .execute(tx.conn())
    .await?;
    tx.commit().await?;
    Ok(())
}

async fn insert_rows(
    tx: &mut TenantTx,
    dataset_id: i64,
    rows: &[NormalizedRow],
) -> MarketDashResult<u64> {
    let mut transactions: Vec<&NormalizedTransaction> = Vec::new();
    let mut clicks: Vec<&NormalizedClick> = Vec::new();
    for row in rows {
        match row {
            NormalizedRow::Transaction(t) => transactions.push(t),
            NormalizedRow::Click(c) => clicks.push(c),
        }
    }

    let mut inserted = 0;
    if !transactions.is_empty() {
        inserted += insert_transaction_rows(tx, dataset_id, &transactions).await?;
    }
    if !clicks.is_empty() {
        inserted += insert_click_rows(tx, dataset_id, &clicks).await?;
    }
    Ok(inserted)
}

/// Native bulk insert: one statement over unnested arrays, duplicates
/// silently discarded by the fingerprint index.
async fn insert_transaction_rows(
    tx: &mut TenantTx,
    dataset_id: i64,
    rows: &[&NormalizedTransaction],
) -> MarketDashResult<u64> {
    let owner_id = tx.owner_id();
    let dates: Vec<_> = rows.iter().map(|r| r.date).collect();
    let times: Vec<_> = rows.iter().map(|r| r.time).collect();
    let platforms: Vec<_> = rows.iter().map(|r| r.platform.clone()).collect();
    let categories: Vec<_> = rows.iter().map(|r| r.category.clone()).collect();
    let products: Vec<_> = rows.iter().map(|r| r.product.clone()).collect();
    let statuses: Vec<_> = rows.iter().map(|r| r.status.clone()).collect();
    let sub_ids: Vec<_> = rows.iter().map(|r| r.sub_id.clone()).collect();
    let order_ids: Vec<_> = rows.iter().map(|r| r.order_id.clone()).collect();
    let product_ids: Vec<_> = rows.iter().map(|r| r.product_id.clone()).collect();
    let revenues: Vec<_> = rows.iter().map(|r| r.revenue).collect();
    let commissions: Vec<_> = rows.iter().map(|r| r.commission).collect();
    let costs: Vec<_> = rows.iter().map(|r| r.cost).collect();
    let profits: Vec<_> = rows.iter().map(|r| r.profit).collect();
    let quantities: Vec<_> = rows.iter().map(|r| r.quantity).collect();
    let fingerprints: Vec<_> = rows.iter().map(|r| r.fingerprint.clone()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO transaction_rows
            (dataset_id, user_id, date, time, platform, category, product, status,
             sub_id, order_id, product_id, revenue, commission, cost, profit,
             quantity, fingerprint)
        SELECT $1, $2, t.*
        FROM unnest(
            $3::date[], $4::time[], $5::text[], $6::text[], $7::text[], $8::text[],
            $9::text[], $10::text[], $11::text[], $12::numeric[], $13::numeric[],
            $14::numeric[], $15::numeric[], $16::int[], $17::text[]
        ) AS t(date, "time", platform, category, product, status, sub_id, order_id,
               product_id, revenue, commission, cost, profit, quantity, fingerprint)
        ON CONFLICT (fingerprint) DO NOTHING
        "#,
    )
    .bind(dataset_id)
    .bind(owner_id)
    .bind(&dates)
    .bind(&times)
    .bind(&platforms)
    .bind(&categories)
    .bind(&products)
    .bind(&statuses)
    .bind(&sub_ids)
    .bind(&order_ids)
    .bind(&product_ids)
    .bind(&revenues)
    .bind(&commissions)
    .bind(&costs)
    .bind(&profits)
    .bind(&quantities)
    .bind(&fingerprints)
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected())
}

async fn insert_click_rows(
    tx: &mut TenantTx,
    dataset_id: i64,
    rows: &[&NormalizedClick],
) -> MarketDashResult<u64> {
    let owner_id = tx.owner_id();
    let dates: Vec<_> = rows.iter().map(|r| r.date).collect();
    let times: Vec<_> = rows.iter().map(|r| r.time).collect();
    let channels: Vec<_> = rows.iter().map(|r| r.channel.clone()).collect();
    let sub_ids: Vec<_> = rows.iter().map(|r| r.sub_id.clone()).collect();
    let clicks: Vec<_> = rows.iter().map(|r| r.clicks).collect();
    let fingerprints: Vec<_> = rows.iter().map(|r| r.fingerprint.clone()).collect();

    let result = sqlx::query(
        r#"
        INSERT INTO click_rows
            (dataset_id, user_id, date, time, channel, sub_id, clicks, fingerprint)
        SELECT $1, $2, t.*
        FROM unnest(
            $3::date[], $4::time[], $5::text[], $6::text[], $7::int[], $8::text[]
        ) AS t(date, "time", channel, sub_id, clicks, fingerprint)
        ON CONFLICT (fingerprint) DO NOTHING
        "#,
    )
    .bind(dataset_id)
    .bind(owner_id)
    .bind(&dates)
    .bind(&times)
    .bind(&channels)
    .bind(&sub_ids)
    .bind(&clicks)
    .bind(&fingerprints)
    .execute(tx.conn())
    .await?;
    Ok(result.rows_affected())
}

async fn append_row_errors(
    tx: &mut TenantTx,
    job_id: Uuid,
    chunk_index: Option<i32>,
    errors: &[(usize, String)],
) -> MarketDashResult<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let entries: Vec<serde_json::Value> = errors
        .iter()
        .map(|(row, reason)| match chunk_index {
            Some(chunk) => json!({"chunk_index": chunk, "row": row, "reason": reason}),
            None => json!({"row": row, "reason": reason}),
        })
        .collect();
    sqlx::query(
        r#"
        UPDATE jobs
        SET meta = jsonb_set(meta, '{errors}',
            COALESCE(meta->'errors', '[]'::jsonb) || $2::jsonb)
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(serde_json::Value::Array(entries))
    .execute(tx.conn())
    .await?;
    Ok(())
}

/// Close out an in-memory job: record rejections, refresh the dataset
/// row count, and flip both records to completed.
async fn finalize_job(state: &AppState, job: &Job, errors: &[(usize, String)]) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, job.user_id).await?;
    append_row_errors(&mut tx, job.job_id, None, errors).await?;
    let row_count = dataset_row_count(&mut tx, job).await?;
    sqlx::query("UPDATE datasets SET status = $2, row_count = $3 WHERE id = $1")
        .bind(job.dataset_id)
        .bind(dataset_status::COMPLETED)
        .bind(row_count)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE jobs SET status = $2 WHERE job_id = $1")
        .bind(job.job_id)
        .bind(job_status::COMPLETED)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;
    tracing::info!(job_id = %job.job_id, row_count, rejected = errors.len(), "job completed");
    Ok(())
}

/// Transaction datasets count rows; click datasets count total click events.
async fn dataset_row_count(tx: &mut TenantTx, job: &Job) -> MarketDashResult<i32> {
    let count: i64 = if job.kind == "transaction" {
        sqlx::query_scalar("SELECT COUNT(*) FROM transaction_rows WHERE dataset_id = $1")
            .bind(job.dataset_id)
            .fetch_one(tx.conn())
            .await?
    } else {
        sqlx::query_scalar(
            "SELECT COALESCE(SUM(clicks), 0) FROM click_rows WHERE dataset_id = $1",
        )
        .bind(job.dataset_id)
        .fetch_one(tx.conn())
        .await?
    };
    Ok(count as i32)
}

/// Persisted-chunks completion check, racing with sibling chunk tasks; the
/// first one to observe all chunks ok finalizes.
async fn complete_if_all_ok(state: &AppState, job: &Job) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, job.user_id).await?;
    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM job_chunks WHERE job_id = $1 AND status <> $2",
    )
    .bind(job.job_id)
    .bind(chunk_status::OK)
    .fetch_one(tx.conn())
    .await?;
    if pending > 0 {
        return Ok(());
    }
    let row_count = dataset_row_count(&mut tx, job).await?;
    sqlx::query("UPDATE datasets SET status = $2, row_count = $3 WHERE id = $1")
        .bind(job.dataset_id)
        .bind(dataset_status::COMPLETED)
        .bind(row_count)
        .execute(tx.conn())
        .await?;
    sqlx::query("UPDATE jobs SET status = $2 WHERE job_id = $1 AND status = $3")
        .bind(job.job_id)
        .bind(job_status::COMPLETED)
        .bind(job_status::RUNNING)
        .execute(tx.conn())
        .await?;
    tx.commit().await?;
    tracing::info!(job_id = %job.job_id, row_count, "job completed");
    Ok(())
}

async fn fail_job(
    state: &AppState,
    job_id: Uuid,
    owner_id: i64,
    reason: &str,
) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, owner_id).await?;
    sqlx::query(
        r#"
        UPDATE jobs
        SET status = $2, meta = jsonb_set(meta, '{failure}', to_jsonb($3::text))
        WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .bind(job_status::FAILED)
    .bind(reason)
    .execute(tx.conn())
    .await?;
    sqlx::query(
        "UPDATE datasets SET status = $2 WHERE id = (SELECT dataset_id FROM jobs WHERE job_id = $1)",
    )
    .bind(job_id)
    .bind(dataset_status::FAILED)
    .execute(tx.conn())
    .await?;
    tx.commit().await?;
    tracing::warn!(%job_id, reason, "job failed");
    Ok(())
}

async fn fail_chunk(
    state: &AppState,
    job_id: Uuid,
    owner_id: i64,
    chunk_index: i32,
    reason: &str,
) -> MarketDashResult<()> {
    let mut tx = tenancy::begin(&state.pool, owner_id).await?;
    sqlx::query(
        "UPDATE job_chunks SET status = $3, error = $4 WHERE job_id = $1 AND chunk_index = $2",
    )
    .bind(job_id)
    .bind(chunk_index)
    .bind(chunk_status::FAILED)
    .bind(reason)
    .execute(tx.conn())
    .await?;
    tx.commit().await?;
    // a permanently failed chunk fails the whole job, progress preserved
    fail_job(state, job_id, owner_id, &format!("chunk {} failed: {}", chunk_index, reason)).await
}
