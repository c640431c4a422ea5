#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, Query, State};
    use axum::{Extension, Json};
    use bytes::Bytes;
    use rust_decimal::Decimal;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::config::{Config, PipelineMode};
    use crate::db::{self, DbPool};
    use crate::middleware::auth::Claims;
    use crate::queue::{Task, TaskQueue, TaskReceiver};
    use crate::state::AppState;
    use crate::storage::ObjectStorage;
    use crate::tenancy;

    const S1_CSV: &str = "date,product,revenue,cost,commission\n\
                          2024-01-01,P1,100,40,10\n\
                          2024-01-01,P2,200,80,20\n";

    async fn setup_test_db() -> Option<DbPool> {
        dotenvy::dotenv().ok();
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            eprintln!("DATABASE_URL not set; skipping integration test");
            return None;
        };
        let pool = db::init_pool(&database_url)
            .await
            .expect("Failed to create pool");
        db::init_database(&pool).await.expect("migrations failed");
        Some(pool)
    }

    fn test_config(mode: PipelineMode) -> Config {
        Config {
            database_url: String::new(),
            jwt_secret: "test-secret".into(),
            port: 0,
            storage: None,
            queue_workers: 1,
            queue_capacity: 64,
            batch_size: 5000,
            chunk_bytes: 64,
            pipeline_mode: mode,
            soft_timeout_s: 3600,
            hard_timeout_s: 3700,
            upload_temp_dir: None,
        }
    }

    fn test_state(pool: DbPool, mode: PipelineMode) -> (AppState, TaskReceiver) {
        let (queue, rx) = TaskQueue::new(64);
        let state = AppState {
            pool,
            storage: Some(ObjectStorage::memory()),
            queue,
            config: Arc::new(test_config(mode)),
        };
        (state, rx)
    }

    async fn create_user(pool: &DbPool) -> i64 {
        let email = format!("test-{}@marketdash.dev", Uuid::new_v4());
        sqlx::query_scalar("INSERT INTO users (email, password_hash) VALUES ($1, 'test-hash') RETURNING id")
            .bind(email)
            .fetch_one(pool)
            .await
            .expect("failed to create test user")
    }

    fn claims(user_id: i64) -> Claims {
        Claims {
            sub: format!("user-{}", user_id),
            user_id,
            exp: usize::MAX,
        }
    }

    /// Create dataset + job records and upload the CSV to the in-memory
    /// store, mirroring what POST /jobs and the client PUT do.
    async fn stage_job(state: &AppState, owner_id: i64, kind: &str, csv: &str) -> (Uuid, i64) {
        let job_id = Uuid::new_v4();
        let storage_key = format!("uploads/{}/report.csv", job_id);

        let mut tx = tenancy::begin(&state.pool, owner_id).await.unwrap();
        let dataset_id: i64 = sqlx::query_scalar(
            "INSERT INTO datasets (user_id, filename, type, status) VALUES ($1, 'report.csv', $2, 'pending') RETURNING id",
        )
        .bind(owner_id)
        .bind(kind)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO jobs (job_id, dataset_id, user_id, type, storage_key, status) VALUES ($1, $2, $3, $4, $5, 'running')",
        )
        .bind(job_id)
        .bind(dataset_id)
        .bind(owner_id)
        .bind(kind)
        .bind(&storage_key)
        .execute(tx.conn())
        .await
        .unwrap();
        tx.commit().await.unwrap();

        state
            .storage()
            .unwrap()
            .put(&storage_key, Bytes::from(csv.as_bytes().to_vec()))
            .await
            .unwrap();
        (job_id, dataset_id)
    }

    async fn run_job(state: &AppState, job_id: Uuid, owner_id: i64) {
        crate::ingest::worker::run_task(
            state,
            Task::ProcessJob { job_id, owner_id },
            CancellationToken::new(),
        )
        .await
        .expect("job task failed");
    }

    async fn kpi_totals(pool: &DbPool, owner_id: i64) -> (Decimal, Decimal, Decimal, Decimal, i64) {
        let mut tx = tenancy::begin(pool, owner_id).await.unwrap();
        let row: (Decimal, Decimal, Decimal, Decimal, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(revenue), 0), COALESCE(SUM(cost), 0),
                   COALESCE(SUM(commission), 0), COALESCE(SUM(profit), 0), COUNT(*)
            FROM transaction_rows WHERE user_id = $1
            "#,
        )
        .bind(owner_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        row
    }

    #[tokio::test]
    async fn test_ingest_happy_path_then_dedup() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        // S1: first upload
        let (job_id, dataset_id) = stage_job(&state, owner, "transaction", S1_CSV).await;
        run_job(&state, job_id, owner).await;

        let (revenue, cost, commission, profit, rows) = kpi_totals(&pool, owner).await;
        assert_eq!(revenue, Decimal::new(300, 0));
        assert_eq!(cost, Decimal::new(120, 0));
        assert_eq!(commission, Decimal::new(30, 0));
        assert_eq!(profit, Decimal::new(150, 0));
        assert_eq!(rows, 2);

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let (status, row_count): (String, i32) =
            sqlx::query_as("SELECT status, row_count FROM datasets WHERE id = $1")
                .bind(dataset_id)
                .fetch_one(tx.conn())
                .await
                .unwrap();
        let (job_status, total, done): (String, i32, i32) = sqlx::query_as(
            "SELECT status, total_chunks, chunks_done FROM jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(status, "completed");
        assert_eq!(row_count, 2);
        assert_eq!(job_status, "completed");
        assert_eq!(total, done);

        // S2: the same file again is a no-op on the row set
        let (job2, _) = stage_job(&state, owner, "transaction", S1_CSV).await;
        run_job(&state, job2, owner).await;
        let (revenue, _, _, _, rows) = kpi_totals(&pool, owner).await;
        assert_eq!(rows, 2);
        assert_eq!(revenue, Decimal::new(300, 0));
    }

    #[tokio::test]
    async fn test_tenancy_isolation() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let user_a = create_user(&pool).await;
        let user_b = create_user(&pool).await;

        let (job_id, dataset_id) = stage_job(&state, user_a, "transaction", S1_CSV).await;
        run_job(&state, job_id, user_a).await;

        // S3: B's session sees none of A's rows, and A's dataset is a 404
        let (_, _, _, _, rows_b) = kpi_totals(&pool, user_b).await;
        assert_eq!(rows_b, 0);

        let result = crate::commands::datasets::list_dataset_rows(
            State(state.clone()),
            Extension(claims(user_b)),
            Path(dataset_id),
            Query(crate::commands::datasets::Pagination {
                limit: None,
                offset: None,
            }),
        )
        .await;
        assert!(matches!(
            result.err(),
            Some(crate::error::MarketDashError::NotFound)
        ));

        // a session that never set the tenant variable sees zero rows
        let mut bare = pool.begin().await.unwrap();
        let visible: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transaction_rows")
            .fetch_one(&mut *bare)
            .await
            .unwrap();
        drop(bare);
        if visible != 0 {
            // superuser connections bypass row security; the policy can only
            // be observed from a non-superuser role
            eprintln!("connected role bypasses RLS; skipping unset-variable assertion");
        }
    }

    #[tokio::test]
    async fn test_empty_and_all_invalid_csv() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        // header-only file completes with zero rows
        let (job_id, _) =
            stage_job(&state, owner, "transaction", "date,product,revenue\n").await;
        run_job(&state, job_id, owner).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let (job_status, row_count): (String, i32) = sqlx::query_as(
            "SELECT j.status, d.row_count FROM jobs j JOIN datasets d ON d.id = j.dataset_id WHERE j.job_id = $1",
        )
        .bind(job_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(job_status, "completed");
        assert_eq!(row_count, 0);

        // every data row invalid: completed, zero rows, every rejection tallied
        let bad = "date,product,revenue\nnot-a-date,P1,10\n,P2,20\n";
        let (job_id, _) = stage_job(&state, owner, "transaction", bad).await;
        run_job(&state, job_id, owner).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let (job_status, meta): (String, serde_json::Value) =
            sqlx::query_as("SELECT status, meta FROM jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(tx.conn())
                .await
                .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(job_status, "completed");
        let errors = meta.get("errors").and_then(|e| e.as_array()).unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_ad_spend_allocation_proportional() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        let (job_id, dataset_id) = stage_job(&state, owner, "transaction", S1_CSV).await;
        run_job(&state, job_id, owner).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let ad_spend_id: i64 = sqlx::query_scalar(
            "INSERT INTO ad_spends (user_id, date, amount) VALUES ($1, '2024-01-01', 30) RETURNING id",
        )
        .bind(owner)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.commit().await.unwrap();

        let Json(response) = crate::commands::ad_spends::allocate_ad_spend(
            State(state.clone()),
            Extension(claims(owner)),
            Path(ad_spend_id),
            Json(crate::commands::ad_spends::AllocateRequest { dataset_id }),
        )
        .await
        .unwrap();
        assert!(!response.already_applied);
        assert_eq!(response.matched_rows, 2);

        // S4: 30 split 100:200 -> P1 cost 50, P2 cost 100, profits recomputed
        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let rows: Vec<(String, Decimal, Decimal)> = sqlx::query_as(
            "SELECT product, cost, profit FROM transaction_rows WHERE dataset_id = $1 ORDER BY product",
        )
        .bind(dataset_id)
        .fetch_all(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(rows[0].1, Decimal::new(500000, 4));
        assert_eq!(rows[0].2, Decimal::new(400000, 4));
        assert_eq!(rows[1].1, Decimal::new(1000000, 4));
        assert_eq!(rows[1].2, Decimal::new(800000, 4));

        // idempotent: the second run reports the prior allocation, no change
        let Json(second) = crate::commands::ad_spends::allocate_ad_spend(
            State(state.clone()),
            Extension(claims(owner)),
            Path(ad_spend_id),
            Json(crate::commands::ad_spends::AllocateRequest { dataset_id }),
        )
        .await
        .unwrap();
        assert!(second.already_applied);

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let total_cost: Decimal =
            sqlx::query_scalar("SELECT SUM(cost) FROM transaction_rows WHERE dataset_id = $1")
                .bind(dataset_id)
                .fetch_one(tx.conn())
                .await
                .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(total_cost, Decimal::new(1500000, 4));
    }

    #[tokio::test]
    async fn test_dashboard_filters_out_of_range() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        let (job_id, _) = stage_job(&state, owner, "transaction", S1_CSV).await;
        run_job(&state, job_id, owner).await;

        // S6: a window past the data returns zero KPIs and empty aggregations
        let filters = crate::commands::dashboard::DashboardFilters {
            start_date: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            end_date: Some(chrono::NaiveDate::from_ymd_opt(2024, 1, 3).unwrap()),
            ..Default::default()
        };
        let Json(response) = crate::commands::dashboard::get_dashboard(
            State(state.clone()),
            Extension(claims(owner)),
            Query(filters),
        )
        .await
        .unwrap();
        assert_eq!(response.kpis.total_revenue, Decimal::ZERO);
        assert_eq!(response.kpis.total_rows, 0);
        assert!(response.period_aggregations.is_empty());
        assert!(response.product_aggregations.is_empty());

        // and the unfiltered dashboard sees S1 with P2 ranked first
        let Json(response) = crate::commands::dashboard::get_dashboard(
            State(state.clone()),
            Extension(claims(owner)),
            Query(Default::default()),
        )
        .await
        .unwrap();
        assert_eq!(response.kpis.total_revenue, Decimal::new(300, 0));
        assert_eq!(response.period_aggregations.len(), 1);
        assert_eq!(response.product_aggregations[0].product, "P2");
    }

    #[tokio::test]
    async fn test_commit_job_conflict_on_double_commit() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        let (_, Json(created)) = crate::commands::jobs::create_job(
            State(state.clone()),
            Extension(claims(owner)),
            Json(crate::commands::jobs::CreateJobRequest {
                filename: "report.csv".into(),
                kind: "transaction".into(),
            }),
        )
        .await
        .unwrap();

        state
            .storage()
            .unwrap()
            .put(&created.storage_key, Bytes::from(S1_CSV.as_bytes().to_vec()))
            .await
            .unwrap();

        let first = crate::commands::jobs::commit_job(
            State(state.clone()),
            Extension(claims(owner)),
            Path(created.job_id),
        )
        .await;
        assert!(first.is_ok());

        let second = crate::commands::jobs::commit_job(
            State(state.clone()),
            Extension(claims(owner)),
            Path(created.job_id),
        )
        .await;
        assert!(matches!(
            second.err(),
            Some(crate::error::MarketDashError::Conflict(_))
        ));
    }

    async fn drain_chunk_tasks(state: &AppState, rx: &TaskReceiver) {
        // the splitter fans out from a detached task; give it a beat
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        loop {
            let task = { rx.lock().await.try_recv().ok() };
            let Some(task) = task else { break };
            let _ = crate::ingest::worker::run_task(state, task, CancellationToken::new()).await;
        }
    }

    #[tokio::test]
    async fn test_persisted_chunks_mode() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, rx) = test_state(pool.clone(), PipelineMode::PersistedChunks);
        let owner = create_user(&pool).await;

        // chunk_bytes=64 forces several slices out of six data rows
        let csv = "date,product,revenue,cost,commission\n\
                   2024-02-01,A1,10,1,1\n\
                   2024-02-01,A2,20,2,1\n\
                   2024-02-02,A3,30,3,1\n\
                   2024-02-02,A4,40,4,1\n\
                   2024-02-03,A5,50,5,1\n\
                   2024-02-03,A6,60,6,1\n";
        let (job_id, dataset_id) = stage_job(&state, owner, "transaction", csv).await;
        run_job(&state, job_id, owner).await;
        drain_chunk_tasks(&state, &rx).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let (status, total, done): (String, i32, i32) = sqlx::query_as(
            "SELECT status, total_chunks, chunks_done FROM jobs WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transaction_rows WHERE dataset_id = $1")
                .bind(dataset_id)
                .fetch_one(tx.conn())
                .await
                .unwrap();
        let pending_chunks: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM job_chunks WHERE job_id = $1 AND status <> 'ok'",
        )
        .bind(job_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(status, "completed");
        assert!(total > 1, "expected multiple chunks, got {}", total);
        assert_eq!(total, done);
        assert_eq!(rows, 6);
        assert_eq!(pending_chunks, 0);
    }

    #[tokio::test]
    async fn test_partial_failure_preserves_progress() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, rx) = test_state(pool.clone(), PipelineMode::PersistedChunks);
        let owner = create_user(&pool).await;

        let csv = "date,product,revenue,cost,commission\n\
                   2024-03-01,B1,10,1,1\n\
                   2024-03-01,B2,20,2,1\n\
                   2024-03-02,B3,30,3,1\n\
                   2024-03-02,B4,40,4,1\n";
        let (job_id, dataset_id) = stage_job(&state, owner, "transaction", csv).await;
        run_job(&state, job_id, owner).await;

        // S5: corrupt one chunk object before the chunk tasks run
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let chunk_keys: Vec<(i32, String)> = sqlx::query_as(
            "SELECT chunk_index, storage_key FROM job_chunks WHERE job_id = $1 ORDER BY chunk_index",
        )
        .bind(job_id)
        .fetch_all(tx.conn())
        .await
        .unwrap();
        tx.rollback().await.unwrap();
        assert!(chunk_keys.len() > 1);
        let (bad_index, bad_key) = chunk_keys.last().unwrap().clone();
        state
            .storage()
            .unwrap()
            .put(&bad_key, Bytes::from_static(b"\xff\xfegarbage without header"))
            .await
            .unwrap();

        drain_chunk_tasks(&state, &rx).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let status: String = sqlx::query_scalar("SELECT status FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_one(tx.conn())
            .await
            .unwrap();
        let failed: Vec<(i32, Option<String>)> = sqlx::query_as(
            "SELECT chunk_index, error FROM job_chunks WHERE job_id = $1 AND status = 'failed'",
        )
        .bind(job_id)
        .fetch_all(tx.conn())
        .await
        .unwrap();
        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transaction_rows WHERE dataset_id = $1")
                .bind(dataset_id)
                .fetch_one(tx.conn())
                .await
                .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(status, "failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, bad_index);
        assert!(failed[0].1.is_some());
        assert!(rows > 0, "rows from healthy chunks must remain visible");
    }

    #[tokio::test]
    async fn test_click_ingest_counts_events() {
        let Some(pool) = setup_test_db().await else { return };
        let (state, _rx) = test_state(pool.clone(), PipelineMode::InMemory);
        let owner = create_user(&pool).await;

        let csv = "date,channel,clicks,sub_id\n\
                   2024-01-01,instagram,5,camp1\n\
                   2024-01-01,tiktok,3,camp1\n\
                   2024-01-02,instagram,2,camp2\n";
        let (job_id, dataset_id) = stage_job(&state, owner, "click", csv).await;
        run_job(&state, job_id, owner).await;

        let mut tx = tenancy::begin(&pool, owner).await.unwrap();
        let (rows, clicks): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(clicks), 0) FROM click_rows WHERE dataset_id = $1",
        )
        .bind(dataset_id)
        .fetch_one(tx.conn())
        .await
        .unwrap();
        let row_count: i32 = sqlx::query_scalar("SELECT row_count FROM datasets WHERE id = $1")
            .bind(dataset_id)
            .fetch_one(tx.conn())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(rows, 3);
        assert_eq!(clicks, 10);
        // click datasets report total click events
        assert_eq!(row_count, 10);
    }
}
