use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod db;
mod error;
mod ingest;
mod middleware;
mod queue;
mod routes;
mod state;
mod storage;
mod tenancy;

mod integration_tests;

use config::Config;
use state::AppState;

async fn log_requests(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    tracing::info!(">>> Request: {} {}", method, uri);
    let res = next.run(req).await;
    tracing::info!("<<< Response: {} for {} {}", res.status(), method, uri);
    res
}

#[tokio::main]
async fn main() {
    load_env();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,sqlx=error,sqlx::postgres::notice=error".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_ansi(true))
        .init();

    let config = Arc::new(Config::from_env());

    println!("--------------------------------------------------");
    println!("  MARKETDASH BACKEND                              ");
    println!("  Status: INITIALIZING...                         ");
    println!("  Listen: http://0.0.0.0:{}                       ", config.port);
    println!("--------------------------------------------------");

    tracing::info!("Starting MarketDash core services...");

    let pool = match db::init_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to create pool: {}", e);
            return;
        }
    };

    if let Err(e) = db::init_database(&pool).await {
        tracing::error!("Failed to run migrations: {}", e);
        return;
    }

    let storage = match &config.storage {
        Some(cfg) => match storage::ObjectStorage::from_config(cfg) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::error!("Storage init failed, jobs pipeline disabled: {}", e);
                None
            }
        },
        None => None,
    };

    let (task_queue, task_rx) = queue::TaskQueue::new(config.queue_capacity);
    let cancel = CancellationToken::new();

    let app_state = AppState {
        pool: pool.clone(),
        storage,
        queue: task_queue,
        config: config.clone(),
    };

    let worker_handles = queue::start_workers(
        config.queue_workers,
        app_state.clone(),
        task_rx,
        cancel.clone(),
    );

    let app = routes::create_router()
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth::auth_middleware,
        ))
        .layer(axum::middleware::from_fn(log_requests))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(app_state);

    let addr_str = format!("0.0.0.0:{}", config.port);
    let addr = addr_str.parse::<SocketAddr>().expect("Invalid address");

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.expect("bind failed");

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            shutdown_cancel.cancel();
        })
        .await
        .expect("server error");

    cancel.cancel();
    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("MarketDash stopped");
}

fn load_env() {
    // Load .env from the executable's directory first (service deployments
    // ship it next to the binary), then fall back to CWD-based loading.
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let env_path = exe_dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
            } else {
                dotenv().ok();
            }
        } else {
            dotenv().ok();
        }
    } else {
        dotenv().ok();
    }
}
