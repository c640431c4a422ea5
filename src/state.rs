use std::sync::Arc;

use crate::config::Config;
use crate::db::DbPool;
use crate::queue::TaskQueue;
use crate::storage::ObjectStorage;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub storage: Option<ObjectStorage>,
    pub queue: TaskQueue,
    pub config: Arc<Config>,
}

impl axum::extract::FromRef<AppState> for DbPool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl AppState {
    /// Storage handle or the 503 the jobs endpoints return without one.
    pub fn storage(&self) -> crate::error::MarketDashResult<&ObjectStorage> {
        self.storage.as_ref().ok_or_else(|| {
            crate::error::MarketDashError::Unavailable(
                "Object storage not configured (S3_*). Jobs pipeline unavailable.".into(),
            )
        })
    }
}
