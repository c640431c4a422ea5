#![allow(dead_code)]
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDashError {
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Token error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Bcrypt error: {0}")]
    Bcrypt(#[from] bcrypt::BcryptError),
}

impl From<object_store::Error> for MarketDashError {
    fn from(e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { .. } => MarketDashError::NotFound,
            other => MarketDashError::Storage(other.to_string()),
        }
    }
}

impl MarketDashError {
    /// Stable kind string used in the error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketDashError::Unauthenticated(_) | MarketDashError::Jwt(_) => "unauthenticated",
            MarketDashError::Forbidden(_) => "forbidden",
            MarketDashError::NotFound => "not_found",
            MarketDashError::Validation(_) => "validation",
            MarketDashError::Conflict(_) => "conflict",
            MarketDashError::Storage(_) => "storage",
            MarketDashError::Upstream(_) => "upstream",
            MarketDashError::Unavailable(_) => "unavailable",
            _ => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            MarketDashError::Unauthenticated(_) | MarketDashError::Jwt(_) => {
                StatusCode::UNAUTHORIZED
            }
            MarketDashError::Forbidden(_) => StatusCode::FORBIDDEN,
            MarketDashError::NotFound => StatusCode::NOT_FOUND,
            MarketDashError::Validation(_) => StatusCode::BAD_REQUEST,
            MarketDashError::Conflict(_) => StatusCode::CONFLICT,
            MarketDashError::Storage(_) | MarketDashError::Upstream(_) => StatusCode::BAD_GATEWAY,
            MarketDashError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// True when a retry with backoff can plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            MarketDashError::Storage(_)
            | MarketDashError::Upstream(_)
            | MarketDashError::Unavailable(_) => true,
            MarketDashError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Protocol(_)
            ),
            MarketDashError::Io(_) => true,
            _ => false,
        }
    }
}

pub type MarketDashResult<T> = Result<T, MarketDashError>;

impl IntoResponse for MarketDashError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx detail goes to the log, not to the caller
        let message = if status.is_server_error() {
            tracing::error!(kind = self.kind(), "{}", self);
            match &self {
                MarketDashError::Storage(_) => "Object storage unavailable".to_string(),
                MarketDashError::Upstream(_) => "Upstream service unavailable".to_string(),
                MarketDashError::Unavailable(msg) => msg.clone(),
                _ => "Internal server error".to_string(),
            }
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
