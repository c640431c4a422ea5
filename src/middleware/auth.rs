use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::MarketDashError;
use crate::state::AppState;

/// Claims carried by the bearer tokens our auth service issues.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    pub user_id: i64,
    pub exp: usize,
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, MarketDashError> {
    // everything under /api requires a bearer token; /health stays open
    if !request.uri().path().starts_with("/api/") {
        return Ok(next.run(request).await);
    }

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MarketDashError::Unauthenticated("Missing bearer token".into()))?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| MarketDashError::Unauthenticated("Missing bearer token".into()))?;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(state.config.jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|_| MarketDashError::Unauthenticated("Invalid or expired token".into()))?;

    request.extensions_mut().insert(token_data.claims);

    Ok(next.run(request).await)
}

#[cfg(test)]
pub fn issue_token(secret: &str, user_id: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    let claims = Claims {
        sub: format!("user-{}", user_id),
        user_id,
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_roundtrip() {
        let token = issue_token("test-secret", 42);
        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"test-secret"),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.user_id, 42);
        assert_eq!(decoded.claims.sub, "user-42");
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_token("test-secret", 42);
        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"other-secret"),
            &Validation::default(),
        );
        assert!(result.is_err());
    }
}
