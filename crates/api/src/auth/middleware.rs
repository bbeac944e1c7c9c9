//! Bearer-token authentication middleware
//!
//! Protected routers are wrapped with `middleware::from_fn_with_state(auth_state, require_auth)`;
//! handlers then read the caller with `Extension(auth_user): Extension<AuthUser>`.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use edupulse_shared::UserId;

use super::jwt::JwtManager;
use crate::error::ApiError;

/// State the auth middleware needs, split from `AppState` so it can be layered alone
#[derive(Clone)]
pub struct AuthState {
    pub jwt: JwtManager,
}

/// Authenticated caller, inserted into request extensions by `require_auth`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: UserId,
}

/// Reject requests without a valid `Authorization: Bearer <access token>`
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or(ApiError::Unauthorized)?;

    let claims = auth_state.jwt.validate_access_token(token).map_err(|e| {
        tracing::debug!(error = %e, "Rejected bearer token");
        ApiError::InvalidToken
    })?;

    request.extensions_mut().insert(AuthUser {
        user_id: UserId(claims.sub),
    });

    Ok(next.run(request).await)
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}
