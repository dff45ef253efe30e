//! Request extractors.

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use crate::error::ApiError;

/// Header carrying the caller's user ID, set by the upstream gateway.
pub const USER_ID_HEADER: &str = "x-user-id";

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Caller identity from [`USER_ID_HEADER`]. Missing or blank is a
/// validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for CallerId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| CallerId(s.to_string()))
            .ok_or_else(|| ApiError::validation("user_id is required (X-User-Id header)"))
    }
}
