//! Request context and header helpers shared by handlers.

use std::convert::Infallible;
use std::str::FromStr;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use checkout::RequestContext;
use uuid::Uuid;

use crate::error::ApiError;

/// Header carrying the cart's session token.
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";
/// Optional caller-supplied correlation id.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Per-request context, reusing a valid `X-Correlation-Id` when one is sent.
#[derive(Debug, Clone, Copy)]
pub struct Ctx(pub RequestContext);

impl<S: Send + Sync> FromRequestParts<S> for Ctx {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ctx = parts
            .headers
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(RequestContext::with_correlation_id)
            .unwrap_or_default();
        Ok(Ctx(ctx))
    }
}

/// Reads the session token header.
pub fn session_token(ctx: &RequestContext, headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(SESSION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ApiError::bad_request(ctx, "missing X-Session-Token header"))
}

/// Parses a path identifier, answering 400 on garbage.
pub fn parse_id<T: FromStr>(ctx: &RequestContext, raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(ctx, format!("invalid {what}: {raw}")))
}
