//! API error types with HTTP response mapping.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use checkout::{CheckoutError, ErrorKind, RequestContext};
use domain::Shortfall;
use serde::Serialize;
use uuid::Uuid;

/// What went wrong while serving a request.
#[derive(Debug)]
pub enum ApiFailure {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Checkout, settlement or storage error.
    Checkout(CheckoutError),
}

/// API-level error that maps to an HTTP response carrying the request's
/// correlation id.
#[derive(Debug)]
pub struct ApiError {
    pub correlation_id: Uuid,
    pub failure: ApiFailure,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: String,
    correlation_id: Uuid,
    #[serde(skip_serializing_if = "no_shortfalls")]
    shortfalls: &'a [Shortfall],
}

fn no_shortfalls(shortfalls: &&[Shortfall]) -> bool {
    shortfalls.is_empty()
}

impl ApiError {
    pub fn not_found(ctx: &RequestContext, message: impl Into<String>) -> Self {
        Self {
            correlation_id: ctx.correlation_id,
            failure: ApiFailure::NotFound(message.into()),
        }
    }

    pub fn bad_request(ctx: &RequestContext, message: impl Into<String>) -> Self {
        Self {
            correlation_id: ctx.correlation_id,
            failure: ApiFailure::BadRequest(message.into()),
        }
    }

    pub fn checkout(ctx: &RequestContext, err: impl Into<CheckoutError>) -> Self {
        Self {
            correlation_id: ctx.correlation_id,
            failure: ApiFailure::Checkout(err.into()),
        }
    }

    /// Maps a rejected JSON body to a 400 with the parser's message.
    pub fn json(ctx: &RequestContext, rejection: JsonRejection) -> Self {
        Self::bad_request(ctx, rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let correlation_id = self.correlation_id;
        let (status, message, shortfalls) = match &self.failure {
            ApiFailure::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), &[][..]),
            ApiFailure::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), &[][..]),
            ApiFailure::Checkout(err) => {
                let (status, message) = checkout_error_to_response(correlation_id, err);
                (status, message, err.shortfalls())
            }
        };

        let body = ErrorBody {
            error: message,
            correlation_id,
            shortfalls,
        };
        (status, Json(body)).into_response()
    }
}

fn checkout_error_to_response(correlation_id: Uuid, err: &CheckoutError) -> (StatusCode, String) {
    match err.kind() {
        ErrorKind::Validation => (StatusCode::BAD_REQUEST, err.to_string()),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, err.to_string()),
        ErrorKind::Conflict => (StatusCode::CONFLICT, err.to_string()),
        ErrorKind::DependentService => {
            tracing::warn!(%correlation_id, error = %err, "payment provider failure");
            (
                StatusCode::BAD_GATEWAY,
                "payment provider unavailable, please retry".to_string(),
            )
        }
        ErrorKind::Internal => {
            tracing::error!(%correlation_id, error = %err, "internal server error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal server error".to_string(),
            )
        }
    }
}

/// Attaches the request context to checkout and store errors.
pub trait ResultExt<T> {
    fn in_context(self, ctx: &RequestContext) -> Result<T, ApiError>;
}

impl<T, E: Into<CheckoutError>> ResultExt<T> for Result<T, E> {
    fn in_context(self, ctx: &RequestContext) -> Result<T, ApiError> {
        self.map_err(|e| ApiError::checkout(ctx, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::VariantId;
    use store::StoreError;

    fn status_of(err: CheckoutError) -> StatusCode {
        ApiError::checkout(&RequestContext::new(), err)
            .into_response()
            .status()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_of(CheckoutError::Validation("bad".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(status_of(CheckoutError::CartNotFound), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(CheckoutError::InsufficientStock(vec![Shortfall {
                variant_id: VariantId::new(),
                requested: 2,
                available: 1,
            }])),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(CheckoutError::Gateway(checkout::GatewayError::Declined(
                "no".into()
            ))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(CheckoutError::Store(StoreError::Corrupt("x".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let ctx = RequestContext::new();
        let response = ApiError::checkout(&ctx, StoreError::Corrupt("secret detail".into()))
            .into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["error"], "internal server error");
        assert_eq!(json["correlation_id"], ctx.correlation_id.to_string());
        assert!(json.get("shortfalls").is_none());
    }
}
