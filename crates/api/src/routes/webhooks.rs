//! Payment provider notifications.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use checkout::{SIGNATURE_HEADER, SettlementOutcome};
use serde::Serialize;
use store::Store;

use super::extract::Ctx;
use crate::AppState;
use crate::error::{ApiError, ResultExt};

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    #[serde(flatten)]
    pub outcome: SettlementOutcome,
}

/// POST /webhooks/payments
///
/// The signature covers the raw body, so the body is taken as bytes and only
/// parsed after verification.
#[tracing::instrument(skip(state, ctx, headers, body), fields(correlation_id = %ctx.correlation_id))]
pub async fn payments<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let outcome = state
        .settlement
        .handle_signed(&ctx, &body, signature)
        .await
        .in_context(&ctx)?;

    Ok(Json(WebhookResponse {
        received: true,
        outcome,
    }))
}
