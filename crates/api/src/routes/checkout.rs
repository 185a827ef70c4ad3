//! Checkout start endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use checkout::{CheckoutRequest, CheckoutStarted};
use serde::Deserialize;
use store::Store;

use super::extract::{Ctx, session_token};
use crate::AppState;
use crate::error::{ApiError, ResultExt};

#[derive(Debug, Deserialize)]
pub struct StartCheckoutRequest {
    pub success_url: String,
    pub cancel_url: String,
}

/// POST /checkout
///
/// Reserves the cart's stock and returns the provider redirect. The cart is
/// identified by `X-Session-Token`.
#[tracing::instrument(skip(state, ctx, headers, body), fields(correlation_id = %ctx.correlation_id))]
pub async fn start<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
    body: Result<Json<StartCheckoutRequest>, JsonRejection>,
) -> Result<Json<CheckoutStarted>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json(&ctx, e))?;
    let request = CheckoutRequest {
        session_token: session_token(&ctx, &headers)?,
        success_url: req.success_url,
        cancel_url: req.cancel_url,
    };

    let started = state
        .checkout
        .start_checkout(&ctx, request)
        .await
        .in_context(&ctx)?;

    Ok(Json(started))
}
