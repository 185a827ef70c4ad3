//! Cart endpoints. The shopper's cart is addressed by the `X-Session-Token` header.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use checkout::{CheckoutError, RequestContext};
use common::{CartId, VariantId};
use domain::{Cart, CartItem};
use serde::{Deserialize, Serialize};
use store::Store;
use uuid::Uuid;

use super::extract::{Ctx, SESSION_TOKEN_HEADER, parse_id, session_token};
use crate::AppState;
use crate::error::{ApiError, ResultExt};

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct AddItemRequest {
    pub variant_id: VariantId,
    pub quantity: u32,
}

// -- Response types --

#[derive(Serialize)]
pub struct CartCreatedResponse {
    pub cart_id: CartId,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct CartResponse {
    pub cart_id: CartId,
    pub status: String,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<CartItemResponse>,
    /// Absent while the cart is empty or mixes currencies.
    pub total_cents: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Serialize)]
pub struct CartItemResponse {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub currency: String,
}

#[derive(Serialize)]
pub struct CartDeletedResponse {
    pub cart_id: CartId,
    pub released: usize,
    pub units_restored: u64,
}

impl From<&CartItem> for CartItemResponse {
    fn from(item: &CartItem) -> Self {
        Self {
            variant_id: item.variant_id,
            quantity: item.quantity,
            unit_price_cents: item.unit_price.cents(),
            currency: item.currency.clone(),
        }
    }
}

impl From<Cart> for CartResponse {
    fn from(cart: Cart) -> Self {
        let total = cart.total().ok();
        Self {
            cart_id: cart.id,
            status: cart.status.as_str().to_string(),
            expires_at: cart.expires_at,
            items: cart.items.iter().map(CartItemResponse::from).collect(),
            total_cents: total.as_ref().map(|(money, _)| money.cents()),
            currency: total.map(|(_, currency)| currency),
        }
    }
}

async fn current_cart<S: Store + Clone + 'static>(
    state: &AppState<S>,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Result<Cart, ApiError> {
    let token = session_token(ctx, headers)?;
    state
        .store
        .cart_by_token(&token)
        .await
        .in_context(ctx)?
        .ok_or_else(|| ApiError::checkout(ctx, CheckoutError::CartNotFound))
}

// -- Handlers --

/// POST /carts
///
/// Binds a new cart to the `X-Session-Token` header, or to a generated token
/// when none is sent.
#[tracing::instrument(skip(state, ctx, headers), fields(correlation_id = %ctx.correlation_id))]
pub async fn create<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<CartCreatedResponse>), ApiError> {
    let token = match headers.get(SESSION_TOKEN_HEADER) {
        Some(_) => session_token(&ctx, &headers)?,
        None => Uuid::new_v4().simple().to_string(),
    };

    let cart = state.checkout.create_cart(&ctx, &token).await.in_context(&ctx)?;

    Ok((
        StatusCode::CREATED,
        Json(CartCreatedResponse {
            cart_id: cart.id,
            session_token: cart.session_token,
            expires_at: cart.expires_at,
        }),
    ))
}

/// GET /carts/current
#[tracing::instrument(skip(state, ctx, headers), fields(correlation_id = %ctx.correlation_id))]
pub async fn current<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
) -> Result<Json<CartResponse>, ApiError> {
    let cart = current_cart(&state, &ctx, &headers).await?;
    Ok(Json(cart.into()))
}

/// POST /carts/current/items
#[tracing::instrument(skip(state, ctx, headers, body), fields(correlation_id = %ctx.correlation_id))]
pub async fn add_item<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
    body: Result<Json<AddItemRequest>, JsonRejection>,
) -> Result<Json<CartResponse>, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json(&ctx, e))?;
    let cart = current_cart(&state, &ctx, &headers).await?;

    let cart = state
        .store
        .add_item(cart.id, req.variant_id, req.quantity)
        .await
        .in_context(&ctx)?;
    tracing::info!(cart_id = %cart.id, variant_id = %req.variant_id, quantity = req.quantity, "item added");

    Ok(Json(cart.into()))
}

/// DELETE /carts/current/items/{variant_id}
#[tracing::instrument(skip(state, ctx, headers), fields(correlation_id = %ctx.correlation_id))]
pub async fn remove_item<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    headers: HeaderMap,
    Path(variant_id): Path<String>,
) -> Result<Json<CartResponse>, ApiError> {
    let variant_id: VariantId = parse_id(&ctx, &variant_id, "variant id")?;
    let cart = current_cart(&state, &ctx, &headers).await?;

    let cart = state
        .store
        .remove_item(cart.id, variant_id)
        .await
        .in_context(&ctx)?;

    Ok(Json(cart.into()))
}

/// DELETE /carts/{id}
///
/// Restores the stock held by the cart's reservations before deleting it.
#[tracing::instrument(skip(state, ctx), fields(correlation_id = %ctx.correlation_id))]
pub async fn delete<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> Result<Json<CartDeletedResponse>, ApiError> {
    let cart_id: CartId = parse_id(&ctx, &id, "cart id")?;
    let released = state
        .checkout
        .delete_cart(&ctx, cart_id)
        .await
        .in_context(&ctx)?;

    Ok(Json(CartDeletedResponse {
        cart_id,
        released: released.len(),
        units_restored: released.iter().map(|r| u64::from(r.quantity)).sum(),
    }))
}
