//! Administrative variant and stock endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use checkout::RequestContext;
use common::VariantId;
use domain::{Money, StockAdjustment, StockLevel, Variant};
use serde::{Deserialize, Serialize};
use store::Store;

use super::extract::{Ctx, parse_id};
use crate::AppState;
use crate::error::{ApiError, ResultExt};

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct CreateVariantRequest {
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub min_purchase_quantity: Option<u32>,
    pub max_purchase_quantity: Option<u32>,
    #[serde(default)]
    pub stock_quantity: u32,
}

/// Either an absolute quantity or a signed delta, never both.
#[derive(Debug, Deserialize)]
pub struct UpdateStockRequest {
    pub stock_quantity: Option<u32>,
    pub adjust: Option<i64>,
}

// -- Response types --

#[derive(Serialize)]
pub struct VariantResponse {
    pub id: VariantId,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub min_purchase_quantity: Option<u32>,
    pub max_purchase_quantity: Option<u32>,
    pub stock: StockLevel,
}

impl CreateVariantRequest {
    fn into_variant(self, ctx: &RequestContext) -> Result<(Variant, u32), ApiError> {
        if self.sku.trim().is_empty() || self.name.trim().is_empty() {
            return Err(ApiError::bad_request(ctx, "sku and name are required"));
        }
        if self.price_cents < 0 {
            return Err(ApiError::bad_request(ctx, "price_cents must not be negative"));
        }
        let currency = self.currency.trim().to_ascii_lowercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ApiError::bad_request(
                ctx,
                "currency must be a three-letter ISO code",
            ));
        }
        if self.min_purchase_quantity == Some(0) || self.max_purchase_quantity == Some(0) {
            return Err(ApiError::bad_request(ctx, "purchase bounds must be positive"));
        }
        if let (Some(min), Some(max)) = (self.min_purchase_quantity, self.max_purchase_quantity)
            && min > max
        {
            return Err(ApiError::bad_request(
                ctx,
                "min_purchase_quantity exceeds max_purchase_quantity",
            ));
        }

        let variant = Variant::new(
            self.sku.trim(),
            self.name.trim(),
            Money::from_cents(self.price_cents),
            currency,
        )
        .with_bounds(self.min_purchase_quantity, self.max_purchase_quantity);
        Ok((variant, self.stock_quantity))
    }
}

impl UpdateStockRequest {
    fn into_adjustment(self, ctx: &RequestContext) -> Result<StockAdjustment, ApiError> {
        match (self.stock_quantity, self.adjust) {
            (Some(quantity), None) => Ok(StockAdjustment::Absolute(quantity)),
            (None, Some(delta)) => Ok(StockAdjustment::Delta(delta)),
            _ => Err(ApiError::bad_request(
                ctx,
                "exactly one of stock_quantity or adjust is required",
            )),
        }
    }
}

// -- Handlers --

/// POST /admin/variants
#[tracing::instrument(skip(state, ctx, body), fields(correlation_id = %ctx.correlation_id))]
pub async fn create_variant<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    body: Result<Json<CreateVariantRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<VariantResponse>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::json(&ctx, e))?;
    let (variant, initial_stock) = req.into_variant(&ctx)?;

    let variant = state
        .store
        .create_variant(variant, initial_stock)
        .await
        .in_context(&ctx)?;
    let stock = state.store.read(variant.id).await.in_context(&ctx)?;
    tracing::info!(variant_id = %variant.id, sku = %variant.sku, initial_stock, "variant created");

    Ok((
        StatusCode::CREATED,
        Json(VariantResponse {
            id: variant.id,
            sku: variant.sku,
            name: variant.name,
            price_cents: variant.price.cents(),
            currency: variant.currency,
            min_purchase_quantity: variant.min_purchase_quantity,
            max_purchase_quantity: variant.max_purchase_quantity,
            stock,
        }),
    ))
}

/// GET /admin/inventory/{variant_id}
#[tracing::instrument(skip(state, ctx), fields(correlation_id = %ctx.correlation_id))]
pub async fn read<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    Path(variant_id): Path<String>,
) -> Result<Json<StockLevel>, ApiError> {
    let variant_id: VariantId = parse_id(&ctx, &variant_id, "variant id")?;
    let level = state.store.read(variant_id).await.in_context(&ctx)?;
    Ok(Json(level))
}

/// PUT /admin/inventory/{variant_id}
///
/// A negative `adjust` that would take stock below zero is a 409 and
/// changes nothing.
#[tracing::instrument(skip(state, ctx, body), fields(correlation_id = %ctx.correlation_id))]
pub async fn update<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    Path(variant_id): Path<String>,
    body: Result<Json<UpdateStockRequest>, JsonRejection>,
) -> Result<Json<StockLevel>, ApiError> {
    let variant_id: VariantId = parse_id(&ctx, &variant_id, "variant id")?;
    let Json(req) = body.map_err(|e| ApiError::json(&ctx, e))?;
    let adjustment = req.into_adjustment(&ctx)?;

    let level = state
        .store
        .adjust(variant_id, adjustment)
        .await
        .in_context(&ctx)?;
    tracing::info!(?adjustment, available = level.available, "stock adjusted");

    Ok(Json(level))
}
