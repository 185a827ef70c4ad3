//! Order read endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::{DateTime, Utc};
use checkout::{CheckoutError, PiiCipher};
use common::{CartId, OrderId, VariantId};
use domain::{OrderItem, PaymentRecord};
use serde::Serialize;
use store::{Store, StoreError};
use uuid::Uuid;

use super::extract::{Ctx, parse_id};
use crate::AppState;
use crate::error::{ApiError, ResultExt};

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: OrderId,
    pub cart_id: CartId,
    pub payment_session_id: String,
    pub status: String,
    pub amount_total_cents: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub shipping_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub items: Vec<OrderItemResponse>,
    pub payments: Vec<PaymentResponse>,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub id: Uuid,
    pub provider_reference: String,
    pub amount_cents: i64,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}

impl From<OrderItem> for OrderItemResponse {
    fn from(item: OrderItem) -> Self {
        Self {
            variant_id: item.variant_id,
            quantity: item.quantity,
            unit_price_cents: item.unit_price.cents(),
        }
    }
}

impl From<PaymentRecord> for PaymentResponse {
    fn from(payment: PaymentRecord) -> Self {
        Self {
            id: payment.id,
            provider_reference: payment.provider_reference,
            amount_cents: payment.amount.cents(),
            currency: payment.currency,
            created_at: payment.created_at,
        }
    }
}

/// GET /orders/{id}
///
/// Customer email and shipping details are decrypted for the response only.
#[tracing::instrument(skip(state, ctx), fields(correlation_id = %ctx.correlation_id))]
pub async fn get<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id(&ctx, &id, "order id")?;
    let order = state
        .store
        .get_order(order_id)
        .await
        .in_context(&ctx)?
        .ok_or_else(|| ApiError::checkout(&ctx, StoreError::not_found("order", order_id)))?;

    let items = state.store.order_items(order_id).await.in_context(&ctx)?;
    let payments = state.store.payments(order_id).await.in_context(&ctx)?;

    let decrypt = |value: Option<String>| -> Result<Option<String>, ApiError> {
        value
            .map(|v| state.cipher.decrypt(&v))
            .transpose()
            .map_err(|e| ApiError::checkout(&ctx, CheckoutError::Cipher(e)))
    };

    Ok(Json(OrderResponse {
        id: order.id,
        cart_id: order.cart_id,
        payment_session_id: order.payment_session_id,
        status: order.status.to_string(),
        amount_total_cents: order.amount_total.cents(),
        currency: order.currency,
        customer_email: decrypt(order.customer_email)?,
        shipping_details: decrypt(order.shipping_details)?,
        created_at: order.created_at,
        paid_at: order.paid_at,
        items: items.into_iter().map(OrderItemResponse::from).collect(),
        payments: payments.into_iter().map(PaymentResponse::from).collect(),
    }))
}
