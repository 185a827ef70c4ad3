//! Order records.

use chrono::{DateTime, Utc};
use common::{CartId, OrderId, VariantId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

use super::OrderStatus;

/// An order created when checkout begins; one-to-one with its cart.
///
/// `customer_email` and `shipping_details` only ever hold ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub cart_id: CartId,
    /// Provider session id used to correlate the settlement notification.
    pub payment_session_id: String,
    pub status: OrderStatus,
    pub amount_total: Money,
    pub currency: String,
    pub customer_email: Option<String>,
    pub shipping_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Input for opening a pending order at checkout.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub id: OrderId,
    pub cart_id: CartId,
    pub payment_session_id: String,
    pub amount_total: Money,
    pub currency: String,
}

impl NewOrder {
    pub fn into_order(self, created_at: DateTime<Utc>) -> Order {
        Order {
            id: self.id,
            cart_id: self.cart_id,
            payment_session_id: self.payment_session_id,
            status: OrderStatus::Pending,
            amount_total: self.amount_total,
            currency: self.currency,
            customer_email: None,
            shipping_details: None,
            created_at,
            paid_at: None,
        }
    }
}

/// What a completion notification writes onto the order.
#[derive(Debug, Clone)]
pub struct PaidSettlement {
    pub amount_total: Money,
    pub currency: String,
    /// Encrypted customer email.
    pub customer_email: Option<String>,
    /// Encrypted shipping details.
    pub shipping_details: Option<String>,
    /// Provider-side payment reference (payment intent or session id).
    pub provider_reference: String,
    pub paid_at: DateTime<Utc>,
}

/// A permanent line of a paid order, copied from the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub order_id: OrderId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: Money,
}

/// Receipt of a settled payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: OrderId,
    pub provider_reference: String,
    pub amount: Money,
    pub currency: String,
    pub created_at: DateTime<Utc>,
}
