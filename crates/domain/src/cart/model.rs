//! Cart aggregate.

use chrono::{DateTime, Duration, Utc};
use common::{CartId, VariantId};
use serde::{Deserialize, Serialize};

use crate::inventory::{QuantityError, ReservationRequest, normalize_requests};
use crate::money::Money;

use super::{CartError, CartStatus};

/// A line in a cart, priced from the variant at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_price: Money,
    pub currency: String,
}

impl CartItem {
    /// Returns quantity * unit price, or `None` on overflow.
    pub fn total_price(&self) -> Option<Money> {
        self.unit_price.checked_mul(self.quantity)
    }
}

/// Session-scoped order in progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub id: CartId,
    /// Opaque token the shopper presents to identify the cart.
    pub session_token: String,
    pub status: CartStatus,
    pub expires_at: DateTime<Utc>,
    pub items: Vec<CartItem>,
    pub created_at: DateTime<Utc>,
}

impl Cart {
    /// Creates an empty active cart.
    pub fn new(session_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            id: CartId::new(),
            session_token: session_token.into(),
            status: CartStatus::Active,
            expires_at,
            items: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Returns true once the cart has run past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Checks the checkout preconditions: not expired, `Active`, non-empty.
    ///
    /// Expiry is checked first because it is the one the shopper recovers from
    /// by starting a new cart.
    pub fn ensure_checkout_ready(&self, now: DateTime<Utc>) -> Result<(), CartError> {
        if self.is_expired(now) {
            return Err(CartError::Expired {
                cart_id: self.id,
                expired_at: self.expires_at,
            });
        }
        if !self.status.can_checkout() {
            return Err(CartError::InvalidStateTransition {
                current_state: self.status,
                action: "checkout",
            });
        }
        if self.items.is_empty() {
            return Err(CartError::Empty);
        }
        Ok(())
    }

    /// Expiry after opening a checkout window of `window` at `now`.
    /// Never moves the expiry backwards.
    pub fn extended_expiry(&self, now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
        self.expires_at.max(now + window)
    }

    /// Quantities to reserve, merged per variant in ascending variant order.
    pub fn reservation_requests(&self) -> Result<Vec<ReservationRequest>, QuantityError> {
        normalize_requests(
            self.items
                .iter()
                .map(|item| ReservationRequest::new(item.variant_id, item.quantity)),
        )
    }

    /// Sum of all lines and their common currency.
    pub fn total(&self) -> Result<(Money, String), CartError> {
        let first = self.items.first().ok_or(CartError::Empty)?;
        if let Some(other) = self.items.iter().find(|i| i.currency != first.currency) {
            return Err(CartError::MixedCurrency {
                first: first.currency.clone(),
                second: other.currency.clone(),
            });
        }
        let total = self
            .items
            .iter()
            .try_fold(Money::zero(), |acc, item| acc.checked_add(item.total_price()?))
            .ok_or(CartError::TotalOverflow)?;
        Ok((total, first.currency.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: u32, cents: i64, currency: &str) -> CartItem {
        CartItem {
            variant_id: VariantId::new(),
            quantity,
            unit_price: Money::from_cents(cents),
            currency: currency.to_string(),
        }
    }

    fn cart_with_items(items: Vec<CartItem>) -> Cart {
        let mut cart = Cart::new("tok", Utc::now() + Duration::hours(1));
        cart.items = items;
        cart
    }

    #[test]
    fn test_ready_cart_passes() {
        let cart = cart_with_items(vec![item(1, 500, "usd")]);
        assert!(cart.ensure_checkout_ready(Utc::now()).is_ok());
    }

    #[test]
    fn test_expired_cart_is_rejected_first() {
        let mut cart = cart_with_items(vec![]);
        cart.status = CartStatus::Ordered;
        cart.expires_at = Utc::now() - Duration::minutes(1);

        assert!(matches!(
            cart.ensure_checkout_ready(Utc::now()),
            Err(CartError::Expired { .. })
        ));
    }

    #[test]
    fn test_non_active_cart_is_rejected() {
        let mut cart = cart_with_items(vec![item(1, 500, "usd")]);
        cart.status = CartStatus::Ordered;

        assert!(matches!(
            cart.ensure_checkout_ready(Utc::now()),
            Err(CartError::InvalidStateTransition {
                current_state: CartStatus::Ordered,
                ..
            })
        ));
    }

    #[test]
    fn test_empty_cart_is_rejected() {
        let cart = cart_with_items(vec![]);
        assert_eq!(
            cart.ensure_checkout_ready(Utc::now()),
            Err(CartError::Empty)
        );
    }

    #[test]
    fn test_extended_expiry_never_moves_backwards() {
        let now = Utc::now();
        let mut cart = cart_with_items(vec![]);

        cart.expires_at = now + Duration::hours(5);
        assert_eq!(
            cart.extended_expiry(now, Duration::minutes(30)),
            cart.expires_at
        );

        cart.expires_at = now + Duration::minutes(5);
        assert_eq!(
            cart.extended_expiry(now, Duration::minutes(30)),
            now + Duration::minutes(30)
        );
    }

    #[test]
    fn test_total_sums_lines() {
        let cart = cart_with_items(vec![item(2, 1000, "usd"), item(1, 250, "usd")]);
        let (total, currency) = cart.total().unwrap();
        assert_eq!(total.cents(), 2250);
        assert_eq!(currency, "usd");
    }

    #[test]
    fn test_total_rejects_overflow() {
        let line = cart_with_items(vec![item(3, i64::MAX / 2, "usd")]);
        assert!(matches!(line.total(), Err(CartError::TotalOverflow)));

        let sum = cart_with_items(vec![item(1, i64::MAX, "usd"), item(1, 1, "usd")]);
        assert!(matches!(sum.total(), Err(CartError::TotalOverflow)));
    }

    #[test]
    fn test_total_rejects_mixed_currencies() {
        let cart = cart_with_items(vec![item(1, 1000, "usd"), item(1, 1000, "eur")]);
        assert!(matches!(
            cart.total(),
            Err(CartError::MixedCurrency { .. })
        ));
    }
}
