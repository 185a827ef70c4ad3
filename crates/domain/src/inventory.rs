//! Sellable units, stock levels and reservations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::{CartId, ReservationId, VariantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Money;

/// Errors raised when a requested quantity is not acceptable for a variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    /// Quantity must be strictly positive.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    NotPositive { quantity: i64 },

    /// Quantity is below the variant's minimum purchase quantity.
    #[error("Quantity {quantity} for variant {variant_id} is below the minimum of {min}")]
    BelowMinimum {
        variant_id: VariantId,
        quantity: u32,
        min: u32,
    },

    /// Merged quantity for a variant does not fit in a `u32`.
    #[error("Quantity for variant {variant_id} overflows")]
    Overflow { variant_id: VariantId },

    /// Quantity is above the variant's maximum purchase quantity.
    #[error("Quantity {quantity} for variant {variant_id} exceeds the maximum of {max}")]
    AboveMaximum {
        variant_id: VariantId,
        quantity: u32,
        max: u32,
    },
}

/// A sellable unit. Referenced, never owned, by cart items, reservations
/// and order items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub id: VariantId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    pub currency: String,
    pub min_purchase_quantity: Option<u32>,
    pub max_purchase_quantity: Option<u32>,
}

impl Variant {
    /// Creates a variant without purchase bounds.
    pub fn new(
        sku: impl Into<String>,
        name: impl Into<String>,
        price: Money,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            id: VariantId::new(),
            sku: sku.into(),
            name: name.into(),
            price,
            currency: currency.into(),
            min_purchase_quantity: None,
            max_purchase_quantity: None,
        }
    }

    /// Sets the minimum and maximum purchase quantity.
    pub fn with_bounds(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_purchase_quantity = min;
        self.max_purchase_quantity = max;
        self
    }

    /// Checks a per-cart line quantity against this variant's bounds.
    pub fn check_quantity(&self, quantity: u32) -> Result<(), QuantityError> {
        if quantity == 0 {
            return Err(QuantityError::NotPositive { quantity: 0 });
        }
        if let Some(min) = self.min_purchase_quantity
            && quantity < min
        {
            return Err(QuantityError::BelowMinimum {
                variant_id: self.id,
                quantity,
                min,
            });
        }
        if let Some(max) = self.max_purchase_quantity
            && quantity > max
        {
            return Err(QuantityError::AboveMaximum {
                variant_id: self.id,
                quantity,
                max,
            });
        }
        Ok(())
    }
}

/// Stock figures for one variant.
///
/// The ledger quantity is already net of live holds, because a reservation
/// decrements it when taken. `stock` therefore reports units on hand
/// (ledger + held), and `available = stock - reserved` is what can still be
/// reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub variant_id: VariantId,
    pub stock: u64,
    pub reserved: u64,
    pub available: u64,
}

impl StockLevel {
    /// Builds a stock level from the ledger quantity and the live reserved sum.
    pub fn from_ledger(variant_id: VariantId, ledger_quantity: u32, reserved: u64) -> Self {
        let available = u64::from(ledger_quantity);
        Self {
            variant_id,
            stock: available + reserved,
            reserved,
            available,
        }
    }
}

/// A time-bounded hold whose quantity has already been decremented from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub cart_id: CartId,
    pub variant_id: VariantId,
    pub quantity: u32,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Returns true once the hold has run out.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// One line of a reserve-all request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub variant_id: VariantId,
    pub quantity: u32,
}

impl ReservationRequest {
    pub fn new(variant_id: VariantId, quantity: u32) -> Self {
        Self {
            variant_id,
            quantity,
        }
    }
}

/// Merges requests for the same variant and orders them by ascending variant id.
///
/// Every multi-variant reservation goes through this, so two checkouts touching
/// the same variants lock their rows in the same order and shortfall reports are
/// reproducible.
pub fn normalize_requests(
    requests: impl IntoIterator<Item = ReservationRequest>,
) -> Result<Vec<ReservationRequest>, QuantityError> {
    let mut merged: BTreeMap<VariantId, u32> = BTreeMap::new();
    for request in requests {
        if request.quantity == 0 {
            return Err(QuantityError::NotPositive { quantity: 0 });
        }
        let line = merged.entry(request.variant_id).or_default();
        *line = line
            .checked_add(request.quantity)
            .ok_or(QuantityError::Overflow {
                variant_id: request.variant_id,
            })?;
    }
    Ok(merged
        .into_iter()
        .map(|(variant_id, quantity)| ReservationRequest::new(variant_id, quantity))
        .collect())
}

/// Requested vs. available quantity for a variant that cannot be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    pub variant_id: VariantId,
    pub requested: u32,
    pub available: u64,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "variant {} requested {} but only {} available",
            self.variant_id, self.requested, self.available
        )
    }
}

/// Administrative stock update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockAdjustment {
    /// Overwrite the ledger quantity.
    Absolute(u32),
    /// Add (positive) or remove (negative) units; removal is conditional on stock.
    Delta(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn variant() -> Variant {
        Variant::new("SKU-001", "Widget", Money::from_cents(1000), "usd")
            .with_bounds(Some(2), Some(5))
    }

    #[test]
    fn test_check_quantity_within_bounds() {
        assert!(variant().check_quantity(2).is_ok());
        assert!(variant().check_quantity(5).is_ok());
    }

    #[test]
    fn test_check_quantity_rejects_out_of_bounds() {
        let v = variant();
        assert!(matches!(
            v.check_quantity(1),
            Err(QuantityError::BelowMinimum { min: 2, .. })
        ));
        assert!(matches!(
            v.check_quantity(6),
            Err(QuantityError::AboveMaximum { max: 5, .. })
        ));
        assert!(matches!(
            v.check_quantity(0),
            Err(QuantityError::NotPositive { .. })
        ));
    }

    #[test]
    fn test_stock_level_reports_on_hand_and_available() {
        let level = StockLevel::from_ledger(VariantId::new(), 2, 3);
        assert_eq!(level.stock, 5);
        assert_eq!(level.reserved, 3);
        assert_eq!(level.available, 2);
        assert_eq!(level.stock - level.reserved, level.available);
    }

    #[test]
    fn test_normalize_merges_and_sorts() {
        let a = VariantId::from_uuid(uuid::Uuid::from_u128(1));
        let b = VariantId::from_uuid(uuid::Uuid::from_u128(2));
        let normalized = normalize_requests([
            ReservationRequest::new(b, 1),
            ReservationRequest::new(a, 2),
            ReservationRequest::new(b, 4),
        ])
        .unwrap();

        assert_eq!(
            normalized,
            vec![ReservationRequest::new(a, 2), ReservationRequest::new(b, 5)]
        );
    }

    #[test]
    fn test_normalize_rejects_zero_quantity() {
        let result = normalize_requests([ReservationRequest::new(VariantId::new(), 0)]);
        assert!(result.is_err());
    }

    #[test]
    fn test_normalize_rejects_merged_overflow() {
        let id = VariantId::new();
        let result = normalize_requests([
            ReservationRequest::new(id, u32::MAX),
            ReservationRequest::new(id, 1),
        ]);
        assert_eq!(result, Err(QuantityError::Overflow { variant_id: id }));
    }

    #[test]
    fn test_reservation_expiry_boundary() {
        let now = Utc::now();
        let reservation = Reservation {
            id: ReservationId::new(),
            cart_id: CartId::new(),
            variant_id: VariantId::new(),
            quantity: 1,
            expires_at: now,
            created_at: now,
        };
        assert!(reservation.is_expired(now));
        assert!(!reservation.is_expired(now - chrono::Duration::seconds(1)));
    }
}
