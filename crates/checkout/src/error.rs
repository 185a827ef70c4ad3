//! Checkout error types.

use domain::{CartError, DomainError, QuantityError, Shortfall};
use store::StoreError;
use thiserror::Error;

use crate::cipher::CipherError;
use crate::payment::GatewayError;

/// How a failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input. Not retried.
    Validation,
    /// Insufficient stock or unexpected cart/order state. Retry with fresh data.
    Conflict,
    /// Unknown cart, order, reservation or session.
    NotFound,
    /// The payment provider failed. Retriable.
    DependentService,
    /// A persistence step that should have succeeded did not.
    Internal,
}

impl ErrorKind {
    /// Label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::DependentService => "dependent_service",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors that can occur during checkout and settlement.
#[derive(Debug, Error)]
pub enum CheckoutError {
    /// Request input failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// No cart matches the session token.
    #[error("Cart not found")]
    CartNotFound,

    /// A notification referenced a payment session with no local order.
    #[error("No order for payment session {0}")]
    UnknownSession(String),

    /// One or more line items cannot be reserved.
    #[error("Insufficient stock for {} item(s)", .0.len())]
    InsufficientStock(Vec<Shortfall>),

    /// Cart rule violation.
    #[error("{0}")]
    Cart(#[from] CartError),

    /// Purchase quantity outside the variant's bounds.
    #[error("{0}")]
    Quantity(#[from] QuantityError),

    /// The payment provider failed or returned an unusable session.
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// The webhook signature did not match the body.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// The webhook body could not be parsed.
    #[error("Malformed event: {0}")]
    MalformedEvent(String),

    /// PII could not be encrypted.
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// Storage error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CheckoutError {
    /// Classifies the error for status mapping and retry decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CheckoutError::Validation(_)
            | CheckoutError::Quantity(_)
            | CheckoutError::InvalidSignature
            | CheckoutError::MalformedEvent(_) => ErrorKind::Validation,
            CheckoutError::CartNotFound | CheckoutError::UnknownSession(_) => ErrorKind::NotFound,
            CheckoutError::InsufficientStock(_) => ErrorKind::Conflict,
            CheckoutError::Cart(e) => cart_kind(e),
            CheckoutError::Gateway(_) => ErrorKind::DependentService,
            CheckoutError::Cipher(_) => ErrorKind::Internal,
            CheckoutError::Store(e) => store_kind(e),
        }
    }

    /// The per-variant shortfalls carried by a stock conflict.
    pub fn shortfalls(&self) -> &[Shortfall] {
        match self {
            CheckoutError::InsufficientStock(shortfalls) => shortfalls,
            CheckoutError::Store(StoreError::InsufficientStock(shortfall)) => {
                std::slice::from_ref(shortfall)
            }
            _ => &[],
        }
    }
}

fn cart_kind(e: &CartError) -> ErrorKind {
    match e {
        CartError::InvalidStateTransition { .. } | CartError::CheckoutInProgress { .. } => {
            ErrorKind::Conflict
        }
        // An expired cart is recovered by starting a new one.
        CartError::Expired { .. }
        | CartError::Empty
        | CartError::TotalOverflow
        | CartError::MixedCurrency { .. } => ErrorKind::Validation,
    }
}

fn store_kind(e: &StoreError) -> ErrorKind {
    match e {
        StoreError::InsufficientStock(_) => ErrorKind::Conflict,
        StoreError::NotFound { .. } => ErrorKind::NotFound,
        StoreError::Domain(DomainError::Cart(e)) => cart_kind(e),
        StoreError::Domain(DomainError::Quantity(_)) => ErrorKind::Validation,
        StoreError::Invalid(_) => ErrorKind::Validation,
        StoreError::Corrupt(_) | StoreError::Database(_) | StoreError::Migration(_) => {
            ErrorKind::Internal
        }
    }
}

/// Convenience type alias for checkout results.
pub type Result<T> = std::result::Result<T, CheckoutError>;

#[cfg(test)]
mod tests {
    use super::*;
    use common::VariantId;

    #[test]
    fn test_store_shortfall_is_conflict_with_details() {
        let shortfall = Shortfall {
            variant_id: VariantId::new(),
            requested: 3,
            available: 2,
        };
        let err = CheckoutError::Store(StoreError::InsufficientStock(shortfall));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.shortfalls(), &[shortfall]);
    }

    #[test]
    fn test_cart_state_is_conflict_but_expiry_is_validation() {
        let state = CheckoutError::Cart(CartError::InvalidStateTransition {
            current_state: domain::CartStatus::Ordered,
            action: "checkout",
        });
        assert_eq!(state.kind(), ErrorKind::Conflict);

        let in_progress = CheckoutError::Store(StoreError::from(CartError::CheckoutInProgress {
            cart_id: common::CartId::new(),
        }));
        assert_eq!(in_progress.kind(), ErrorKind::Conflict);

        let expired = CheckoutError::Cart(CartError::Expired {
            cart_id: common::CartId::new(),
            expired_at: chrono::Utc::now(),
        });
        assert_eq!(expired.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_gateway_failure_is_dependent_service() {
        let err = CheckoutError::Gateway(GatewayError::Declined("card".to_string()));
        assert_eq!(err.kind(), ErrorKind::DependentService);
        assert!(err.shortfalls().is_empty());
    }

    #[test]
    fn test_missing_store_row_is_not_found() {
        let err = CheckoutError::Store(StoreError::NotFound {
            entity: "reservation",
            id: "x".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
