//! Domain error types.

use thiserror::Error;

use crate::cart::CartError;
use crate::inventory::QuantityError;

/// Errors raised by domain rules.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    /// A cart rule was violated.
    #[error("Cart error: {0}")]
    Cart(#[from] CartError),

    /// A quantity rule was violated.
    #[error("Quantity error: {0}")]
    Quantity(#[from] QuantityError),
}
