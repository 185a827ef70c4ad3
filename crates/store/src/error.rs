use common::VariantId;
use domain::{CartError, DomainError, QuantityError, Shortfall};
use thiserror::Error;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A conditional decrement was declined because stock ran short.
    #[error("Insufficient stock: {0}")]
    InsufficientStock(Shortfall),

    /// The referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A domain rule rejected the operation.
    #[error("{0}")]
    Domain(#[from] DomainError),

    /// Input that cannot be represented in storage.
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// A stored row could not be mapped back into the domain.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn variant_not_found(variant_id: VariantId) -> Self {
        Self::not_found("variant", variant_id)
    }
}

impl From<CartError> for StoreError {
    fn from(e: CartError) -> Self {
        StoreError::Domain(DomainError::Cart(e))
    }
}

impl From<QuantityError> for StoreError {
    fn from(e: QuantityError) -> Self {
        StoreError::Domain(DomainError::Quantity(e))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
