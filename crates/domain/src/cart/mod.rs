//! Cart aggregate and related types.

mod model;
mod state;

pub use model::{Cart, CartItem};
pub use state::CartStatus;

use chrono::{DateTime, Utc};
use common::CartId;
use thiserror::Error;

/// Errors that can occur during cart operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CartError {
    /// Cart is not in the expected state.
    #[error("Invalid state transition: cannot {action} from {current_state} state")]
    InvalidStateTransition {
        current_state: CartStatus,
        action: &'static str,
    },

    /// Cart has run past its expiry; the shopper has to start a new one.
    #[error("Cart {cart_id} expired at {expired_at}")]
    Expired {
        cart_id: CartId,
        expired_at: DateTime<Utc>,
    },

    /// Cart already holds reservations from a checkout that has not finished.
    #[error("Cart {cart_id} already has a checkout in progress")]
    CheckoutInProgress { cart_id: CartId },

    /// Cart has no items.
    #[error("Cart has no items")]
    Empty,

    /// The cart total does not fit in a money amount.
    #[error("Cart total overflows")]
    TotalOverflow,

    /// Cart items are priced in more than one currency.
    #[error("Cart mixes currencies: {first} and {second}")]
    MixedCurrency { first: String, second: String },
}
