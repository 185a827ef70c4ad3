//! Shared identifier types.
//!
//! Every entity the checkout core touches is keyed by a UUID. The wrappers here
//! keep a cart id from ever being passed where a variant id is expected.

pub mod types;

pub use types::{CartId, OrderId, ReservationId, VariantId};
