//! HTTP route handlers.

pub mod carts;
pub mod checkout;
pub mod extract;
pub mod health;
pub mod inventory;
pub mod metrics;
pub mod orders;
pub mod reservations;
pub mod webhooks;
