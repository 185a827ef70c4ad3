//! Domain layer for inventory reservation and checkout settlement.
//!
//! This crate provides the data model shared by the store and checkout crates:
//! - Money and sellable units (variants) with purchase bounds
//! - Stock levels, reservations and reservation requests
//! - Cart aggregate with its state machine
//! - Order records with their state machine

pub mod cart;
pub mod error;
pub mod inventory;
pub mod money;
pub mod order;

pub use cart::{Cart, CartError, CartItem, CartStatus};
pub use error::DomainError;
pub use inventory::{
    QuantityError, Reservation, ReservationRequest, Shortfall, StockAdjustment, StockLevel,
    Variant, normalize_requests,
};
pub use money::Money;
pub use order::{NewOrder, Order, OrderItem, OrderStatus, PaidSettlement, PaymentRecord};
