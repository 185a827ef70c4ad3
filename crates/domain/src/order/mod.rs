//! Order and settlement types.

mod model;
mod state;

pub use model::{NewOrder, Order, OrderItem, PaidSettlement, PaymentRecord};
pub use state::OrderStatus;
