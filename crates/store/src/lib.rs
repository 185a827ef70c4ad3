//! Persistence for the checkout core.
//!
//! The [`InventoryLedger`] is the single source of truth for stock per variant;
//! the [`ReservationStore`] records time-bounded holds against it. Carts and
//! orders live beside them so that every multi-row step (reserve-all,
//! release-all, settle) commits in one transaction.
//!
//! Two implementations share the traits: [`PostgresStore`] for production and
//! [`InMemoryStore`] for tests and local runs.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::InMemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    CartStore, ExpireOutcome, InventoryLedger, OrderStore, ReservationStore, SettleOutcome, Store,
};
