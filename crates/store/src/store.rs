use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, OrderId, ReservationId, VariantId};
use domain::{
    Cart, NewOrder, Order, OrderItem, PaidSettlement, PaymentRecord, Reservation,
    ReservationRequest, StockAdjustment, StockLevel, Variant,
};

use crate::Result;

/// Current stock per variant.
///
/// Every mutation keeps `stock_quantity >= 0`. Decrements are a single
/// conditional update guarded by `stock_quantity >= qty`, so the store's row
/// lock serializes concurrent callers on the same variant.
#[async_trait]
pub trait InventoryLedger: Send + Sync {
    /// Creates a variant and its inventory record with an initial quantity.
    async fn create_variant(&self, variant: Variant, initial_stock: u32) -> Result<Variant>;

    /// Retrieves a variant by id.
    async fn get_variant(&self, variant_id: VariantId) -> Result<Option<Variant>>;

    /// Decrements stock by `quantity` if at least that much is available.
    ///
    /// Returns `false` when the guard declines (not enough stock, or no
    /// inventory record); a decline is not an error.
    async fn decrement_if_available(&self, variant_id: VariantId, quantity: u32) -> Result<bool>;

    /// Adds `quantity` back to stock.
    async fn increment(&self, variant_id: VariantId, quantity: u32) -> Result<()>;

    /// Overwrites the ledger quantity.
    async fn set_absolute(&self, variant_id: VariantId, quantity: u32) -> Result<()>;

    /// Applies an administrative adjustment and returns the resulting level.
    ///
    /// A negative delta that would drive stock below zero fails with
    /// `InsufficientStock` and changes nothing.
    async fn adjust(&self, variant_id: VariantId, adjustment: StockAdjustment)
    -> Result<StockLevel>;

    /// Reads stock, reserved and available figures for a variant.
    async fn read(&self, variant_id: VariantId) -> Result<StockLevel>;
}

/// Time-bounded holds against the ledger.
///
/// Each method runs in one transaction: a hold is created together with its
/// decrement, and removed together with its increment (or, after a confirmed
/// sale, removed with no increment).
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Reserves every item or nothing.
    ///
    /// The cart must be active and hold no reservations; concurrent calls for
    /// one cart are serialized on the cart row. Items are merged per variant
    /// and processed in ascending variant order. The first variant whose
    /// decrement is declined aborts the transaction and is reported as
    /// `InsufficientStock`.
    async fn reserve_all(
        &self,
        cart_id: CartId,
        items: Vec<ReservationRequest>,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Reservation>>;

    /// Restores stock for every reservation of the cart and deletes them.
    async fn release_all(&self, cart_id: CartId) -> Result<Vec<Reservation>>;

    /// Restores stock for the listed reservations and deletes them.
    ///
    /// Ids that no longer exist are skipped.
    async fn release_reservations(&self, ids: &[ReservationId]) -> Result<Vec<Reservation>>;

    /// Deletes the cart's reservations without restoring stock.
    async fn clear_all(&self, cart_id: CartId) -> Result<Vec<Reservation>>;

    /// Sum of quantities held for a variant by existing reservations.
    async fn sum_reserved(&self, variant_id: VariantId) -> Result<u64>;

    /// Lists the reservations held for a cart.
    async fn reservations_for_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>>;

    /// Restores stock for one reservation and deletes it.
    async fn cancel_reservation(&self, reservation_id: ReservationId) -> Result<Reservation>;

    /// Releases every reservation whose `expires_at` is at or before `now`.
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>>;
}

/// Cart persistence.
#[async_trait]
pub trait CartStore: Send + Sync {
    /// Creates an empty active cart.
    async fn create_cart(&self, session_token: &str, expires_at: DateTime<Utc>) -> Result<Cart>;

    /// Retrieves a cart by id.
    async fn get_cart(&self, cart_id: CartId) -> Result<Option<Cart>>;

    /// Retrieves a cart by its session token.
    async fn cart_by_token(&self, session_token: &str) -> Result<Option<Cart>>;

    /// Adds `quantity` of a variant to an active cart.
    ///
    /// The merged line quantity must satisfy the variant's purchase bounds.
    async fn add_item(&self, cart_id: CartId, variant_id: VariantId, quantity: u32)
    -> Result<Cart>;

    /// Removes a variant's line from an active cart.
    async fn remove_item(&self, cart_id: CartId, variant_id: VariantId) -> Result<Cart>;

    /// Moves the cart expiry forward to `expires_at` and returns the effective expiry.
    async fn refresh_expiry(&self, cart_id: CartId, expires_at: DateTime<Utc>)
    -> Result<DateTime<Utc>>;

    /// Marks an active or ordered cart abandoned. Returns whether it changed.
    async fn abandon_cart(&self, cart_id: CartId) -> Result<bool>;

    /// Deletes a cart, restoring stock for its reservations first.
    ///
    /// Carts that produced an order are kept as order history and cannot be
    /// deleted. Returns the reservations that were released.
    async fn delete_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>>;
}

/// Result of applying a completion notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The order moved from pending to paid and the listed holds became a sale.
    Settled {
        order: Order,
        cleared: Vec<Reservation>,
    },
    /// The order had already left pending; nothing was written.
    AlreadySettled(Order),
}

/// Result of applying an expiration notification.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExpireOutcome {
    /// The order after the notification, if one matched the session.
    pub order: Option<Order>,
    /// True if this call moved the order from pending to failed.
    pub order_failed: bool,
    /// Reservations released (stock restored) by this call.
    pub released: Vec<Reservation>,
    /// True if this call marked the cart abandoned.
    pub cart_abandoned: bool,
}

/// Order persistence and settlement.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Marks the cart ordered and inserts a pending order, in one transaction.
    ///
    /// Fails with a cart state error if the cart is no longer active.
    async fn open_order(&self, order: NewOrder) -> Result<Order>;

    /// Retrieves an order by id.
    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>>;

    /// Retrieves the order correlated with a provider session.
    async fn order_by_session(&self, session_id: &str) -> Result<Option<Order>>;

    /// Lists the permanent line items of an order.
    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>>;

    /// Lists payment receipts of an order.
    async fn payments(&self, order_id: OrderId) -> Result<Vec<PaymentRecord>>;

    /// Applies a completion notification.
    ///
    /// With the order row locked: if it is still pending, write totals and
    /// encrypted PII, mark it paid, copy the cart items into order items,
    /// record one payment and clear the cart's reservations. Otherwise change
    /// nothing. Fails with `NotFound` if no order matches the session.
    async fn settle_paid(&self, session_id: &str, settlement: PaidSettlement)
    -> Result<SettleOutcome>;

    /// Applies an expiration notification.
    ///
    /// Fails a pending order, then releases the cart's reservations and
    /// abandons the cart. The cart comes from the order, or from `cart_hint`
    /// when no order matches and the hinted cart has no order of its own.
    /// A committed sale is never undone.
    async fn settle_expired(
        &self,
        session_id: &str,
        cart_hint: Option<CartId>,
    ) -> Result<ExpireOutcome>;
}

/// Everything the checkout core needs from storage.
pub trait Store: InventoryLedger + ReservationStore + CartStore + OrderStore {}

impl<T: InventoryLedger + ReservationStore + CartStore + OrderStore + ?Sized> Store for T {}
