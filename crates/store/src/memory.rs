use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, OrderId, ReservationId, VariantId};
use domain::{
    Cart, CartError, CartItem, CartStatus, NewOrder, Order, OrderItem, OrderStatus,
    PaidSettlement, PaymentRecord, QuantityError, Reservation, ReservationRequest, Shortfall,
    StockAdjustment, StockLevel, Variant, normalize_requests,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        CartStore, ExpireOutcome, InventoryLedger, OrderStore, ReservationStore, SettleOutcome,
    },
};

#[derive(Debug, Clone)]
struct CartRecord {
    id: CartId,
    session_token: String,
    status: CartStatus,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    lines: BTreeMap<VariantId, u32>,
}

#[derive(Debug, Default)]
struct State {
    variants: HashMap<VariantId, Variant>,
    stock: HashMap<VariantId, u32>,
    reservations: HashMap<ReservationId, Reservation>,
    carts: HashMap<CartId, CartRecord>,
    orders: HashMap<OrderId, Order>,
    order_items: Vec<OrderItem>,
    payments: Vec<PaymentRecord>,
}

impl State {
    fn variant(&self, variant_id: VariantId) -> Result<&Variant> {
        self.variants
            .get(&variant_id)
            .ok_or_else(|| StoreError::variant_not_found(variant_id))
    }

    fn stock_mut(&mut self, variant_id: VariantId) -> Result<&mut u32> {
        self.stock
            .get_mut(&variant_id)
            .ok_or_else(|| StoreError::not_found("inventory", variant_id))
    }

    fn reserved(&self, variant_id: VariantId) -> u64 {
        self.reservations
            .values()
            .filter(|r| r.variant_id == variant_id)
            .map(|r| u64::from(r.quantity))
            .sum()
    }

    fn level(&self, variant_id: VariantId) -> Result<StockLevel> {
        let stock = self
            .stock
            .get(&variant_id)
            .ok_or_else(|| StoreError::not_found("inventory", variant_id))?;
        Ok(StockLevel::from_ledger(
            variant_id,
            *stock,
            self.reserved(variant_id),
        ))
    }

    fn cart_record(&self, cart_id: CartId) -> Result<&CartRecord> {
        self.carts
            .get(&cart_id)
            .ok_or_else(|| StoreError::not_found("cart", cart_id))
    }

    fn hydrate(&self, record: &CartRecord) -> Cart {
        let items = record
            .lines
            .iter()
            .filter_map(|(variant_id, quantity)| {
                self.variants.get(variant_id).map(|v| CartItem {
                    variant_id: *variant_id,
                    quantity: *quantity,
                    unit_price: v.price,
                    currency: v.currency.clone(),
                })
            })
            .collect();
        Cart {
            id: record.id,
            session_token: record.session_token.clone(),
            status: record.status,
            expires_at: record.expires_at,
            items,
            created_at: record.created_at,
        }
    }

    /// Removes the reservations matching `pred`, sorted by variant id.
    fn take_reservations(&mut self, pred: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let ids: Vec<ReservationId> = self
            .reservations
            .values()
            .filter(|r| pred(r))
            .map(|r| r.id)
            .collect();
        let mut taken: Vec<Reservation> = ids
            .iter()
            .filter_map(|id| self.reservations.remove(id))
            .collect();
        taken.sort_by_key(|r| (r.variant_id, r.id));
        taken
    }

    /// Removes the reservations matching `pred` and adds their quantities back.
    ///
    /// Every affected variant must have an inventory record; otherwise nothing
    /// is removed.
    fn release_where(&mut self, pred: impl Fn(&Reservation) -> bool) -> Result<Vec<Reservation>> {
        if let Some(orphan) = self
            .reservations
            .values()
            .filter(|r| pred(r))
            .find(|r| !self.stock.contains_key(&r.variant_id))
        {
            return Err(StoreError::not_found("inventory", orphan.variant_id));
        }
        let released = self.take_reservations(pred);
        for r in &released {
            let stock = self.stock_mut(r.variant_id)?;
            *stock = stock.saturating_add(r.quantity);
        }
        Ok(released)
    }

    fn release_cart(&mut self, cart_id: CartId) -> Result<Vec<Reservation>> {
        self.release_where(|r| r.cart_id == cart_id)
    }

    fn abandon(&mut self, cart_id: CartId) -> bool {
        match self.carts.get_mut(&cart_id) {
            Some(cart) if cart.status.can_abandon() => {
                cart.status = CartStatus::Abandoned;
                true
            }
            _ => false,
        }
    }

    fn order_id_by_session(&self, session_id: &str) -> Option<OrderId> {
        self.orders
            .values()
            .find(|o| o.payment_session_id == session_id)
            .map(|o| o.id)
    }
}

/// In-memory store for tests and local runs.
///
/// Every operation holds the write lock for its whole duration, which gives
/// it the same all-or-nothing behaviour as a database transaction.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of live reservations.
    pub async fn reservation_count(&self) -> usize {
        self.state.read().await.reservations.len()
    }

    /// Moves a cart's expiry without the forward-only rule, for tests.
    pub async fn force_cart_expiry(&self, cart_id: CartId, expires_at: DateTime<Utc>) {
        if let Some(cart) = self.state.write().await.carts.get_mut(&cart_id) {
            cart.expires_at = expires_at;
        }
    }
}

#[async_trait]
impl InventoryLedger for InMemoryStore {
    async fn create_variant(&self, variant: Variant, initial_stock: u32) -> Result<Variant> {
        let mut state = self.state.write().await;
        if state.variants.values().any(|v| v.sku == variant.sku) {
            return Err(StoreError::Invalid(format!(
                "sku {} already exists",
                variant.sku
            )));
        }
        state.stock.insert(variant.id, initial_stock);
        state.variants.insert(variant.id, variant.clone());
        Ok(variant)
    }

    async fn get_variant(&self, variant_id: VariantId) -> Result<Option<Variant>> {
        Ok(self.state.read().await.variants.get(&variant_id).cloned())
    }

    async fn decrement_if_available(&self, variant_id: VariantId, quantity: u32) -> Result<bool> {
        if quantity == 0 {
            return Err(QuantityError::NotPositive { quantity: 0 }.into());
        }
        let mut state = self.state.write().await;
        match state.stock.get_mut(&variant_id) {
            Some(stock) if *stock >= quantity => {
                *stock -= quantity;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, variant_id: VariantId, quantity: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let stock = state.stock_mut(variant_id)?;
        *stock = stock
            .checked_add(quantity)
            .ok_or_else(|| StoreError::Invalid("stock quantity overflow".to_string()))?;
        Ok(())
    }

    async fn set_absolute(&self, variant_id: VariantId, quantity: u32) -> Result<()> {
        let mut state = self.state.write().await;
        *state.stock_mut(variant_id)? = quantity;
        Ok(())
    }

    async fn adjust(
        &self,
        variant_id: VariantId,
        adjustment: StockAdjustment,
    ) -> Result<StockLevel> {
        let mut state = self.state.write().await;
        let stock = state.stock_mut(variant_id)?;
        match adjustment {
            StockAdjustment::Absolute(quantity) => *stock = quantity,
            StockAdjustment::Delta(delta) if delta >= 0 => {
                let next = i64::from(*stock) + delta;
                *stock = u32::try_from(next)
                    .map_err(|_| StoreError::Invalid("stock quantity overflow".to_string()))?;
            }
            StockAdjustment::Delta(delta) => {
                let requested = delta.unsigned_abs();
                if u64::from(*stock) < requested {
                    return Err(StoreError::InsufficientStock(Shortfall {
                        variant_id,
                        requested: u32::try_from(requested).unwrap_or(u32::MAX),
                        available: u64::from(*stock),
                    }));
                }
                // requested <= stock, so it fits in u32
                *stock -= requested as u32;
            }
        }
        state.level(variant_id)
    }

    async fn read(&self, variant_id: VariantId) -> Result<StockLevel> {
        self.state.read().await.level(variant_id)
    }
}

#[async_trait]
impl ReservationStore for InMemoryStore {
    async fn reserve_all(
        &self,
        cart_id: CartId,
        items: Vec<ReservationRequest>,
        expires_at: DateTime<Utc>,
    ) -> Result<Vec<Reservation>> {
        let requests = normalize_requests(items)?;
        if requests.is_empty() {
            return Err(StoreError::Invalid("nothing to reserve".to_string()));
        }

        let mut state = self.state.write().await;
        let status = state.cart_record(cart_id)?.status;
        if !status.can_checkout() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "reserve",
            }
            .into());
        }
        if state.reservations.values().any(|r| r.cart_id == cart_id) {
            return Err(CartError::CheckoutInProgress { cart_id }.into());
        }

        // Check every line before touching anything, in variant order.
        for request in &requests {
            let available = *state
                .stock
                .get(&request.variant_id)
                .ok_or_else(|| StoreError::variant_not_found(request.variant_id))?;
            if available < request.quantity {
                return Err(StoreError::InsufficientStock(Shortfall {
                    variant_id: request.variant_id,
                    requested: request.quantity,
                    available: u64::from(available),
                }));
            }
        }

        let now = Utc::now();
        let mut reservations = Vec::with_capacity(requests.len());
        for request in requests {
            *state.stock_mut(request.variant_id)? -= request.quantity;
            let reservation = Reservation {
                id: ReservationId::new(),
                cart_id,
                variant_id: request.variant_id,
                quantity: request.quantity,
                expires_at,
                created_at: now,
            };
            state
                .reservations
                .insert(reservation.id, reservation.clone());
            reservations.push(reservation);
        }
        Ok(reservations)
    }

    async fn release_all(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        self.state.write().await.release_cart(cart_id)
    }

    async fn release_reservations(&self, ids: &[ReservationId]) -> Result<Vec<Reservation>> {
        self.state
            .write()
            .await
            .release_where(|r| ids.contains(&r.id))
    }

    async fn clear_all(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        Ok(self
            .state
            .write()
            .await
            .take_reservations(|r| r.cart_id == cart_id))
    }

    async fn sum_reserved(&self, variant_id: VariantId) -> Result<u64> {
        Ok(self.state.read().await.reserved(variant_id))
    }

    async fn reservations_for_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let state = self.state.read().await;
        let mut reservations: Vec<Reservation> = state
            .reservations
            .values()
            .filter(|r| r.cart_id == cart_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.variant_id);
        Ok(reservations)
    }

    async fn cancel_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.state
            .write()
            .await
            .release_where(|r| r.id == reservation_id)?
            .pop()
            .ok_or_else(|| StoreError::not_found("reservation", reservation_id))
    }

    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        self.state
            .write()
            .await
            .release_where(|r| r.is_expired(now))
    }
}

#[async_trait]
impl CartStore for InMemoryStore {
    async fn create_cart(&self, session_token: &str, expires_at: DateTime<Utc>) -> Result<Cart> {
        let mut state = self.state.write().await;
        if state
            .carts
            .values()
            .any(|c| c.session_token == session_token)
        {
            return Err(StoreError::Invalid("session token already in use".to_string()));
        }
        let record = CartRecord {
            id: CartId::new(),
            session_token: session_token.to_string(),
            status: CartStatus::Active,
            expires_at,
            created_at: Utc::now(),
            lines: BTreeMap::new(),
        };
        let cart = state.hydrate(&record);
        state.carts.insert(record.id, record);
        Ok(cart)
    }

    async fn get_cart(&self, cart_id: CartId) -> Result<Option<Cart>> {
        let state = self.state.read().await;
        Ok(state.carts.get(&cart_id).map(|r| state.hydrate(r)))
    }

    async fn cart_by_token(&self, session_token: &str) -> Result<Option<Cart>> {
        let state = self.state.read().await;
        Ok(state
            .carts
            .values()
            .find(|c| c.session_token == session_token)
            .map(|r| state.hydrate(r)))
    }

    async fn add_item(
        &self,
        cart_id: CartId,
        variant_id: VariantId,
        quantity: u32,
    ) -> Result<Cart> {
        if quantity == 0 {
            return Err(QuantityError::NotPositive { quantity: 0 }.into());
        }
        let mut state = self.state.write().await;
        let record = state.cart_record(cart_id)?;
        if !record.status.can_modify_items() {
            return Err(CartError::InvalidStateTransition {
                current_state: record.status,
                action: "add item",
            }
            .into());
        }
        let current = record.lines.get(&variant_id).copied().unwrap_or(0);
        let merged = current
            .checked_add(quantity)
            .ok_or_else(|| StoreError::Invalid("quantity overflow".to_string()))?;
        state.variant(variant_id)?.check_quantity(merged)?;

        let record = state
            .carts
            .get_mut(&cart_id)
            .ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        record.lines.insert(variant_id, merged);
        let record = record.clone();
        Ok(state.hydrate(&record))
    }

    async fn remove_item(&self, cart_id: CartId, variant_id: VariantId) -> Result<Cart> {
        let mut state = self.state.write().await;
        let record = state
            .carts
            .get_mut(&cart_id)
            .ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        if !record.status.can_modify_items() {
            return Err(CartError::InvalidStateTransition {
                current_state: record.status,
                action: "remove item",
            }
            .into());
        }
        if record.lines.remove(&variant_id).is_none() {
            return Err(StoreError::not_found("cart item", variant_id));
        }
        let record = record.clone();
        Ok(state.hydrate(&record))
    }

    async fn refresh_expiry(
        &self,
        cart_id: CartId,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut state = self.state.write().await;
        let record = state
            .carts
            .get_mut(&cart_id)
            .ok_or_else(|| StoreError::not_found("cart", cart_id))?;
        record.expires_at = record.expires_at.max(expires_at);
        Ok(record.expires_at)
    }

    async fn abandon_cart(&self, cart_id: CartId) -> Result<bool> {
        let mut state = self.state.write().await;
        state.cart_record(cart_id)?;
        Ok(state.abandon(cart_id))
    }

    async fn delete_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let mut state = self.state.write().await;
        let status = state.cart_record(cart_id)?.status;
        if state.orders.values().any(|o| o.cart_id == cart_id) {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "delete",
            }
            .into());
        }
        let released = state.release_cart(cart_id)?;
        state.carts.remove(&cart_id);
        Ok(released)
    }
}

#[async_trait]
impl OrderStore for InMemoryStore {
    async fn open_order(&self, order: NewOrder) -> Result<Order> {
        let mut state = self.state.write().await;
        if state.order_id_by_session(&order.payment_session_id).is_some() {
            return Err(StoreError::Invalid(format!(
                "payment session {} already has an order",
                order.payment_session_id
            )));
        }
        let cart = state
            .carts
            .get_mut(&order.cart_id)
            .ok_or_else(|| StoreError::not_found("cart", order.cart_id))?;
        if !cart.status.can_checkout() {
            return Err(CartError::InvalidStateTransition {
                current_state: cart.status,
                action: "open order",
            }
            .into());
        }
        cart.status = CartStatus::Ordered;

        let order = order.into_order(Utc::now());
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        Ok(self.state.read().await.orders.get(&order_id).cloned())
    }

    async fn order_by_session(&self, session_id: &str) -> Result<Option<Order>> {
        let state = self.state.read().await;
        Ok(state
            .order_id_by_session(session_id)
            .and_then(|id| state.orders.get(&id).cloned()))
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let state = self.state.read().await;
        Ok(state
            .order_items
            .iter()
            .filter(|i| i.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn payments(&self, order_id: OrderId) -> Result<Vec<PaymentRecord>> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn settle_paid(
        &self,
        session_id: &str,
        settlement: PaidSettlement,
    ) -> Result<SettleOutcome> {
        let mut state = self.state.write().await;
        let order_id = state
            .order_id_by_session(session_id)
            .ok_or_else(|| StoreError::not_found("order", session_id))?;
        let order = state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("order", order_id))?;
        if !order.status.can_settle() {
            return Ok(SettleOutcome::AlreadySettled(order));
        }

        let items: Vec<OrderItem> = state
            .carts
            .get(&order.cart_id)
            .map(|record| state.hydrate(record).items)
            .unwrap_or_default()
            .into_iter()
            .map(|item| OrderItem {
                order_id,
                variant_id: item.variant_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        state.order_items.extend(items);
        state.payments.push(PaymentRecord {
            id: Uuid::new_v4(),
            order_id,
            provider_reference: settlement.provider_reference.clone(),
            amount: settlement.amount_total,
            currency: settlement.currency.clone(),
            created_at: settlement.paid_at,
        });
        let cleared = state.take_reservations(|r| r.cart_id == order.cart_id);

        let stored = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| StoreError::not_found("order", order_id))?;
        stored.status = OrderStatus::Paid;
        stored.amount_total = settlement.amount_total;
        stored.currency = settlement.currency;
        stored.customer_email = settlement.customer_email;
        stored.shipping_details = settlement.shipping_details;
        stored.paid_at = Some(settlement.paid_at);

        Ok(SettleOutcome::Settled {
            order: stored.clone(),
            cleared,
        })
    }

    async fn settle_expired(
        &self,
        session_id: &str,
        cart_hint: Option<CartId>,
    ) -> Result<ExpireOutcome> {
        let mut state = self.state.write().await;
        let mut outcome = ExpireOutcome::default();

        if let Some(order_id) = state.order_id_by_session(session_id)
            && let Some(order) = state.orders.get_mut(&order_id)
        {
            if order.status.can_settle() {
                order.status = OrderStatus::Failed;
                outcome.order_failed = true;
            }
            outcome.order = Some(order.clone());
        }

        if outcome
            .order
            .as_ref()
            .is_some_and(|o| o.status.is_sale_committed())
        {
            return Ok(outcome);
        }

        // A hinted cart that already has an order belongs to that order's session.
        let cart_id = match &outcome.order {
            Some(order) => Some(order.cart_id),
            None => cart_hint.filter(|hint| !state.orders.values().any(|o| o.cart_id == *hint)),
        };
        if let Some(cart_id) = cart_id {
            outcome.released = state.release_cart(cart_id)?;
            outcome.cart_abandoned = state.abandon(cart_id);
        }
        Ok(outcome)
    }
}
