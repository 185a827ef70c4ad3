use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, OrderId, ReservationId, VariantId};
use domain::{
    Cart, CartError, CartItem, CartStatus, Money, NewOrder, Order, OrderItem, OrderStatus,
    PaidSettlement, PaymentRecord, QuantityError, Reservation, ReservationRequest, Shortfall,
    StockAdjustment, StockLevel, Variant, normalize_requests,
};
use sqlx::{
    PgConnection, PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};
use uuid::Uuid;

use crate::{
    Result, StoreError,
    store::{
        CartStore, ExpireOutcome, InventoryLedger, OrderStore, ReservationStore, SettleOutcome,
    },
};

macro_rules! reservation_columns {
    () => {
        "id, cart_id, variant_id, quantity, expires_at, created_at"
    };
}

macro_rules! order_columns {
    () => {
        "id, cart_id, payment_session_id, status, amount_total_cents, currency, \
         customer_email, shipping_details, created_at, paid_at"
    };
}

/// PostgreSQL-backed store implementation.
///
/// Multi-row operations run in one transaction; stock is only ever changed
/// through conditional updates on the `inventory` row.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool to `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn to_db_quantity(quantity: u32) -> Result<i32> {
    i32::try_from(quantity)
        .map_err(|_| StoreError::Invalid(format!("quantity {quantity} is too large")))
}

fn from_db_quantity(quantity: i32) -> Result<u32> {
    u32::try_from(quantity)
        .map_err(|_| StoreError::Corrupt(format!("negative quantity {quantity}")))
}

fn optional_bound(bound: Option<u32>) -> Result<Option<i32>> {
    bound.map(to_db_quantity).transpose()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn row_to_variant(row: &PgRow) -> Result<Variant> {
    let min: Option<i32> = row.try_get("min_purchase_quantity")?;
    let max: Option<i32> = row.try_get("max_purchase_quantity")?;
    Ok(Variant {
        id: VariantId::from_uuid(row.try_get::<Uuid, _>("id")?),
        sku: row.try_get("sku")?,
        name: row.try_get("name")?,
        price: Money::from_cents(row.try_get("price_cents")?),
        currency: row.try_get("currency")?,
        min_purchase_quantity: min.map(from_db_quantity).transpose()?,
        max_purchase_quantity: max.map(from_db_quantity).transpose()?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
        cart_id: CartId::from_uuid(row.try_get::<Uuid, _>("cart_id")?),
        variant_id: VariantId::from_uuid(row.try_get::<Uuid, _>("variant_id")?),
        quantity: from_db_quantity(row.try_get("quantity")?)?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_order(row: &PgRow) -> Result<Order> {
    let status: String = row.try_get("status")?;
    Ok(Order {
        id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
        cart_id: CartId::from_uuid(row.try_get::<Uuid, _>("cart_id")?),
        payment_session_id: row.try_get("payment_session_id")?,
        status: status.parse::<OrderStatus>().map_err(StoreError::Corrupt)?,
        amount_total: Money::from_cents(row.try_get("amount_total_cents")?),
        currency: row.try_get("currency")?,
        customer_email: row.try_get("customer_email")?,
        shipping_details: row.try_get("shipping_details")?,
        created_at: row.try_get("created_at")?,
        paid_at: row.try_get("paid_at")?,
    })
}

fn sorted(mut reservations: Vec<Reservation>) -> Vec<Reservation> {
    reservations.sort_by_key(|r| (r.variant_id, r.id));
    reservations
}

async fn fetch_variant(conn: &mut PgConnection, variant_id: VariantId) -> Result<Option<Variant>> {
    let row = sqlx::query(
        r#"
        SELECT id, sku, name, price_cents, currency, min_purchase_quantity, max_purchase_quantity
        FROM variants
        WHERE id = $1
        "#,
    )
    .bind(variant_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_to_variant).transpose()
}

async fn fetch_ledger_quantity(conn: &mut PgConnection, variant_id: VariantId) -> Result<Option<u32>> {
    let quantity: Option<i32> =
        sqlx::query_scalar("SELECT stock_quantity FROM inventory WHERE variant_id = $1")
            .bind(variant_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
    quantity.map(from_db_quantity).transpose()
}

/// The single conditional decrement every stock removal goes through.
async fn decrement_in(conn: &mut PgConnection, variant_id: VariantId, quantity: u32) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE inventory
        SET stock_quantity = stock_quantity - $2, updated_at = NOW()
        WHERE variant_id = $1 AND stock_quantity >= $2
        "#,
    )
    .bind(variant_id.as_uuid())
    .bind(to_db_quantity(quantity)?)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Explains a declined decrement: a missing variant or a shortfall.
async fn decline_reason(
    conn: &mut PgConnection,
    variant_id: VariantId,
    requested: u32,
) -> Result<StoreError> {
    Ok(match fetch_ledger_quantity(conn, variant_id).await? {
        Some(available) => StoreError::InsufficientStock(Shortfall {
            variant_id,
            requested,
            available: u64::from(available),
        }),
        None => StoreError::variant_not_found(variant_id),
    })
}

async fn increment_in(conn: &mut PgConnection, variant_id: VariantId, quantity: u32) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE inventory
        SET stock_quantity = stock_quantity + $2, updated_at = NOW()
        WHERE variant_id = $1
        "#,
    )
    .bind(variant_id.as_uuid())
    .bind(to_db_quantity(quantity)?)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::not_found("inventory", variant_id));
    }
    Ok(())
}

/// Adds released quantities back, one update per variant in ascending order.
async fn restore_in(conn: &mut PgConnection, reservations: &[Reservation]) -> Result<()> {
    let mut per_variant: BTreeMap<VariantId, u32> = BTreeMap::new();
    for r in reservations {
        *per_variant.entry(r.variant_id).or_default() += r.quantity;
    }
    for (variant_id, quantity) in per_variant {
        increment_in(conn, variant_id, quantity).await?;
    }
    Ok(())
}

async fn delete_cart_reservations(
    conn: &mut PgConnection,
    cart_id: CartId,
) -> Result<Vec<Reservation>> {
    let rows = sqlx::query(concat!(
        "DELETE FROM reservations WHERE cart_id = $1 RETURNING ",
        reservation_columns!()
    ))
    .bind(cart_id.as_uuid())
    .fetch_all(&mut *conn)
    .await?;

    let reservations = rows
        .iter()
        .map(row_to_reservation)
        .collect::<Result<Vec<_>>>()?;
    Ok(sorted(reservations))
}

async fn release_cart_in(conn: &mut PgConnection, cart_id: CartId) -> Result<Vec<Reservation>> {
    let released = delete_cart_reservations(conn, cart_id).await?;
    restore_in(conn, &released).await?;
    Ok(released)
}

async fn abandon_in(conn: &mut PgConnection, cart_id: CartId) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE carts SET status = 'abandoned' WHERE id = $1 AND status IN ('active', 'ordered')",
    )
    .bind(cart_id.as_uuid())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Locks a cart named only by event metadata and returns it if no order exists
/// for it. A cart with an order belongs to that order's session.
async fn unordered_cart(conn: &mut PgConnection, cart_id: CartId) -> Result<Option<CartId>> {
    let locked: Option<String> =
        sqlx::query_scalar("SELECT status FROM carts WHERE id = $1 FOR UPDATE")
            .bind(cart_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
    if locked.is_none() {
        return Ok(None);
    }
    let has_order: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM orders WHERE cart_id = $1)")
            .bind(cart_id.as_uuid())
            .fetch_one(&mut *conn)
            .await?;
    Ok((!has_order).then_some(cart_id))
}

/// Locks the cart row and returns its status.
async fn lock_cart_status(conn: &mut PgConnection, cart_id: CartId) -> Result<CartStatus> {
    let status: Option<String> =
        sqlx::query_scalar("SELECT status FROM carts WHERE id = $1 FOR UPDATE")
            .bind(cart_id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
    status
        .ok_or_else(|| StoreError::not_found("cart", cart_id))?
        .parse::<CartStatus>()
        .map_err(StoreError::Corrupt)
}

async fn fetch_cart_items(conn: &mut PgConnection, cart_id: CartId) -> Result<Vec<CartItem>> {
    let rows = sqlx::query(
        r#"
        SELECT ci.variant_id, ci.quantity, v.price_cents, v.currency
        FROM cart_items ci
        JOIN variants v ON v.id = ci.variant_id
        WHERE ci.cart_id = $1
        ORDER BY ci.variant_id ASC
        "#,
    )
    .bind(cart_id.as_uuid())
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(CartItem {
                variant_id: VariantId::from_uuid(row.try_get::<Uuid, _>("variant_id")?),
                quantity: from_db_quantity(row.try_get("quantity")?)?,
                unit_price: Money::from_cents(row.try_get("price_cents")?),
                currency: row.try_get("currency")?,
            })
        })
        .collect()
}

async fn fetch_cart_where(
    conn: &mut PgConnection,
    column: &'static str,
    key: CartKey<'_>,
) -> Result<Option<Cart>> {
    let sql = format!(
        "SELECT id, session_token, status, expires_at, created_at FROM carts WHERE {column} = $1"
    );
    let query = sqlx::query(&sql);
    let query = match key {
        CartKey::Id(id) => query.bind(id.as_uuid()),
        CartKey::Token(token) => query.bind(token),
    };
    let Some(row) = query.fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };

    let id = CartId::from_uuid(row.try_get::<Uuid, _>("id")?);
    let status: String = row.try_get("status")?;
    let items = fetch_cart_items(conn, id).await?;
    Ok(Some(Cart {
        id,
        session_token: row.try_get("session_token")?,
        status: status.parse::<CartStatus>().map_err(StoreError::Corrupt)?,
        expires_at: row.try_get("expires_at")?,
        items,
        created_at: row.try_get("created_at")?,
    }))
}

enum CartKey<'a> {
    Id(CartId),
    Token(&'a str),
}

async fn fetch_cart(conn: &mut PgConnection, cart_id: CartId) -> Result<Cart> {
    fetch_cart_where(conn, "id", CartKey::Id(cart_id))
        .await?
        .ok_or_else(|| StoreError::not_found("cart", cart_id))
}

async fn lock_order_by_session(conn: &mut PgConnection, session_id: &str) -> Result<Option<Order>> {
    let row = sqlx::query(concat!(
        "SELECT ",
        order_columns!(),
        " FROM orders WHERE payment_session_id = $1 FOR UPDATE"
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_order).transpose()
}

#[async_trait]
impl InventoryLedger for PostgresStore {
    async fn create_variant(&self, variant: Variant, initial_stock: u32) -> Result<Variant> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO variants (id, sku, name, price_cents, currency, min_purchase_quantity, max_purchase_quantity)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(variant.id.as_uuid())
        .bind(&variant.sku)
        .bind(&variant.name)
        .bind(variant.price.cents())
        .bind(&variant.currency)
        .bind(optional_bound(variant.min_purchase_quantity)?)
        .bind(optional_bound(variant.max_purchase_quantity)?)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Invalid(format!("sku {} already exists", variant.sku));
            }
            StoreError::Database(e)
        })?;

        sqlx::query("INSERT INTO inventory (variant_id, stock_quantity) VALUES ($1, $2)")
            .bind(variant.id.as_uuid())
            .bind(to_db_quantity(initial_stock)?)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(variant)
    }

    async fn get_variant(&self, variant_id: VariantId) -> Result<Option<Variant>> {
        let mut conn = self.pool.acquire().await?;
        fetch_variant(&mut conn, variant_id).await
    }

    async fn decrement_if_available(&self, variant_id: VariantId, quantity: u32) -> Result<bool> {
        if quantity == 0 {
            return Err(QuantityError::NotPositive { quantity: 0 }.into());
        }
        let mut conn = self.pool.acquire().await?;
        decrement_in(&mut conn, variant_id, quantity).await
    }

    async fn increment(&self, variant_id: VariantId, quantity: u32) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        increment_in(&mut conn, variant_id, quantity).await
    }

    async fn set_absolute(&self, variant_id: VariantId, quantity: u32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE inventory SET stock_quantity = $2, updated_at = NOW() WHERE variant_id = $1",
        )
        .bind(variant_id.as_uuid())
        .bind(to_db_quantity(quantity)?)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("inventory", variant_id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn adjust(
        &self,
        variant_id: VariantId,
        adjustment: StockAdjustment,
    ) -> Result<StockLevel> {
        match adjustment {
            StockAdjustment::Absolute(quantity) => self.set_absolute(variant_id, quantity).await?,
            StockAdjustment::Delta(delta) if delta >= 0 => {
                let quantity = u32::try_from(delta)
                    .map_err(|_| StoreError::Invalid(format!("delta {delta} is too large")))?;
                self.increment(variant_id, quantity).await?;
            }
            StockAdjustment::Delta(delta) => {
                let quantity = u32::try_from(delta.unsigned_abs())
                    .map_err(|_| StoreError::Invalid(format!("delta {delta} is too large")))?;
                let mut conn = self.pool.acquire().await?;
                if !decrement_in(&mut conn, variant_id, quantity).await? {
                    return Err(decline_reason(&mut conn, variant_id, quantity).await?);
                }
            }
        }
        self.read(variant_id).await
    }

    async fn read(&self, variant_id: VariantId) -> Result<StockLevel> {
        let row = sqlx::query(
            r#"
            SELECT i.stock_quantity,
                   COALESCE((SELECT SUM(r.quantity) FROM reservations r WHERE r.variant_id = i.variant_id), 0)::BIGINT AS reserved
            FROM inventory i
            WHERE i.variant_id = $1
            "#,
        )
        .bind(variant_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("inventory", variant_id))?;

        let ledger = from_db_quantity(row.try_get("stock_quantity")?)?;
        let reserved: i64 = row.try_get("reserved")?;
        let reserved = u64::try_from(reserved)
            .map_err(|_| StoreError::Corrupt(format!("negative reserved sum {reserved}")))?;
        Ok(StockLevel::from_ledger(variant_id, ledger, reserved))
    }
}

#[async_trait]
impl ReservationStore for PostgresStore {
    #[tracing::instrument(skip(self, items))]
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

        let mut tx = self.pool.begin().await?;

        let status = lock_cart_status(&mut tx, cart_id).await?;
        if !status.can_checkout() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "reserve",
            }
            .into());
        }
        let holding: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM reservations WHERE cart_id = $1)")
                .bind(cart_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        if holding {
            return Err(CartError::CheckoutInProgress { cart_id }.into());
        }

        let mut reservations = Vec::with_capacity(requests.len());
        for request in requests {
            if !decrement_in(&mut tx, request.variant_id, request.quantity).await? {
                let reason = decline_reason(&mut tx, request.variant_id, request.quantity).await?;
                tracing::debug!(variant_id = %request.variant_id, "reservation declined");
                // Dropping the transaction rolls back the earlier decrements.
                return Err(reason);
            }

            let row = sqlx::query(concat!(
                "INSERT INTO reservations (id, cart_id, variant_id, quantity, expires_at) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING ",
                reservation_columns!()
            ))
            .bind(ReservationId::new().as_uuid())
            .bind(cart_id.as_uuid())
            .bind(request.variant_id.as_uuid())
            .bind(to_db_quantity(request.quantity)?)
            .bind(expires_at)
            .fetch_one(&mut *tx)
            .await?;
            reservations.push(row_to_reservation(&row)?);
        }

        tx.commit().await?;
        Ok(reservations)
    }

    async fn release_all(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let mut tx = self.pool.begin().await?;
        let released = release_cart_in(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(released)
    }

    async fn release_reservations(&self, ids: &[ReservationId]) -> Result<Vec<Reservation>> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.as_uuid()).collect();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(concat!(
            "DELETE FROM reservations WHERE id = ANY($1) RETURNING ",
            reservation_columns!()
        ))
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;
        let released = sorted(
            rows.iter()
                .map(row_to_reservation)
                .collect::<Result<Vec<_>>>()?,
        );
        restore_in(&mut tx, &released).await?;

        tx.commit().await?;
        Ok(released)
    }

    async fn clear_all(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let mut conn = self.pool.acquire().await?;
        delete_cart_reservations(&mut conn, cart_id).await
    }

    async fn sum_reserved(&self, variant_id: VariantId) -> Result<u64> {
        let sum: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(quantity), 0)::BIGINT FROM reservations WHERE variant_id = $1",
        )
        .bind(variant_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        u64::try_from(sum).map_err(|_| StoreError::Corrupt(format!("negative reserved sum {sum}")))
    }

    async fn reservations_for_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            reservation_columns!(),
            " FROM reservations WHERE cart_id = $1 ORDER BY variant_id ASC"
        ))
        .bind(cart_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_reservation).collect()
    }

    async fn cancel_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(concat!(
            "DELETE FROM reservations WHERE id = $1 RETURNING ",
            reservation_columns!()
        ))
        .bind(reservation_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::not_found("reservation", reservation_id))?;
        let reservation = row_to_reservation(&row)?;
        restore_in(&mut tx, std::slice::from_ref(&reservation)).await?;

        tx.commit().await?;
        Ok(reservation)
    }

    #[tracing::instrument(skip(self))]
    async fn release_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let mut tx = self.pool.begin().await?;

        // Rows held by an in-flight settlement are skipped, not waited on.
        let rows = sqlx::query(concat!(
            r#"
            DELETE FROM reservations
            WHERE id IN (
                SELECT id FROM reservations
                WHERE expires_at <= $1
                ORDER BY variant_id
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            reservation_columns!()
        ))
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let released = sorted(
            rows.iter()
                .map(row_to_reservation)
                .collect::<Result<Vec<_>>>()?,
        );
        restore_in(&mut tx, &released).await?;

        tx.commit().await?;
        Ok(released)
    }
}

#[async_trait]
impl CartStore for PostgresStore {
    async fn create_cart(&self, session_token: &str, expires_at: DateTime<Utc>) -> Result<Cart> {
        let cart = Cart::new(session_token, expires_at);

        sqlx::query(
            r#"
            INSERT INTO carts (id, session_token, status, expires_at, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(cart.id.as_uuid())
        .bind(&cart.session_token)
        .bind(cart.status.as_str())
        .bind(cart.expires_at)
        .bind(cart.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Invalid("session token already in use".to_string());
            }
            StoreError::Database(e)
        })?;

        Ok(cart)
    }

    async fn get_cart(&self, cart_id: CartId) -> Result<Option<Cart>> {
        let mut conn = self.pool.acquire().await?;
        fetch_cart_where(&mut conn, "id", CartKey::Id(cart_id)).await
    }

    async fn cart_by_token(&self, session_token: &str) -> Result<Option<Cart>> {
        let mut conn = self.pool.acquire().await?;
        fetch_cart_where(&mut conn, "session_token", CartKey::Token(session_token)).await
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
        let mut tx = self.pool.begin().await?;

        let status = lock_cart_status(&mut tx, cart_id).await?;
        if !status.can_modify_items() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "add item",
            }
            .into());
        }
        let variant = fetch_variant(&mut tx, variant_id)
            .await?
            .ok_or_else(|| StoreError::variant_not_found(variant_id))?;

        let current: Option<i32> = sqlx::query_scalar(
            "SELECT quantity FROM cart_items WHERE cart_id = $1 AND variant_id = $2",
        )
        .bind(cart_id.as_uuid())
        .bind(variant_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;
        let current = current.map(from_db_quantity).transpose()?.unwrap_or(0);
        let merged = current
            .checked_add(quantity)
            .ok_or_else(|| StoreError::Invalid("quantity overflow".to_string()))?;
        variant.check_quantity(merged)?;

        sqlx::query(
            r#"
            INSERT INTO cart_items (cart_id, variant_id, quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (cart_id, variant_id) DO UPDATE SET quantity = EXCLUDED.quantity
            "#,
        )
        .bind(cart_id.as_uuid())
        .bind(variant_id.as_uuid())
        .bind(to_db_quantity(merged)?)
        .execute(&mut *tx)
        .await?;

        let cart = fetch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn remove_item(&self, cart_id: CartId, variant_id: VariantId) -> Result<Cart> {
        let mut tx = self.pool.begin().await?;

        let status = lock_cart_status(&mut tx, cart_id).await?;
        if !status.can_modify_items() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "remove item",
            }
            .into());
        }

        let result = sqlx::query("DELETE FROM cart_items WHERE cart_id = $1 AND variant_id = $2")
            .bind(cart_id.as_uuid())
            .bind(variant_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("cart item", variant_id));
        }

        let cart = fetch_cart(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(cart)
    }

    async fn refresh_expiry(
        &self,
        cart_id: CartId,
        expires_at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let effective: Option<DateTime<Utc>> = sqlx::query_scalar(
            "UPDATE carts SET expires_at = GREATEST(expires_at, $2) WHERE id = $1 RETURNING expires_at",
        )
        .bind(cart_id.as_uuid())
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        effective.ok_or_else(|| StoreError::not_found("cart", cart_id))
    }

    async fn abandon_cart(&self, cart_id: CartId) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        lock_cart_status(&mut tx, cart_id).await?;
        let changed = abandon_in(&mut tx, cart_id).await?;
        tx.commit().await?;
        Ok(changed)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_cart(&self, cart_id: CartId) -> Result<Vec<Reservation>> {
        let mut tx = self.pool.begin().await?;

        let status = lock_cart_status(&mut tx, cart_id).await?;
        let has_order: Option<i32> = sqlx::query_scalar("SELECT 1 FROM orders WHERE cart_id = $1")
            .bind(cart_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        if has_order.is_some() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "delete",
            }
            .into());
        }

        let released = release_cart_in(&mut tx, cart_id).await?;
        sqlx::query("DELETE FROM carts WHERE id = $1")
            .bind(cart_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(released)
    }
}

#[async_trait]
impl OrderStore for PostgresStore {
    async fn open_order(&self, order: NewOrder) -> Result<Order> {
        let mut tx = self.pool.begin().await?;

        let status = lock_cart_status(&mut tx, order.cart_id).await?;
        if !status.can_checkout() {
            return Err(CartError::InvalidStateTransition {
                current_state: status,
                action: "open order",
            }
            .into());
        }
        sqlx::query("UPDATE carts SET status = 'ordered' WHERE id = $1")
            .bind(order.cart_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        let session_id = order.payment_session_id.clone();
        let order = order.into_order(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO orders (id, cart_id, payment_session_id, status, amount_total_cents, currency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.cart_id.as_uuid())
        .bind(&order.payment_session_id)
        .bind(order.status.as_str())
        .bind(order.amount_total.cents())
        .bind(&order.currency)
        .bind(order.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                return StoreError::Invalid(format!(
                    "payment session {session_id} already has an order"
                ));
            }
            StoreError::Database(e)
        })?;

        tx.commit().await?;
        Ok(order)
    }

    async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE id = $1"
        ))
        .bind(order_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn order_by_session(&self, session_id: &str) -> Result<Option<Order>> {
        let row = sqlx::query(concat!(
            "SELECT ",
            order_columns!(),
            " FROM orders WHERE payment_session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_order).transpose()
    }

    async fn order_items(&self, order_id: OrderId) -> Result<Vec<OrderItem>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, variant_id, quantity, unit_price_cents
            FROM order_items
            WHERE order_id = $1
            ORDER BY variant_id ASC
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(OrderItem {
                    order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
                    variant_id: VariantId::from_uuid(row.try_get::<Uuid, _>("variant_id")?),
                    quantity: from_db_quantity(row.try_get("quantity")?)?,
                    unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
                })
            })
            .collect()
    }

    async fn payments(&self, order_id: OrderId) -> Result<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, provider_reference, amount_cents, currency, created_at
            FROM payments
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(PaymentRecord {
                    id: row.try_get("id")?,
                    order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
                    provider_reference: row.try_get("provider_reference")?,
                    amount: Money::from_cents(row.try_get("amount_cents")?),
                    currency: row.try_get("currency")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self, settlement))]
    async fn settle_paid(
        &self,
        session_id: &str,
        settlement: PaidSettlement,
    ) -> Result<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        // The row lock serializes duplicate deliveries of the same notification.
        let order = lock_order_by_session(&mut tx, session_id)
            .await?
            .ok_or_else(|| StoreError::not_found("order", session_id))?;
        if !order.status.can_settle() {
            return Ok(SettleOutcome::AlreadySettled(order));
        }

        let row = sqlx::query(concat!(
            r#"
            UPDATE orders
            SET status = 'paid', amount_total_cents = $2, currency = $3,
                customer_email = $4, shipping_details = $5, paid_at = $6
            WHERE id = $1
            RETURNING "#,
            order_columns!()
        ))
        .bind(order.id.as_uuid())
        .bind(settlement.amount_total.cents())
        .bind(&settlement.currency)
        .bind(&settlement.customer_email)
        .bind(&settlement.shipping_details)
        .bind(settlement.paid_at)
        .fetch_one(&mut *tx)
        .await?;
        let paid = row_to_order(&row)?;

        sqlx::query(
            r#"
            INSERT INTO order_items (order_id, variant_id, quantity, unit_price_cents)
            SELECT $1, ci.variant_id, ci.quantity, v.price_cents
            FROM cart_items ci
            JOIN variants v ON v.id = ci.variant_id
            WHERE ci.cart_id = $2
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.cart_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO payments (id, order_id, provider_reference, amount_cents, currency, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(order.id.as_uuid())
        .bind(&settlement.provider_reference)
        .bind(settlement.amount_total.cents())
        .bind(&settlement.currency)
        .bind(settlement.paid_at)
        .execute(&mut *tx)
        .await?;

        let cleared = delete_cart_reservations(&mut tx, order.cart_id).await?;

        tx.commit().await?;
        Ok(SettleOutcome::Settled {
            order: paid,
            cleared,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn settle_expired(
        &self,
        session_id: &str,
        cart_hint: Option<CartId>,
    ) -> Result<ExpireOutcome> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ExpireOutcome::default();

        if let Some(order) = lock_order_by_session(&mut tx, session_id).await? {
            if order.status.can_settle() {
                let row = sqlx::query(concat!(
                    "UPDATE orders SET status = 'failed' WHERE id = $1 RETURNING ",
                    order_columns!()
                ))
                .bind(order.id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
                outcome.order = Some(row_to_order(&row)?);
                outcome.order_failed = true;
            } else {
                outcome.order = Some(order);
            }
        }

        if outcome
            .order
            .as_ref()
            .is_some_and(|o| o.status.is_sale_committed())
        {
            return Ok(outcome);
        }

        let cart_id = match (&outcome.order, cart_hint) {
            (Some(order), _) => Some(order.cart_id),
            (None, Some(hint)) => unordered_cart(&mut tx, hint).await?,
            (None, None) => None,
        };
        if let Some(cart_id) = cart_id {
            outcome.released = release_cart_in(&mut tx, cart_id).await?;
            outcome.cart_abandoned = abandon_in(&mut tx, cart_id).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }
}
