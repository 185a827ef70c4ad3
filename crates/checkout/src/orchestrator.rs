//! Checkout orchestrator: validate, reserve, create remote session, open order.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use common::{CartId, OrderId, ReservationId};
use domain::{Cart, NewOrder, Reservation, ReservationRequest, Shortfall};
use serde::Serialize;
use store::{Store, StoreError};

use crate::context::RequestContext;
use crate::error::{CheckoutError, ErrorKind, Result};
use crate::payment::{CheckoutSessionRequest, GatewayError, LineItem, PaymentGateway};

/// Durations that govern checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutPolicy {
    /// How long reserved stock is held for a payment attempt.
    pub reservation_hold: Duration,
    /// Lifetime of a freshly created cart.
    pub cart_ttl: Duration,
    /// Upper bound on the remote session call.
    pub gateway_timeout: std::time::Duration,
}

impl Default for CheckoutPolicy {
    fn default() -> Self {
        Self {
            reservation_hold: Duration::minutes(30),
            cart_ttl: Duration::hours(24),
            gateway_timeout: std::time::Duration::from_secs(10),
        }
    }
}

/// Input for starting a checkout.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    /// Session token identifying the shopper's cart.
    pub session_token: String,
    pub success_url: String,
    pub cancel_url: String,
}

impl CheckoutRequest {
    fn validate(&self) -> Result<()> {
        if self.session_token.trim().is_empty() {
            return Err(CheckoutError::Validation(
                "session token is required".to_string(),
            ));
        }
        for (field, url) in [
            ("success_url", &self.success_url),
            ("cancel_url", &self.cancel_url),
        ] {
            if !is_absolute_http_url(url) {
                return Err(CheckoutError::Validation(format!(
                    "{field} must be an absolute http(s) URL"
                )));
            }
        }
        Ok(())
    }
}

fn is_absolute_http_url(url: &str) -> bool {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            !host.is_empty() && !host.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

/// A checkout that is waiting for the provider's notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutStarted {
    pub redirect_url: String,
    pub session_id: String,
    pub order_id: OrderId,
    /// When the reservation hold runs out.
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub reservations: Vec<Reservation>,
}

/// Owns the reservations one checkout attempt created until the order that
/// covers them exists.
///
/// Only those reservation ids are released, never the whole cart. Dropping
/// an armed guard (the checkout future was cancelled) spawns the release on
/// the current runtime.
struct ReservationGuard<S: Store + Clone + 'static> {
    store: S,
    cart_id: CartId,
    ids: Vec<ReservationId>,
    armed: bool,
}

impl<S: Store + Clone + 'static> ReservationGuard<S> {
    fn new(store: S, cart_id: CartId, reservations: &[Reservation]) -> Self {
        Self {
            store,
            cart_id,
            ids: reservations.iter().map(|r| r.id).collect(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn release(mut self) {
        self.armed = false;
        let ids = std::mem::take(&mut self.ids);
        release_reservations(&self.store, self.cart_id, &ids).await;
    }
}

impl<S: Store + Clone + 'static> Drop for ReservationGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let cart_id = self.cart_id;
        let ids = std::mem::take(&mut self.ids);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(%cart_id, "checkout cancelled, releasing reservation");
                handle.spawn(async move { release_reservations(&store, cart_id, &ids).await });
            }
            Err(_) => {
                tracing::error!(%cart_id, "no runtime to release reservation; left for the sweeper");
            }
        }
    }
}

async fn release_reservations<S: Store + ?Sized>(
    store: &S,
    cart_id: CartId,
    ids: &[ReservationId],
) {
    match store.release_reservations(ids).await {
        Ok(released) => {
            metrics::counter!("reservations_released_total").increment(released.len() as u64);
            tracing::info!(%cart_id, count = released.len(), "reservation released");
        }
        // The hold expires on its own; the sweeper restores it then.
        Err(e) => tracing::error!(%cart_id, error = %e, "failed to release reservation"),
    }
}

/// Drives a cart from `active` to `ordered` with a pending order.
///
/// Stock is reserved before the remote session exists, so every exit after
/// the reservation either hands it to a pending order or releases it.
#[derive(Clone)]
pub struct CheckoutOrchestrator<S, G> {
    store: S,
    gateway: G,
    policy: CheckoutPolicy,
}

impl<S, G> CheckoutOrchestrator<S, G>
where
    S: Store + Clone + 'static,
    G: PaymentGateway,
{
    /// Creates a new checkout orchestrator.
    pub fn new(store: S, gateway: G, policy: CheckoutPolicy) -> Self {
        Self {
            store,
            gateway,
            policy,
        }
    }

    pub fn policy(&self) -> &CheckoutPolicy {
        &self.policy
    }

    /// Creates an empty cart bound to a session token.
    #[tracing::instrument(skip(self, ctx, session_token), fields(correlation_id = %ctx.correlation_id))]
    pub async fn create_cart(&self, ctx: &RequestContext, session_token: &str) -> Result<Cart> {
        if session_token.trim().is_empty() {
            return Err(CheckoutError::Validation(
                "session token is required".to_string(),
            ));
        }
        let cart = self
            .store
            .create_cart(session_token, ctx.received_at + self.policy.cart_ttl)
            .await?;
        tracing::info!(cart_id = %cart.id, "cart created");
        Ok(cart)
    }

    /// Deletes a cart, restoring the stock its reservations held.
    #[tracing::instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id))]
    pub async fn delete_cart(&self, ctx: &RequestContext, cart_id: CartId) -> Result<Vec<Reservation>> {
        let released = self.store.delete_cart(cart_id).await?;
        metrics::counter!("reservations_released_total").increment(released.len() as u64);
        tracing::info!(count = released.len(), "cart deleted");
        Ok(released)
    }

    /// Administrative cancellation: restore stock and delete the reservation.
    #[tracing::instrument(skip(self, ctx), fields(correlation_id = %ctx.correlation_id))]
    pub async fn cancel_reservation(
        &self,
        ctx: &RequestContext,
        reservation_id: ReservationId,
    ) -> Result<Reservation> {
        let reservation = self.store.cancel_reservation(reservation_id).await?;
        metrics::counter!("reservations_released_total").increment(1);
        tracing::info!(
            variant_id = %reservation.variant_id,
            quantity = reservation.quantity,
            "reservation cancelled"
        );
        Ok(reservation)
    }

    /// Starts a checkout for the cart bound to `request.session_token`.
    #[tracing::instrument(
        skip(self, ctx, request),
        fields(correlation_id = %ctx.correlation_id, cart_id = tracing::field::Empty)
    )]
    pub async fn start_checkout(
        &self,
        ctx: &RequestContext,
        request: CheckoutRequest,
    ) -> Result<CheckoutStarted> {
        metrics::counter!("checkout_started_total").increment(1);
        let started = Instant::now();

        let result = self.run_checkout(ctx, request).await;

        metrics::histogram!("checkout_duration_seconds").record(started.elapsed().as_secs_f64());
        match &result {
            Ok(checkout) => tracing::info!(
                session_id = %checkout.session_id,
                order_id = %checkout.order_id,
                "checkout started"
            ),
            Err(e) => {
                let kind = e.kind();
                metrics::counter!("checkout_failed_total", "reason" => kind.as_str()).increment(1);
                if !e.shortfalls().is_empty() {
                    metrics::counter!("reservation_conflicts_total").increment(1);
                }
                if kind == ErrorKind::Internal {
                    tracing::error!(error = %e, "checkout failed");
                } else {
                    tracing::warn!(error = %e, "checkout rejected");
                }
            }
        }
        result
    }

    async fn run_checkout(
        &self,
        ctx: &RequestContext,
        request: CheckoutRequest,
    ) -> Result<CheckoutStarted> {
        request.validate()?;

        let cart = self
            .store
            .cart_by_token(&request.session_token)
            .await?
            .ok_or(CheckoutError::CartNotFound)?;
        tracing::Span::current().record("cart_id", tracing::field::display(cart.id));

        // 1. Expiry first; the shopper recovers by starting a new cart.
        let now = Utc::now();
        cart.ensure_checkout_ready(now)?;

        // 2. Extend the checkout window whatever the reservation outcome.
        self.store
            .refresh_expiry(cart.id, cart.extended_expiry(now, self.policy.reservation_hold))
            .await?;

        let (amount_total, currency) = cart.total()?;
        let requests = cart.reservation_requests()?;
        self.check_purchase_bounds(&cart).await?;

        // 3. Read-only pre-check reporting every short line.
        self.precheck(&requests).await?;

        // 4. All-or-nothing reservation; the atomic guard is here.
        let hold_until = now + self.policy.reservation_hold;
        let reservations = self
            .store
            .reserve_all(cart.id, requests, hold_until)
            .await?;
        let guard = ReservationGuard::new(self.store.clone(), cart.id, &reservations);

        // 5. Remote session.
        let session_request = CheckoutSessionRequest {
            cart_id: cart.id,
            correlation_token: ctx.correlation_id,
            line_items: cart
                .items
                .iter()
                .map(|item| LineItem {
                    variant_id: item.variant_id,
                    quantity: item.quantity,
                    unit_amount: item.unit_price,
                })
                .collect(),
            currency: currency.clone(),
            success_url: request.success_url,
            cancel_url: request.cancel_url,
            expires_at: hold_until,
        };
        let (session_id, redirect_url) = match self.create_session(session_request).await {
            Ok(session) => session,
            Err(e) => {
                guard.release().await;
                return Err(e.into());
            }
        };

        // 6. Cart ordered + pending order, in one transaction.
        let order = NewOrder {
            id: OrderId::new(),
            cart_id: cart.id,
            payment_session_id: session_id.clone(),
            amount_total,
            currency,
        };
        match self.store.open_order(order).await {
            Ok(order) => {
                guard.disarm();
                Ok(CheckoutStarted {
                    redirect_url,
                    session_id,
                    order_id: order.id,
                    expires_at: hold_until,
                    reservations,
                })
            }
            Err(e) => {
                // No order means the session's webhook will never match; undo now.
                guard.release().await;
                Err(e.into())
            }
        }
    }

    async fn check_purchase_bounds(&self, cart: &Cart) -> Result<()> {
        for item in &cart.items {
            let variant = self
                .store
                .get_variant(item.variant_id)
                .await?
                .ok_or_else(|| StoreError::not_found("variant", item.variant_id))?;
            variant.check_quantity(item.quantity)?;
        }
        Ok(())
    }

    async fn precheck(&self, requests: &[ReservationRequest]) -> Result<()> {
        let mut shortfalls = Vec::new();
        for request in requests {
            let level = self.store.read(request.variant_id).await?;
            if level.available < u64::from(request.quantity) {
                shortfalls.push(Shortfall {
                    variant_id: request.variant_id,
                    requested: request.quantity,
                    available: level.available,
                });
            }
        }
        if shortfalls.is_empty() {
            Ok(())
        } else {
            Err(CheckoutError::InsufficientStock(shortfalls))
        }
    }

    async fn create_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> std::result::Result<(String, String), GatewayError> {
        let timeout = self.policy.gateway_timeout;
        let session = tokio::time::timeout(timeout, self.gateway.create_checkout_session(request))
            .await
            .map_err(|_| GatewayError::Timeout(timeout))??;

        match session.redirect_url {
            Some(url) if !url.trim().is_empty() => Ok((session.id, url)),
            _ => Err(GatewayError::MissingRedirect(session.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(success: &str, cancel: &str) -> CheckoutRequest {
        CheckoutRequest {
            session_token: "tok".to_string(),
            success_url: success.to_string(),
            cancel_url: cancel.to_string(),
        }
    }

    #[test]
    fn test_accepts_absolute_urls() {
        assert!(
            request("https://shop.test/ok?s={id}", "http://localhost:3000/cancel")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_rejects_relative_or_foreign_urls() {
        for bad in ["/ok", "ftp://shop.test", "https://", "https:///path", "shop.test"] {
            assert!(
                matches!(
                    request(bad, "https://shop.test/cancel").validate(),
                    Err(CheckoutError::Validation(_))
                ),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_blank_token() {
        let mut req = request("https://a.test", "https://b.test");
        req.session_token = "  ".to_string();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_default_policy_holds_for_thirty_minutes() {
        assert_eq!(CheckoutPolicy::default().reservation_hold, Duration::minutes(30));
    }
}
