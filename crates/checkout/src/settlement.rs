//! Settlement of payment provider notifications.

use chrono::Utc;
use common::OrderId;
use domain::{Money, OrderStatus, PaidSettlement};
use serde::Serialize;
use store::{SettleOutcome, Store, StoreError};

use crate::cipher::PiiCipher;
use crate::context::RequestContext;
use crate::error::{CheckoutError, Result};
use crate::events::{NotificationKind, ProviderEvent, SessionPayload};
use crate::signature::WebhookVerifier;

/// What a notification did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// The order became paid and its holds became a sale.
    Completed { order_id: OrderId, cleared: usize },
    /// A duplicate or late completion; nothing changed.
    AlreadySettled {
        order_id: OrderId,
        status: OrderStatus,
    },
    /// The checkout ran out; held stock was restored.
    Expired {
        order_id: Option<OrderId>,
        order_failed: bool,
        released: usize,
        cart_abandoned: bool,
    },
    /// An event kind settlement does not act on.
    Ignored { kind: String },
}

/// Applies completion and expiration notifications.
///
/// Both are idempotent: the store locks the order row and only a `pending`
/// order can change, so duplicate and reordered deliveries converge.
pub struct SettlementHandler<S, C> {
    store: S,
    cipher: C,
    verifier: Option<WebhookVerifier>,
}

impl<S, C> SettlementHandler<S, C>
where
    S: Store,
    C: PiiCipher,
{
    /// Creates a settlement handler.
    ///
    /// Without a verifier, [`handle_signed`](Self::handle_signed) rejects every body.
    pub fn new(store: S, cipher: C, verifier: Option<WebhookVerifier>) -> Self {
        Self {
            store,
            cipher,
            verifier,
        }
    }

    /// Verifies the signature over the raw body, then parses and applies it.
    pub async fn handle_signed(
        &self,
        ctx: &RequestContext,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<SettlementOutcome> {
        let verifier = self.verifier.as_ref().ok_or_else(|| {
            CheckoutError::Validation("webhook signing secret is not configured".to_string())
        })?;
        let signature = signature.ok_or(CheckoutError::InvalidSignature)?;
        verifier.verify(body, signature)?;

        let event = ProviderEvent::parse(body)?;
        self.handle(ctx, event).await
    }

    /// Applies a parsed notification.
    #[tracing::instrument(
        skip(self, ctx, event),
        fields(correlation_id = %ctx.correlation_id, event_id = %event.id, kind = %event.event_type)
    )]
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        event: ProviderEvent,
    ) -> Result<SettlementOutcome> {
        let kind = event.kind();
        metrics::counter!("settlement_events_total", "kind" => kind.as_str().to_string())
            .increment(1);

        match kind {
            NotificationKind::Completed => self.complete(event.session()?).await,
            NotificationKind::Expired => self.expire(event.session()?).await,
            NotificationKind::Other(kind) => {
                tracing::info!(%kind, "unhandled event kind");
                Ok(SettlementOutcome::Ignored { kind })
            }
        }
    }

    async fn complete(&self, session: SessionPayload) -> Result<SettlementOutcome> {
        let order = self
            .store
            .order_by_session(&session.id)
            .await?
            .ok_or_else(|| CheckoutError::UnknownSession(session.id.clone()))?;

        let customer_email = session
            .customer_email
            .as_deref()
            .map(|email| self.cipher.encrypt(email))
            .transpose()?;
        let shipping_details = session
            .shipping_text()
            .map(|details| self.cipher.encrypt(&details))
            .transpose()?;

        let settlement = PaidSettlement {
            amount_total: session
                .amount_total
                .map(Money::from_cents)
                .unwrap_or(order.amount_total),
            currency: session.currency.clone().unwrap_or(order.currency),
            customer_email,
            shipping_details,
            provider_reference: session
                .payment_intent
                .clone()
                .unwrap_or_else(|| session.id.clone()),
            paid_at: Utc::now(),
        };

        match self.store.settle_paid(&session.id, settlement).await {
            Ok(SettleOutcome::Settled { order, cleared }) => {
                tracing::info!(order_id = %order.id, cleared = cleared.len(), "order paid");
                Ok(SettlementOutcome::Completed {
                    order_id: order.id,
                    cleared: cleared.len(),
                })
            }
            Ok(SettleOutcome::AlreadySettled(order)) => {
                tracing::info!(order_id = %order.id, status = %order.status, "duplicate completion ignored");
                Ok(SettlementOutcome::AlreadySettled {
                    order_id: order.id,
                    status: order.status,
                })
            }
            Err(StoreError::NotFound { .. }) => Err(CheckoutError::UnknownSession(session.id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn expire(&self, session: SessionPayload) -> Result<SettlementOutcome> {
        let outcome = self
            .store
            .settle_expired(&session.id, session.cart_id())
            .await?;

        metrics::counter!("reservations_released_total").increment(outcome.released.len() as u64);
        let order_id = outcome.order.as_ref().map(|o| o.id);
        match &outcome.order {
            Some(order) if order.status.is_sale_committed() => {
                tracing::warn!(order_id = %order.id, "expiry after payment ignored");
            }
            Some(order) => tracing::info!(order_id = %order.id, released = outcome.released.len(), "checkout expired"),
            None => tracing::info!(released = outcome.released.len(), "checkout expired without an order"),
        }

        Ok(SettlementOutcome::Expired {
            order_id,
            order_failed: outcome.order_failed,
            released: outcome.released.len(),
            cart_abandoned: outcome.cart_abandoned,
        })
    }
}
