//! HTTP API server with observability for inventory reservation and checkout.
//!
//! Provides REST endpoints for carts, checkout, provider webhooks and stock
//! administration, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use checkout::{
    CheckoutOrchestrator, HttpPaymentGateway, InMemoryPaymentGateway, PaymentGateway, PiiCipher,
    PlaintextCipher, ReservationSweeper, SettlementHandler, WebhookVerifier,
};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Payment provider shared by every request.
pub type Gateway = Arc<dyn PaymentGateway>;
/// PII cipher shared by settlement and order reads.
pub type Cipher = Arc<dyn PiiCipher>;

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store + Clone + 'static> {
    pub store: S,
    pub checkout: CheckoutOrchestrator<S, Gateway>,
    pub settlement: SettlementHandler<S, Cipher>,
    pub sweeper: ReservationSweeper<S>,
    pub cipher: Cipher,
}

impl<S: Store + Clone + 'static> AppState<S> {
    /// Wires the checkout core around one store.
    pub fn new(store: S, gateway: Gateway, cipher: Cipher, config: &Config) -> Self {
        let verifier = config.webhook_secret.as_deref().map(WebhookVerifier::new);
        if verifier.is_none() {
            tracing::warn!("WEBHOOK_SECRET is not set; payment notifications will be rejected");
        }

        Self {
            checkout: CheckoutOrchestrator::new(store.clone(), gateway, config.policy()),
            settlement: SettlementHandler::new(store.clone(), cipher.clone(), verifier),
            sweeper: ReservationSweeper::new(store.clone()),
            store,
            cipher,
        }
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store + Clone + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/carts", post(routes::carts::create::<S>))
        .route("/carts/current", get(routes::carts::current::<S>))
        .route("/carts/current/items", post(routes::carts::add_item::<S>))
        .route(
            "/carts/current/items/{variant_id}",
            delete(routes::carts::remove_item::<S>),
        )
        .route("/carts/{id}", delete(routes::carts::delete::<S>))
        .route("/checkout", post(routes::checkout::start::<S>))
        .route("/webhooks/payments", post(routes::webhooks::payments::<S>))
        .route("/admin/variants", post(routes::inventory::create_variant::<S>))
        .route(
            "/admin/inventory/{variant_id}",
            get(routes::inventory::read::<S>).put(routes::inventory::update::<S>),
        )
        .route(
            "/admin/reservations/sweep",
            post(routes::reservations::sweep::<S>),
        )
        .route(
            "/admin/reservations/{id}",
            delete(routes::reservations::cancel::<S>),
        )
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates the application state, choosing the payment gateway from configuration.
///
/// Without `PAYMENT_API_BASE` and `PAYMENT_API_KEY` the in-memory gateway is used.
pub fn create_default_state<S: Store + Clone + 'static>(
    store: S,
    config: &Config,
) -> Arc<AppState<S>> {
    let gateway: Gateway = match config.payment_api() {
        Some((base_url, api_key)) => Arc::new(HttpPaymentGateway::new(base_url, api_key)),
        None => {
            tracing::warn!("payment provider not configured; using the in-memory gateway");
            Arc::new(InMemoryPaymentGateway::new())
        }
    };
    let cipher: Cipher = Arc::new(PlaintextCipher);

    Arc::new(AppState::new(store, gateway, cipher, config))
}
