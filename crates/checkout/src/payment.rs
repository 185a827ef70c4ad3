//! Payment gateway trait and implementations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CartId, VariantId};
use domain::Money;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned by a payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The HTTP request could not be completed.
    #[error("Payment provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The provider answered with a non-success status.
    #[error("Payment provider returned {status}: {body}")]
    Api { status: u16, body: String },

    /// The provider did not answer in time.
    #[error("Payment provider did not respond within {0:?}")]
    Timeout(Duration),

    /// The session was created but has no redirect target.
    #[error("Payment session {0} has no redirect URL")]
    MissingRedirect(String),

    /// The provider refused to create a session.
    #[error("Payment provider declined: {0}")]
    Declined(String),
}

/// One priced line sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItem {
    pub variant_id: VariantId,
    pub quantity: u32,
    pub unit_amount: Money,
}

/// Everything the provider needs to open a hosted checkout page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub cart_id: CartId,
    /// Echoed back in event metadata to correlate logs across systems.
    pub correlation_token: Uuid,
    pub line_items: Vec<LineItem>,
    pub currency: String,
    pub success_url: String,
    pub cancel_url: String,
    pub expires_at: DateTime<Utc>,
}

/// A session created by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteSession {
    pub id: String,
    #[serde(rename = "url", default)]
    pub redirect_url: Option<String>,
}

/// Opaque "create remote checkout session" capability.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<RemoteSession, GatewayError>;
}

#[async_trait]
impl<T: PaymentGateway + ?Sized> PaymentGateway for Arc<T> {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<RemoteSession, GatewayError> {
        (**self).create_checkout_session(request).await
    }
}

#[derive(Serialize)]
struct SessionBody<'a> {
    mode: &'static str,
    currency: &'a str,
    line_items: &'a [LineItem],
    success_url: &'a str,
    cancel_url: &'a str,
    expires_at: i64,
    metadata: SessionMetadata,
}

#[derive(Serialize)]
struct SessionMetadata {
    cart_id: String,
    correlation_token: String,
}

/// JSON-over-HTTP client for the payment provider.
#[derive(Debug, Clone)]
pub struct HttpPaymentGateway {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[tracing::instrument(skip(self, request), fields(cart_id = %request.cart_id))]
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<RemoteSession, GatewayError> {
        let url = format!("{}/v1/checkout/sessions", self.base_url);
        let body = SessionBody {
            mode: "payment",
            currency: &request.currency,
            line_items: &request.line_items,
            success_url: &request.success_url,
            cancel_url: &request.cancel_url,
            expires_at: request.expires_at.timestamp(),
            metadata: SessionMetadata {
                cart_id: request.cart_id.to_string(),
                correlation_token: request.correlation_token.to_string(),
            },
        };

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api { status, body });
        }

        Ok(response.json().await?)
    }
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    sessions: Vec<(String, CheckoutSessionRequest)>,
    next_id: u32,
    fail_on_create: bool,
    omit_redirect: bool,
    delay: Option<Duration>,
}

/// In-memory payment gateway for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory payment gateway.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, InMemoryGatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configures the gateway to decline session creation.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.lock().fail_on_create = fail;
    }

    /// Configures the gateway to return sessions without a redirect URL.
    pub fn set_omit_redirect(&self, omit: bool) {
        self.lock().omit_redirect = omit;
    }

    /// Delays every call, to exercise timeouts and cancellation.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Returns the number of sessions created.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Returns the request that created a session.
    pub fn session_request(&self, session_id: &str) -> Option<CheckoutSessionRequest> {
        self.lock()
            .sessions
            .iter()
            .find(|(id, _)| id == session_id)
            .map(|(_, request)| request.clone())
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<RemoteSession, GatewayError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if state.fail_on_create {
            return Err(GatewayError::Declined("session creation refused".to_string()));
        }

        state.next_id += 1;
        let id = format!("cs_test_{:04}", state.next_id);
        let redirect_url =
            (!state.omit_redirect).then(|| format!("https://pay.example.test/{id}"));
        state.sessions.push((id.clone(), request));

        Ok(RemoteSession { id, redirect_url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CheckoutSessionRequest {
        CheckoutSessionRequest {
            cart_id: CartId::new(),
            correlation_token: Uuid::new_v4(),
            line_items: vec![LineItem {
                variant_id: VariantId::new(),
                quantity: 1,
                unit_amount: Money::from_cents(1000),
            }],
            currency: "usd".to_string(),
            success_url: "https://shop.test/ok".to_string(),
            cancel_url: "https://shop.test/cancel".to_string(),
            expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_sequential_session_ids() {
        let gateway = InMemoryPaymentGateway::new();

        let s1 = gateway.create_checkout_session(request()).await.unwrap();
        let s2 = gateway.create_checkout_session(request()).await.unwrap();

        assert_eq!(s1.id, "cs_test_0001");
        assert_eq!(s2.id, "cs_test_0002");
        assert!(s1.redirect_url.is_some());
        assert_eq!(gateway.session_count(), 2);
    }

    #[tokio::test]
    async fn test_fail_on_create() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_fail_on_create(true);

        let result = gateway.create_checkout_session(request()).await;
        assert!(matches!(result, Err(GatewayError::Declined(_))));
        assert_eq!(gateway.session_count(), 0);
    }

    #[tokio::test]
    async fn test_omit_redirect() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_omit_redirect(true);

        let session = gateway.create_checkout_session(request()).await.unwrap();
        assert!(session.redirect_url.is_none());
    }

    #[test]
    fn test_remote_session_reads_provider_url_field() {
        let session: RemoteSession =
            serde_json::from_str(r#"{"id":"cs_1","url":"https://pay/cs_1"}"#).unwrap();
        assert_eq!(session.redirect_url.as_deref(), Some("https://pay/cs_1"));

        let session: RemoteSession = serde_json::from_str(r#"{"id":"cs_2"}"#).unwrap();
        assert!(session.redirect_url.is_none());
    }
}
