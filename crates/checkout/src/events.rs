//! Payment provider notification payloads.

use std::collections::HashMap;

use common::CartId;
use serde::{Deserialize, Serialize};

use crate::error::{CheckoutError, Result};

/// Event name for a paid checkout session.
pub const CHECKOUT_COMPLETED: &str = "checkout.session.completed";
/// Event name for a checkout session that ran out without payment.
pub const CHECKOUT_EXPIRED: &str = "checkout.session.expired";

/// The notification kinds settlement acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationKind {
    Completed,
    Expired,
    /// Any other event; acknowledged and recorded as unhandled.
    Other(String),
}

impl NotificationKind {
    pub fn from_event_type(event_type: &str) -> Self {
        match event_type {
            CHECKOUT_COMPLETED => NotificationKind::Completed,
            CHECKOUT_EXPIRED => NotificationKind::Expired,
            other => NotificationKind::Other(other.to_string()),
        }
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &str {
        match self {
            NotificationKind::Completed => "completed",
            NotificationKind::Expired => "expired",
            NotificationKind::Other(_) => "unhandled",
        }
    }
}

/// A signed event delivered by the payment provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    /// Kept untyped until the event kind is known; unhandled kinds carry
    /// objects that are not checkout sessions.
    pub object: serde_json::Value,
}

/// The checkout session object carried by completion and expiry events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPayload {
    pub id: String,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub shipping_details: Option<serde_json::Value>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProviderEvent {
    /// Parses a raw webhook body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| CheckoutError::MalformedEvent(e.to_string()))
    }

    pub fn kind(&self) -> NotificationKind {
        NotificationKind::from_event_type(&self.event_type)
    }

    /// Decodes the event object as a checkout session.
    pub fn session(&self) -> Result<SessionPayload> {
        let session: SessionPayload = serde_json::from_value(self.data.object.clone())
            .map_err(|e| CheckoutError::MalformedEvent(e.to_string()))?;
        if session.id.is_empty() {
            return Err(CheckoutError::MalformedEvent(
                "session id is empty".to_string(),
            ));
        }
        Ok(session)
    }
}

impl SessionPayload {
    /// The cart id carried in the session metadata, if present and valid.
    pub fn cart_id(&self) -> Option<CartId> {
        self.metadata.get("cart_id").and_then(|s| s.parse().ok())
    }

    /// Shipping details flattened to a string for encryption.
    pub fn shipping_text(&self) -> Option<String> {
        match &self.shipping_details {
            None | Some(serde_json::Value::Null) => None,
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}
