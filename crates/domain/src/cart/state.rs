//! Cart state machine.

use serde::{Deserialize, Serialize};

/// The state of a cart in its lifecycle.
///
/// State transitions:
/// ```text
/// Active ──► Ordered ──► (finalized through the order)
///   │           │
///   └───────────┴──► Abandoned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    /// Shopper is still adding items.
    #[default]
    Active,

    /// Stock is reserved and a payment session exists.
    Ordered,

    /// Checkout expired or the cart was given up (terminal state).
    Abandoned,
}

impl CartStatus {
    /// Returns true if items can be added or removed.
    pub fn can_modify_items(&self) -> bool {
        matches!(self, CartStatus::Active)
    }

    /// Returns true if checkout can start from this state.
    pub fn can_checkout(&self) -> bool {
        matches!(self, CartStatus::Active)
    }

    /// Returns true if the cart can be marked abandoned.
    pub fn can_abandon(&self) -> bool {
        matches!(self, CartStatus::Active | CartStatus::Ordered)
    }

    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Active => "active",
            CartStatus::Ordered => "ordered",
            CartStatus::Abandoned => "abandoned",
        }
    }
}

impl std::fmt::Display for CartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for CartStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(CartStatus::Active),
            "ordered" => Ok(CartStatus::Ordered),
            "abandoned" => Ok(CartStatus::Abandoned),
            other => Err(format!("unknown cart status: {other}")),
        }
    }
}
