//! Order state machine.

use serde::{Deserialize, Serialize};

/// The state of an order in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Paid ──► (Cancelled | Returned | Refunded, administrative)
///           └──► Failed
/// ```
/// Only one transition out of `Pending` ever happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Payment session created, awaiting the provider's notification.
    #[default]
    Pending,

    /// Payment confirmed; reserved stock became a permanent sale.
    Paid,

    /// Payment session expired or failed; reserved stock was restored.
    Failed,

    /// Cancelled by an administrator.
    Cancelled,

    /// Returned by the customer.
    Returned,

    /// Refunded by an administrator.
    Refunded,
}

impl OrderStatus {
    /// Returns true if a settlement notification may still change this order.
    pub fn can_settle(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if the order's stock decrement is a committed sale.
    pub fn is_sale_committed(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid | OrderStatus::Returned | OrderStatus::Refunded
        )
    }

    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Failed
                | OrderStatus::Cancelled
                | OrderStatus::Returned
                | OrderStatus::Refunded
        )
    }

    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OrderStatus::Pending),
            "paid" => Ok(OrderStatus::Paid),
            "failed" => Ok(OrderStatus::Failed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "returned" => Ok(OrderStatus::Returned),
            "refunded" => Ok(OrderStatus::Refunded),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_only_pending_can_settle() {
        assert!(OrderStatus::Pending.can_settle());
        assert!(!OrderStatus::Paid.can_settle());
        assert!(!OrderStatus::Failed.can_settle());
        assert!(!OrderStatus::Cancelled.can_settle());
        assert!(!OrderStatus::Returned.can_settle());
        assert!(!OrderStatus::Refunded.can_settle());
    }

    #[test]
    fn test_sale_committed_states() {
        assert!(!OrderStatus::Pending.is_sale_committed());
        assert!(OrderStatus::Paid.is_sale_committed());
        assert!(!OrderStatus::Failed.is_sale_committed());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
        assert!(OrderStatus::Failed.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_string(&OrderStatus::Paid).unwrap();
        assert_eq!(json, "\"paid\"");
        let deserialized: OrderStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, OrderStatus::Paid);
    }

    #[test]
    fn test_parse_roundtrips_persisted_names() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
            OrderStatus::Returned,
            OrderStatus::Refunded,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
    }
}
