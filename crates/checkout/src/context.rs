//! Per-request context passed explicitly through checkout and settlement.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identifies one unit of work in logs and error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: Uuid,
    pub received_at: DateTime<Utc>,
}

impl RequestContext {
    /// Creates a context with a fresh correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(Uuid::new_v4())
    }

    /// Creates a context that reuses a caller-supplied correlation id.
    pub fn with_correlation_id(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            received_at: Utc::now(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
