//! Application configuration loaded from environment variables.

use std::str::FromStr;

use checkout::CheckoutPolicy;

/// Log output format for the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `"info"`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: Postgres connection string; unset selects the in-memory store
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default 10)
/// - `RESERVATION_HOLD_MINUTES`: reservation hold (default 30)
/// - `CART_TTL_HOURS`: lifetime of a new cart (default 24)
/// - `PAYMENT_GATEWAY_TIMEOUT_SECS`: remote session call bound (default 10)
/// - `SWEEP_INTERVAL_SECS`: expired reservation sweep period, 0 disables (default 60)
/// - `WEBHOOK_SECRET`: shared secret for provider signatures
/// - `PAYMENT_API_BASE`, `PAYMENT_API_KEY`: payment provider; unset selects the in-memory gateway
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub reservation_hold_minutes: i64,
    pub cart_ttl_hours: i64,
    pub payment_gateway_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub webhook_secret: Option<String>,
    pub payment_api_base: Option<String>,
    pub payment_api_key: Option<String>,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let text = |key: &str| non_empty(&lookup, key);

        Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: match text("LOG_FORMAT").as_deref() {
                Some(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            database_url: text("DATABASE_URL"),
            database_max_connections: parsed(&lookup, "DATABASE_MAX_CONNECTIONS")
                .unwrap_or(defaults.database_max_connections),
            reservation_hold_minutes: parsed(&lookup, "RESERVATION_HOLD_MINUTES")
                .filter(|m: &i64| *m > 0)
                .unwrap_or(defaults.reservation_hold_minutes),
            cart_ttl_hours: parsed(&lookup, "CART_TTL_HOURS")
                .filter(|h: &i64| *h > 0)
                .unwrap_or(defaults.cart_ttl_hours),
            payment_gateway_timeout_secs: parsed(&lookup, "PAYMENT_GATEWAY_TIMEOUT_SECS")
                .filter(|s: &u64| *s > 0)
                .unwrap_or(defaults.payment_gateway_timeout_secs),
            sweep_interval_secs: parsed(&lookup, "SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval_secs),
            webhook_secret: text("WEBHOOK_SECRET"),
            payment_api_base: text("PAYMENT_API_BASE"),
            payment_api_key: text("PAYMENT_API_KEY"),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Checkout durations derived from this configuration.
    pub fn policy(&self) -> CheckoutPolicy {
        CheckoutPolicy {
            reservation_hold: chrono::Duration::minutes(self.reservation_hold_minutes),
            cart_ttl: chrono::Duration::hours(self.cart_ttl_hours),
            gateway_timeout: std::time::Duration::from_secs(self.payment_gateway_timeout_secs),
        }
    }

    /// Sweep period, or `None` when the background sweeper is disabled.
    pub fn sweep_interval(&self) -> Option<std::time::Duration> {
        (self.sweep_interval_secs > 0)
            .then(|| std::time::Duration::from_secs(self.sweep_interval_secs))
    }

    /// Provider base URL and key, when both are set.
    pub fn payment_api(&self) -> Option<(&str, &str)> {
        match (&self.payment_api_base, &self.payment_api_key) {
            (Some(base), Some(key)) => Some((base.as_str(), key.as_str())),
            _ => None,
        }
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    non_empty(lookup, key).and_then(|v| v.trim().parse().ok())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            database_max_connections: 10,
            reservation_hold_minutes: 30,
            cart_ttl_hours: 24,
            payment_gateway_timeout_secs: 10,
            sweep_interval_secs: 60,
            webhook_secret: None,
            payment_api_base: None,
            payment_api_key: None,
        }
    }
}
