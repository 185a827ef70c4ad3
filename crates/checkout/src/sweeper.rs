//! Periodic release of reservations whose hold ran out.

use chrono::{DateTime, Utc};
use domain::Reservation;
use serde::Serialize;
use store::Store;
use tokio::sync::watch;

use crate::error::Result;

/// Reservations released by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub released: Vec<Reservation>,
}

impl SweepReport {
    /// Total units returned to stock.
    pub fn units_restored(&self) -> u64 {
        self.released.iter().map(|r| u64::from(r.quantity)).sum()
    }
}

/// Restores stock for expired holds.
///
/// Only the ledger and reservation rows change; cart and order status are
/// left to settlement.
#[derive(Debug, Clone)]
pub struct ReservationSweeper<S> {
    store: S,
}

impl<S: Store> ReservationSweeper<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Releases every reservation that expired at or before `now`.
    #[tracing::instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let released = self.store.release_expired(now).await?;
        if !released.is_empty() {
            metrics::counter!("reservations_released_total").increment(released.len() as u64);
            tracing::info!(count = released.len(), "expired reservations released");
        }
        Ok(SweepReport { released })
    }

    /// Sweeps every `period` until `shutdown` flips to true or its sender drops.
    pub async fn run(&self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(?period, "reservation sweeper started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        tracing::error!(error = %e, "reservation sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("reservation sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::{Money, ReservationRequest, Variant};
    use store::{CartStore, InMemoryStore, InventoryLedger, ReservationStore};

    #[tokio::test]
    async fn test_sweep_restores_expired_holds_only() {
        let store = InMemoryStore::new();
        let variant = Variant::new("SKU-SWEEP", "Widget", Money::from_cents(100), "usd");
        let variant = store.create_variant(variant, 10).await.unwrap();
        let stale = store
            .create_cart("stale", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        let live = store
            .create_cart("live", Utc::now() + Duration::hours(1))
            .await
            .unwrap();
        store
            .reserve_all(
                stale.id,
                vec![ReservationRequest::new(variant.id, 4)],
                Utc::now() - Duration::seconds(1),
            )
            .await
            .unwrap();
        store
            .reserve_all(
                live.id,
                vec![ReservationRequest::new(variant.id, 2)],
                Utc::now() + Duration::minutes(30),
            )
            .await
            .unwrap();

        let sweeper = ReservationSweeper::new(store.clone());
        let report = sweeper.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.released.len(), 1);
        assert_eq!(report.units_restored(), 4);
        let level = store.read(variant.id).await.unwrap();
        assert_eq!(level.available, 8);
        assert_eq!(level.reserved, 2);

        let again = sweeper.sweep(Utc::now()).await.unwrap();
        assert!(again.released.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let sweeper = ReservationSweeper::new(InMemoryStore::new());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            sweeper.run(std::time::Duration::from_millis(10), rx).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
