//! Administrative reservation endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use chrono::Utc;
use common::ReservationId;
use domain::Reservation;
use serde::Serialize;
use store::Store;

use super::extract::{Ctx, parse_id};
use crate::AppState;
use crate::error::{ApiError, ResultExt};

#[derive(Serialize)]
pub struct SweepResponse {
    pub released: usize,
    pub units_restored: u64,
}

/// DELETE /admin/reservations/{id}
#[tracing::instrument(skip(state, ctx), fields(correlation_id = %ctx.correlation_id))]
pub async fn cancel<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
    Path(id): Path<String>,
) -> Result<Json<Reservation>, ApiError> {
    let reservation_id: ReservationId = parse_id(&ctx, &id, "reservation id")?;
    let reservation = state
        .checkout
        .cancel_reservation(&ctx, reservation_id)
        .await
        .in_context(&ctx)?;
    Ok(Json(reservation))
}

/// POST /admin/reservations/sweep
#[tracing::instrument(skip(state, ctx), fields(correlation_id = %ctx.correlation_id))]
pub async fn sweep<S: Store + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Ctx(ctx): Ctx,
) -> Result<Json<SweepResponse>, ApiError> {
    let report = state.sweeper.sweep(Utc::now()).await.in_context(&ctx)?;
    Ok(Json(SweepResponse {
        released: report.released.len(),
        units_restored: report.units_restored(),
    }))
}
