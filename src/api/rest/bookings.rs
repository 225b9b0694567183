use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::lifecycle::{
    self, BookingCreated, BookingEdit, NewBooking, StatusChange, TrackingUpdate,
};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::booking::Booking;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/:id", get(get_booking).patch(edit_booking))
        .route("/bookings/:id/status", post(update_status))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/tracking", post(update_tracking))
        .route("/bookings/:id/cash-collected", post(cash_collected))
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub expected_version: Option<u64>,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<NewBooking>,
) -> Result<(StatusCode, Json<BookingCreated>), AppError> {
    let created = lifecycle::create_booking(&state, actor, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_bookings(State(state): State<Arc<AppState>>, actor: Actor) -> Json<Vec<Booking>> {
    Json(lifecycle::list_bookings(&state, actor))
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::get_booking(&state, actor, id).map(Json)
}

async fn edit_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<BookingEdit>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::edit_booking(&state, actor, id, payload)
        .await
        .map(Json)
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<StatusChange>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::update_status(&state, actor, id, payload).map(Json)
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::cancel_booking(&state, actor, id, payload.reason, payload.expected_version)
        .map(Json)
}

async fn update_tracking(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<TrackingUpdate>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::update_tracking(&state, actor, id, payload).map(Json)
}

async fn cash_collected(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Booking>, AppError> {
    lifecycle::mark_cash_collected(&state, actor, id).map(Json)
}
