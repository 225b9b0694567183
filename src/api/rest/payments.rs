use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::escrow;
use crate::error::AppError;
use crate::gateway::GatewayCallback;
use crate::models::actor::Actor;
use crate::models::payment::{Payment, PaymentStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/bookings/:id/payments",
            post(initiate_payment).get(list_payments),
        )
        .route("/payments/callback", post(gateway_callback))
        .route("/payments/awaiting-settlement", get(awaiting_settlement))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/release", post(release))
        .route("/payments/:id/refund", post(refund))
}

#[derive(Deserialize)]
pub struct InitiatePaymentRequest {
    pub phone: String,
}

#[derive(Deserialize)]
pub struct RefundRequest {
    pub reason: String,
    pub note: Option<String>,
}

#[derive(Serialize)]
pub struct CallbackAck {
    pub payment_id: Uuid,
    pub status: PaymentStatus,
}

/// 202 while the payer approves on their phone; a failed push is still a
/// recorded attempt and comes back as 200 with status `failed`.
async fn initiate_payment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
    Json(payload): Json<InitiatePaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let payment = escrow::initiate_payment(&state, actor, booking_id, &payload.phone).await?;

    let status = match payment.status {
        PaymentStatus::Processing => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(payment)))
}

async fn list_payments(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Vec<Payment>>, AppError> {
    escrow::payments_for_booking(&state, actor, booking_id).map(Json)
}

// TODO: verify the gateway's callback signature once the provider's signing
// scheme is configured; today any caller that knows a checkout id can settle it.
async fn gateway_callback(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<GatewayCallback>,
) -> Result<Json<CallbackAck>, AppError> {
    let payment = escrow::handle_callback(&state, payload)?;

    Ok(Json(CallbackAck {
        payment_id: payment.id,
        status: payment.status,
    }))
}

async fn awaiting_settlement(
    State(state): State<Arc<AppState>>,
    actor: Actor,
) -> Result<Json<Vec<Payment>>, AppError> {
    escrow::awaiting_settlement(&state, actor).map(Json)
}

async fn get_payment(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    escrow::get_payment(&state, actor, id).map(Json)
}

async fn release(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
) -> Result<Json<Payment>, AppError> {
    escrow::release(&state, actor, id).map(Json)
}

async fn refund(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(id): Path<Uuid>,
    Json(payload): Json<RefundRequest>,
) -> Result<Json<Payment>, AppError> {
    escrow::refund(&state, actor, id, &payload.reason, payload.note).map(Json)
}
