use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Serialize;
use uuid::Uuid;

use crate::engine::rating::{self, ReviewInput};
use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::rating::Rating;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings/:id/reviews", post(submit_review))
        .route("/bookings/:id/reviews/eligibility", get(eligibility))
}

#[derive(Serialize)]
pub struct Eligibility {
    pub booking_id: Uuid,
    pub can_review: bool,
}

async fn eligibility(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
) -> Result<Json<Eligibility>, AppError> {
    let can_review = rating::can_review(&state, booking_id, actor.id)?;
    Ok(Json(Eligibility {
        booking_id,
        can_review,
    }))
}

async fn submit_review(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Path(booking_id): Path<Uuid>,
    Json(payload): Json<ReviewInput>,
) -> Result<(StatusCode, Json<Rating>), AppError> {
    let rating = rating::submit_review(&state, actor, booking_id, payload)?;
    Ok((StatusCode::CREATED, Json(rating)))
}
