use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::engine::lifecycle::{self, Quote, QuoteRequest};
use crate::engine::pricing::validate_rate_card;
use crate::error::AppError;
use crate::models::actor::{Actor, Role};
use crate::models::vehicle::{RateCard, Vehicle};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/vehicles", post(register_vehicle))
        .route("/vehicles/:id", get(get_vehicle))
        .route("/quotes", post(create_quote))
}

#[derive(Deserialize)]
pub struct RegisterVehicleRequest {
    pub label: String,
    pub rate_per_km: Decimal,
    pub minimum_charge: Decimal,
    /// Administrators register on a carrier's behalf.
    pub carrier_id: Option<Uuid>,
}

async fn register_vehicle(
    State(state): State<Arc<AppState>>,
    actor: Actor,
    Json(payload): Json<RegisterVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), AppError> {
    let carrier_id = match (actor.role, payload.carrier_id) {
        (Role::Carrier, None) => actor.id,
        (Role::Carrier, Some(id)) if id == actor.id => actor.id,
        (Role::Admin, Some(id)) => id,
        (Role::Admin, None) => {
            return Err(AppError::Validation(
                "carrier_id is required when registering for a carrier".to_string(),
            ));
        }
        _ => {
            return Err(AppError::NotAuthorized(
                "only carriers register their own vehicles".to_string(),
            ));
        }
    };

    if payload.label.trim().is_empty() {
        return Err(AppError::Validation("label cannot be empty".to_string()));
    }

    let rate_card = RateCard {
        rate_per_km: payload.rate_per_km,
        minimum_charge: payload.minimum_charge,
    };
    validate_rate_card(&rate_card).map_err(AppError::Validation)?;

    let vehicle = Vehicle {
        id: Uuid::new_v4(),
        carrier_id,
        label: payload.label.trim().to_string(),
        rate_card,
        registered_at: Utc::now(),
    };

    state.vehicles.insert(vehicle.id, vehicle.clone());
    info!(vehicle_id = %vehicle.id, carrier_id = %carrier_id, "vehicle registered");

    Ok((StatusCode::CREATED, Json(vehicle)))
}

async fn get_vehicle(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vehicle>, AppError> {
    let vehicle = state
        .vehicles
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("vehicle {id} not found")))?;

    Ok(Json(vehicle.value().clone()))
}

async fn create_quote(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuoteRequest>,
) -> Result<Json<Quote>, AppError> {
    lifecycle::quote(&state, payload).await.map(Json)
}
