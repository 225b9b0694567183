use chrono::Utc;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::actor::Actor;
use crate::models::booking::{Booking, BookingStatus};
use crate::models::rating::Rating;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewInput {
    pub score: u8,
    #[serde(default)]
    pub text: String,
}

/// True when `rater_id` took part in a completed booking and has not yet
/// reviewed it.
pub fn can_review(state: &AppState, booking_id: Uuid, rater_id: Uuid) -> Result<bool, AppError> {
    let booking = load(state, booking_id)?;

    Ok(booking.status == BookingStatus::Completed
        && counterpart(&booking, rater_id).is_some()
        && !state.ratings.contains_key(&(booking_id, rater_id)))
}

pub fn submit_review(
    state: &AppState,
    actor: Actor,
    booking_id: Uuid,
    input: ReviewInput,
) -> Result<Rating, AppError> {
    if !(1..=5).contains(&input.score) {
        return Err(AppError::Validation(
            "score must be between 1 and 5".to_string(),
        ));
    }

    let booking = load(state, booking_id)?;
    let ratee_id = counterpart(&booking, actor.id).ok_or_else(|| {
        AppError::NotAuthorized("only the booking's customer or carrier can review it".to_string())
    })?;

    if booking.status != BookingStatus::Completed {
        return Err(AppError::NotEligible(format!(
            "reviews open once the booking is completed; it is {}",
            booking.status.as_str()
        )));
    }

    // Insert-if-absent under the shard lock.
    let rating = match state.ratings.entry((booking_id, actor.id)) {
        Entry::Occupied(_) => return Err(AppError::DuplicateReview),
        Entry::Vacant(slot) => slot
            .insert(Rating {
                id: Uuid::new_v4(),
                booking_id,
                rater_id: actor.id,
                ratee_id,
                score: input.score,
                text: input.text.trim().to_string(),
                created_at: Utc::now(),
            })
            .value()
            .clone(),
    };

    info!(
        booking_id = %booking_id,
        rater_id = %actor.id,
        score = rating.score,
        "review submitted"
    );
    Ok(rating)
}

fn load(state: &AppState, booking_id: Uuid) -> Result<Booking, AppError> {
    state
        .bookings
        .get(&booking_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))
}

fn counterpart(booking: &Booking, rater_id: Uuid) -> Option<Uuid> {
    if rater_id == booking.customer_id {
        Some(booking.carrier_id)
    } else if rater_id == booking.carrier_id {
        Some(booking.customer_id)
    } else {
        None
    }
}
