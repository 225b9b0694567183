//! Booking state machine.
//!
//! Status changes are decided by [`TRANSITIONS`]; anything not listed there is
//! refused. Every write re-validates against the stored record while holding
//! its map entry, so a request computed against an older version of the
//! booking cannot resurrect or overwrite it.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::pricing::fare;
use crate::error::AppError;
use crate::models::actor::{Actor, Role};
use crate::models::booking::{
    Booking, BookingPaymentStatus, BookingStatus, Cancellation, Cargo, EstimateSource, GeoPoint,
    PaymentInfo, Pricing, Stop, Tracking,
};
use crate::models::payment::{EscrowStatus, PaymentMethod};
use crate::models::vehicle::RateCard;
use crate::notify::{Notification, NotificationKind, Recipient};
use crate::routing::{offline_estimate, RouteEstimate};
use crate::state::AppState;

use BookingStatus::{Cancelled, Completed, Confirmed, InTransit, Pending};

/// `(current, actor role, requested)`. Terminal states have no rows.
pub const TRANSITIONS: &[(BookingStatus, Role, BookingStatus)] = &[
    (Pending, Role::Carrier, Confirmed),
    (Confirmed, Role::Carrier, InTransit),
    (InTransit, Role::Carrier, Completed),
    (Pending, Role::Customer, Cancelled),
    (Pending, Role::Carrier, Cancelled),
    (Confirmed, Role::Carrier, Cancelled),
];

pub fn authorize_transition(
    current: BookingStatus,
    role: Role,
    requested: BookingStatus,
) -> Result<(), AppError> {
    if TRANSITIONS.contains(&(current, role, requested)) {
        return Ok(());
    }

    let permitted: Vec<Role> = TRANSITIONS
        .iter()
        .filter(|(from, _, to)| *from == current && *to == requested)
        .map(|(_, role, _)| *role)
        .collect();

    if permitted.is_empty() {
        let rule = if current.is_terminal() {
            format!(
                "booking is {} and can no longer change status",
                current.as_str()
            )
        } else {
            format!(
                "a {} booking cannot move to {}",
                current.as_str(),
                requested.as_str()
            )
        };
        return Err(AppError::InvalidTransition(rule));
    }

    let rule = match (role, requested) {
        (Role::Customer, Cancelled) => "customers can only cancel pending bookings".to_string(),
        _ => format!(
            "only the {} can move a {} booking to {}",
            permitted
                .iter()
                .map(|role| role.as_str())
                .collect::<Vec<_>>()
                .join(" or "),
            current.as_str(),
            requested.as_str()
        ),
    };
    Err(AppError::NotAuthorized(rule))
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewBooking {
    pub vehicle_id: Uuid,
    pub origin: Stop,
    pub destination: Stop,
    pub cargo: Cargo,
    pub instructions: Option<String>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, Serialize)]
pub struct BookingCreated {
    pub booking: Booking,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookingEdit {
    pub origin: Option<Stop>,
    pub destination: Option<Stop>,
    pub cargo: Option<Cargo>,
    pub instructions: Option<String>,
    pub expected_version: Option<u64>,
}

impl BookingEdit {
    fn is_empty(&self) -> bool {
        self.origin.is_none()
            && self.destination.is_none()
            && self.cargo.is_none()
            && self.instructions.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusChange {
    pub status: BookingStatus,
    pub reason: Option<String>,
    pub actual_amount: Option<Decimal>,
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackingUpdate {
    pub location: GeoPoint,
    pub estimated_arrival: Option<DateTime<Utc>>,
}

pub async fn create_booking(
    state: &AppState,
    actor: Actor,
    request: NewBooking,
) -> Result<BookingCreated, AppError> {
    let result = build_and_store(state, actor, request).await;
    let outcome = if result.is_ok() { "created" } else { "rejected" };
    state
        .metrics
        .bookings_total
        .with_label_values(&[outcome])
        .inc();
    result
}

async fn build_and_store(
    state: &AppState,
    actor: Actor,
    request: NewBooking,
) -> Result<BookingCreated, AppError> {
    if actor.role != Role::Customer {
        return Err(AppError::NotAuthorized(
            "only customers can request a booking".to_string(),
        ));
    }

    validate_stop(&request.origin, "origin")?;
    validate_stop(&request.destination, "destination")?;
    validate_schedule(&request.origin, &request.destination)?;
    validate_cargo(&request.cargo)?;

    let (carrier_id, rate_card) = {
        let vehicle = state.vehicles.get(&request.vehicle_id).ok_or_else(|| {
            AppError::NotFound(format!("vehicle {} not found", request.vehicle_id))
        })?;
        (vehicle.carrier_id, vehicle.rate_card)
    };

    let mut origin = request.origin;
    let mut destination = request.destination;
    let estimate = price_route(state, &mut origin, &mut destination).await;

    let now = Utc::now();
    let booking = Booking {
        id: Uuid::new_v4(),
        customer_id: actor.id,
        carrier_id,
        vehicle_id: request.vehicle_id,
        origin,
        destination,
        cargo: request.cargo,
        instructions: request.instructions.filter(|text| !text.trim().is_empty()),
        pricing: pricing_for(&estimate, &rate_card),
        status: Pending,
        payment: PaymentInfo {
            payment_id: None,
            status: BookingPaymentStatus::Pending,
            method: request.payment_method,
            cash_collected_at: None,
        },
        tracking: None,
        cancellation: None,
        version: 1,
        created_at: now,
        updated_at: now,
        completed_at: None,
    };

    let warning = conflicting_job(state, &booking).map(|other| {
        format!("carrier already has an active job (booking {other}) scheduled the same day")
    });

    state.bookings.insert(booking.id, booking.clone());

    info!(
        booking_id = %booking.id,
        carrier_id = %booking.carrier_id,
        distance_km = booking.pricing.distance_km,
        amount = %booking.pricing.estimated_amount,
        source = booking.pricing.estimate_source.as_str(),
        "booking created"
    );
    if warning.is_some() {
        warn!(booking_id = %booking.id, carrier_id = %carrier_id, "carrier has another active job that day");
    }

    state.notifier.dispatch(Notification::new(
        Recipient::User(booking.carrier_id),
        NotificationKind::NewBooking,
        booking.id,
        booking.status,
        format!(
            "new booking from {} to {}",
            booking.origin.address, booking.destination.address
        ),
    ));

    Ok(BookingCreated { booking, warning })
}

/// Fills in missing coordinates and runs the estimator chain. Never fails.
async fn price_route(state: &AppState, origin: &mut Stop, destination: &mut Stop) -> RouteEstimate {
    let from = locate(state, &origin.address, origin.coordinates).await;
    let to = locate(state, &destination.address, destination.coordinates).await;
    origin.coordinates = Some(from);
    destination.coordinates = Some(to);

    estimate_route(state, from, to).await
}

async fn locate(state: &AppState, address: &str, known: Option<GeoPoint>) -> GeoPoint {
    match known {
        Some(point) => point,
        None => state.estimator.resolve(address).await,
    }
}

async fn estimate_route(state: &AppState, from: GeoPoint, to: GeoPoint) -> RouteEstimate {
    let started = Instant::now();
    let estimate = state.estimator.estimate(Some(from), Some(to)).await;

    let source = estimate.source.as_str();
    state
        .metrics
        .route_estimates_total
        .with_label_values(&[source])
        .inc();
    state
        .metrics
        .route_estimate_latency_seconds
        .with_label_values(&[source])
        .observe(started.elapsed().as_secs_f64());

    estimate
}

#[derive(Debug, Clone, Deserialize)]
pub struct Place {
    #[serde(default)]
    pub address: String,
    pub coordinates: Option<GeoPoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuoteRequest {
    pub vehicle_id: Uuid,
    pub origin: Place,
    pub destination: Place,
}

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub vehicle_id: Uuid,
    pub origin: GeoPoint,
    pub destination: GeoPoint,
    pub distance_km: f64,
    pub duration_min: f64,
    pub estimate_source: EstimateSource,
    pub rate_per_km: Decimal,
    pub minimum_charge: Decimal,
    pub amount: Decimal,
}

/// Prices a trip without creating anything.
pub async fn quote(state: &AppState, request: QuoteRequest) -> Result<Quote, AppError> {
    for (place, label) in [(&request.origin, "origin"), (&request.destination, "destination")] {
        match place.coordinates {
            Some(point) if !point.is_valid() => {
                return Err(AppError::Validation(format!(
                    "{label} coordinates are out of range"
                )));
            }
            None if place.address.trim().is_empty() => {
                return Err(AppError::Validation(format!(
                    "{label} needs an address or coordinates"
                )));
            }
            _ => {}
        }
    }

    let rate_card = state
        .vehicles
        .get(&request.vehicle_id)
        .map(|vehicle| vehicle.rate_card)
        .ok_or_else(|| AppError::NotFound(format!("vehicle {} not found", request.vehicle_id)))?;

    let from = locate(state, &request.origin.address, request.origin.coordinates).await;
    let to = locate(state, &request.destination.address, request.destination.coordinates).await;
    let estimate = estimate_route(state, from, to).await;

    Ok(Quote {
        vehicle_id: request.vehicle_id,
        origin: from,
        destination: to,
        distance_km: estimate.distance_km,
        duration_min: estimate.duration_min,
        estimate_source: estimate.source,
        rate_per_km: rate_card.rate_per_km,
        minimum_charge: rate_card.minimum_charge,
        amount: fare(estimate.distance_km, &rate_card),
    })
}

fn pricing_for(estimate: &RouteEstimate, rate_card: &RateCard) -> Pricing {
    Pricing {
        distance_km: estimate.distance_km,
        duration_min: estimate.duration_min,
        estimate_source: estimate.source,
        rate_per_km: rate_card.rate_per_km,
        minimum_charge: rate_card.minimum_charge,
        estimated_amount: fare(estimate.distance_km, rate_card),
        actual_amount: None,
        cancellation_fee: None,
    }
}

/// Another confirmed or in-transit job for the same carrier on the pickup day.
fn conflicting_job(state: &AppState, candidate: &Booking) -> Option<Uuid> {
    let day = candidate.origin.scheduled_at.date_naive();

    state
        .bookings
        .iter()
        .find(|entry| {
            let other = entry.value();
            other.id != candidate.id
                && other.carrier_id == candidate.carrier_id
                && other.is_active()
                && other.origin.scheduled_at.date_naive() == day
        })
        .map(|entry| *entry.key())
}

pub fn get_booking(state: &AppState, actor: Actor, id: Uuid) -> Result<Booking, AppError> {
    let booking = state
        .bookings
        .get(&id)
        .ok_or_else(|| not_found(id))?
        .value()
        .clone();

    ensure_visible(&booking, actor)?;
    Ok(booking)
}

pub fn list_bookings(state: &AppState, actor: Actor) -> Vec<Booking> {
    let mut bookings: Vec<Booking> = state
        .bookings
        .iter()
        .filter(|entry| ensure_visible(entry.value(), actor).is_ok())
        .map(|entry| entry.value().clone())
        .collect();

    bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    bookings
}

pub fn update_status(
    state: &AppState,
    actor: Actor,
    id: Uuid,
    change: StatusChange,
) -> Result<Booking, AppError> {
    let booking = {
        let mut entry = state.bookings.get_mut(&id).ok_or_else(|| not_found(id))?;
        let booking = entry.value_mut();

        ensure_participant(booking, actor)?;
        check_version(booking, change.expected_version)?;
        authorize_transition(booking.status, actor.role, change.status)?;

        let reason = change
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty());

        if change.status == Cancelled && reason.is_none() {
            return Err(AppError::Validation(
                "a cancellation reason is required".to_string(),
            ));
        }

        if let Some(amount) = change.actual_amount {
            if change.status != Completed {
                return Err(AppError::Validation(
                    "the actual amount can only be recorded on completion".to_string(),
                ));
            }
            if amount < Decimal::ZERO {
                return Err(AppError::Validation(
                    "actual_amount cannot be negative".to_string(),
                ));
            }
        }

        let now = Utc::now();
        match change.status {
            Cancelled => {
                booking.cancellation = Some(Cancellation {
                    reason: reason.unwrap_or_default().to_string(),
                    cancelled_by: actor.id,
                    cancelled_at: now,
                });
            }
            Completed => {
                booking.completed_at = Some(now);
                if change.actual_amount.is_some() {
                    booking.pricing.actual_amount = change.actual_amount;
                }
            }
            _ => {}
        }

        booking.status = change.status;
        booking.touch();
        booking.clone()
    };

    state
        .metrics
        .booking_transitions_total
        .with_label_values(&[booking.status.as_str()])
        .inc();

    info!(
        booking_id = %booking.id,
        status = booking.status.as_str(),
        actor_id = %actor.id,
        role = actor.role.as_str(),
        "booking status updated"
    );

    let counterpart = match actor.role {
        Role::Customer => booking.carrier_id,
        _ => booking.customer_id,
    };
    let message = match &booking.cancellation {
        Some(cancellation) => format!("booking cancelled: {}", cancellation.reason),
        None => format!("booking is now {}", booking.status.as_str()),
    };
    state.notifier.dispatch(Notification::new(
        Recipient::User(counterpart),
        NotificationKind::StatusChanged,
        booking.id,
        booking.status,
        message,
    ));

    match booking.status {
        Completed => after_completion(state, &booking),
        Cancelled => flag_held_escrow(state, &booking),
        _ => {}
    }

    Ok(booking)
}

pub fn cancel_booking(
    state: &AppState,
    actor: Actor,
    id: Uuid,
    reason: String,
    expected_version: Option<u64>,
) -> Result<Booking, AppError> {
    update_status(
        state,
        actor,
        id,
        StatusChange {
            status: Cancelled,
            reason: Some(reason),
            actual_amount: None,
            expected_version,
        },
    )
}

fn after_completion(state: &AppState, booking: &Booking) {
    flag_held_escrow(state, booking);

    if booking.payment.method == PaymentMethod::Cash
        && booking.payment.status == BookingPaymentStatus::Pending
    {
        info!(booking_id = %booking.id, "completed cash booking not yet marked collected");
    }

    if !state
        .ratings
        .contains_key(&(booking.id, booking.customer_id))
    {
        state.notifier.dispatch(Notification::new(
            Recipient::User(booking.customer_id),
            NotificationKind::ReviewPrompt,
            booking.id,
            booking.status,
            "your delivery is complete; rate your carrier",
        ));
    }
}

/// Held funds on a closed booking need an operator to release or refund.
fn flag_held_escrow(state: &AppState, booking: &Booking) {
    let Some(payment_id) = booking.payment.payment_id else {
        return;
    };
    let held = state
        .payments
        .get(&payment_id)
        .is_some_and(|payment| payment.escrow == Some(EscrowStatus::Held));

    if held {
        warn!(
            booking_id = %booking.id,
            payment_id = %payment_id,
            status = booking.status.as_str(),
            "escrow awaiting release or refund"
        );
        state.notifier.dispatch(Notification::new(
            Recipient::Operators,
            NotificationKind::AwaitingSettlement,
            booking.id,
            booking.status,
            format!(
                "booking {} with held escrow; release or refund payment {payment_id}",
                booking.status.as_str()
            ),
        ));
    }
}

pub async fn edit_booking(
    state: &AppState,
    actor: Actor,
    id: Uuid,
    edit: BookingEdit,
) -> Result<Booking, AppError> {
    let snapshot = state
        .bookings
        .get(&id)
        .ok_or_else(|| not_found(id))?
        .value()
        .clone();

    ensure_editable(&snapshot, actor)?;
    check_version(&snapshot, edit.expected_version)?;

    if edit.is_empty() {
        return Err(AppError::Validation("nothing to edit".to_string()));
    }

    if let Some(origin) = &edit.origin {
        validate_stop(origin, "origin")?;
    }
    if let Some(destination) = &edit.destination {
        validate_stop(destination, "destination")?;
    }
    if let Some(cargo) = &edit.cargo {
        validate_cargo(cargo)?;
    }

    let route_changed = edit.origin.is_some() || edit.destination.is_some();
    let mut origin = edit.origin.unwrap_or_else(|| snapshot.origin.clone());
    let mut destination = edit
        .destination
        .unwrap_or_else(|| snapshot.destination.clone());
    validate_schedule(&origin, &destination)?;

    let pricing = if route_changed {
        let estimate = price_route(state, &mut origin, &mut destination).await;
        let rate_card = RateCard {
            rate_per_km: snapshot.pricing.rate_per_km,
            minimum_charge: snapshot.pricing.minimum_charge,
        };
        Some(pricing_for(&estimate, &rate_card))
    } else {
        None
    };

    let booking = {
        let mut entry = state.bookings.get_mut(&id).ok_or_else(|| not_found(id))?;
        let booking = entry.value_mut();

        if booking.version != snapshot.version {
            return Err(AppError::InvalidTransition(
                "booking changed while the edit was in progress; reload and retry".to_string(),
            ));
        }

        booking.origin = origin;
        booking.destination = destination;
        if let Some(cargo) = edit.cargo {
            booking.cargo = cargo;
        }
        if let Some(instructions) = edit.instructions {
            booking.instructions = Some(instructions).filter(|text| !text.trim().is_empty());
        }
        if let Some(pricing) = pricing {
            booking.pricing = pricing;
        }

        booking.touch();
        booking.clone()
    };

    info!(booking_id = %booking.id, repriced = route_changed, "booking edited");

    state.notifier.dispatch(Notification::new(
        Recipient::User(booking.carrier_id),
        NotificationKind::BookingEdited,
        booking.id,
        booking.status,
        "the customer updated this booking",
    ));

    Ok(booking)
}

pub fn update_tracking(
    state: &AppState,
    actor: Actor,
    id: Uuid,
    update: TrackingUpdate,
) -> Result<Booking, AppError> {
    if !update.location.is_valid() {
        return Err(AppError::Validation(
            "location coordinates are out of range".to_string(),
        ));
    }

    let booking = {
        let mut entry = state.bookings.get_mut(&id).ok_or_else(|| not_found(id))?;
        let booking = entry.value_mut();

        if actor.role != Role::Carrier || actor.id != booking.carrier_id {
            return Err(AppError::NotAuthorized(
                "only the assigned carrier can report location".to_string(),
            ));
        }
        if booking.status != InTransit {
            return Err(AppError::InvalidTransition(
                "location updates are only accepted while in transit".to_string(),
            ));
        }

        let now = Utc::now();
        let estimated_arrival = update.estimated_arrival.unwrap_or_else(|| {
            let remaining =
                offline_estimate(Some(update.location), booking.destination.coordinates);
            now + Duration::minutes(remaining.duration_min.ceil() as i64)
        });

        booking.tracking = Some(Tracking {
            location: update.location,
            updated_at: now,
            estimated_arrival,
        });
        booking.touch();
        booking.clone()
    };

    state.notifier.dispatch(Notification::new(
        Recipient::User(booking.customer_id),
        NotificationKind::LocationUpdated,
        booking.id,
        booking.status,
        "carrier location updated",
    ));

    Ok(booking)
}

/// Cash never passes through escrow; the carrier's word is the record.
pub fn mark_cash_collected(state: &AppState, actor: Actor, id: Uuid) -> Result<Booking, AppError> {
    let mut entry = state.bookings.get_mut(&id).ok_or_else(|| not_found(id))?;
    let booking = entry.value_mut();

    if actor.role != Role::Carrier || actor.id != booking.carrier_id {
        return Err(AppError::NotAuthorized(
            "only the assigned carrier can confirm cash collection".to_string(),
        ));
    }
    if booking.payment.method != PaymentMethod::Cash {
        return Err(AppError::Validation(
            "booking is not paid in cash".to_string(),
        ));
    }
    if !matches!(booking.status, InTransit | Completed) {
        return Err(AppError::InvalidTransition(
            "cash can only be collected once the trip has started".to_string(),
        ));
    }
    if booking.payment.status != BookingPaymentStatus::Pending {
        return Err(AppError::InvalidTransition(
            "cash collection is already recorded".to_string(),
        ));
    }

    // Payment mirror write: leaves `version` alone so pending edits stay valid.
    booking.payment.status = BookingPaymentStatus::Paid;
    booking.payment.cash_collected_at = Some(Utc::now());
    booking.updated_at = Utc::now();

    info!(booking_id = %booking.id, "cash collected");
    Ok(booking.clone())
}

fn check_version(booking: &Booking, expected: Option<u64>) -> Result<(), AppError> {
    match expected {
        Some(version) if version != booking.version => Err(AppError::InvalidTransition(format!(
            "booking has changed since version {version} (now {}); reload and retry",
            booking.version
        ))),
        _ => Ok(()),
    }
}

/// Participants act on their own bookings only; administrators pass and are
/// then judged by the transition table.
fn ensure_participant(booking: &Booking, actor: Actor) -> Result<(), AppError> {
    let owns = match actor.role {
        Role::Customer => actor.id == booking.customer_id,
        Role::Carrier => actor.id == booking.carrier_id,
        Role::Admin => true,
    };

    if owns {
        Ok(())
    } else {
        Err(AppError::NotAuthorized(format!(
            "{} is not a party to this booking",
            actor.role.as_str()
        )))
    }
}

pub(crate) fn ensure_visible(booking: &Booking, actor: Actor) -> Result<(), AppError> {
    let visible = actor.role == Role::Admin
        || actor.id == booking.customer_id
        || actor.id == booking.carrier_id;

    if visible {
        Ok(())
    } else {
        Err(AppError::NotAuthorized(
            "booking belongs to someone else".to_string(),
        ))
    }
}

fn ensure_editable(booking: &Booking, actor: Actor) -> Result<(), AppError> {
    if actor.role != Role::Customer || actor.id != booking.customer_id {
        return Err(AppError::NotAuthorized(
            "only the customer who made the booking can edit it".to_string(),
        ));
    }
    if booking.status != Pending {
        return Err(AppError::InvalidTransition(
            "only pending bookings can be edited".to_string(),
        ));
    }
    Ok(())
}

fn validate_stop(stop: &Stop, label: &str) -> Result<(), AppError> {
    if stop.address.trim().is_empty() {
        return Err(AppError::Validation(format!("{label} address is required")));
    }
    if stop.coordinates.is_some_and(|point| !point.is_valid()) {
        return Err(AppError::Validation(format!(
            "{label} coordinates are out of range"
        )));
    }
    Ok(())
}

fn validate_schedule(origin: &Stop, destination: &Stop) -> Result<(), AppError> {
    if destination.scheduled_at < origin.scheduled_at {
        return Err(AppError::Validation(
            "delivery cannot be scheduled before pickup".to_string(),
        ));
    }
    Ok(())
}

fn validate_cargo(cargo: &Cargo) -> Result<(), AppError> {
    if !cargo.weight_kg.is_finite() || cargo.weight_kg <= 0.0 {
        return Err(AppError::Validation(
            "cargo weight must be greater than 0".to_string(),
        ));
    }
    if cargo
        .volume_m3
        .is_some_and(|volume| !volume.is_finite() || volume <= 0.0)
    {
        return Err(AppError::Validation(
            "cargo volume must be greater than 0 when given".to_string(),
        ));
    }
    Ok(())
}

fn not_found(id: Uuid) -> AppError {
    AppError::NotFound(format!("booking {id} not found"))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;
    use crate::engine::fixtures;

    const ALL: [BookingStatus; 5] = [Pending, Confirmed, InTransit, Completed, Cancelled];
    const ROLES: [Role; 3] = [Role::Customer, Role::Carrier, Role::Admin];

    fn change(status: BookingStatus) -> StatusChange {
        StatusChange {
            status,
            reason: None,
            actual_amount: None,
            expected_version: None,
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for current in [Completed, Cancelled] {
            for role in ROLES {
                for requested in ALL {
                    let err = authorize_transition(current, role, requested).unwrap_err();
                    assert!(
                        matches!(err, AppError::InvalidTransition(_)),
                        "{current:?} -> {requested:?} by {role:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn customer_cannot_confirm() {
        let err = authorize_transition(Pending, Role::Customer, Confirmed).unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(msg) if msg.contains("carrier")));
    }

    #[test]
    fn customer_cannot_cancel_confirmed_booking() {
        let err = authorize_transition(Confirmed, Role::Customer, Cancelled).unwrap_err();
        assert!(
            matches!(err, AppError::NotAuthorized(msg) if msg == "customers can only cancel pending bookings")
        );
    }

    #[test]
    fn skipping_states_is_invalid() {
        let err = authorize_transition(Pending, Role::Carrier, Completed).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let err = authorize_transition(InTransit, Role::Carrier, Cancelled).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[test]
    fn table_rows_are_all_allowed() {
        for (current, role, requested) in TRANSITIONS {
            assert!(authorize_transition(*current, *role, *requested).is_ok());
        }
    }

    #[tokio::test]
    async fn short_trip_is_priced_at_minimum_charge() {
        let (state, _recorder) = fixtures::state_with_route(12.0);
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));

        let created = create_booking(&state, fixtures::customer(), fixtures::new_booking(vehicle))
            .await
            .unwrap();

        assert_eq!(created.booking.pricing.distance_km, 12.0);
        assert_eq!(created.booking.pricing.estimated_amount, dec!(800));
        assert_eq!(created.booking.pricing.estimate_source, EstimateSource::Secondary);
        assert_eq!(created.booking.status, Pending);
        assert!(created.warning.is_none());
    }

    #[tokio::test]
    async fn long_trip_is_metered() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));

        let created = create_booking(&state, fixtures::customer(), fixtures::new_booking(vehicle))
            .await
            .unwrap();

        assert_eq!(created.booking.pricing.estimated_amount, dec!(2000));
    }

    #[tokio::test]
    async fn missing_coordinates_are_geocoded_before_estimating() {
        let (state, _recorder) = fixtures::state_offline();
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));
        let mut request = fixtures::new_booking(vehicle);
        request.origin.coordinates = None;

        let created = create_booking(&state, fixtures::customer(), request)
            .await
            .unwrap();

        assert!(created.booking.origin.coordinates.is_some());
        assert_eq!(created.booking.pricing.estimate_source, EstimateSource::Offline);
        assert!(created.booking.pricing.distance_km > 0.0);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected() {
        let (state, _recorder) = fixtures::state_offline();
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));

        let mut heavy = fixtures::new_booking(vehicle);
        heavy.cargo.weight_kg = 0.0;
        let err = create_booking(&state, fixtures::customer(), heavy)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("weight")));

        let mut blank = fixtures::new_booking(vehicle);
        blank.destination.address = "   ".to_string();
        let err = create_booking(&state, fixtures::customer(), blank)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(msg) if msg.contains("destination address")));

        let err = create_booking(&state, fixtures::customer(), fixtures::new_booking(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = create_booking(&state, fixtures::carrier(), fixtures::new_booking(vehicle))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
        assert!(state.bookings.is_empty());
    }

    #[tokio::test]
    async fn quote_prices_without_storing() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));

        let priced = quote(
            &state,
            QuoteRequest {
                vehicle_id: vehicle,
                origin: Place {
                    address: "Industrial Area, Nairobi".to_string(),
                    coordinates: None,
                },
                destination: Place {
                    address: String::new(),
                    coordinates: Some(GeoPoint {
                        lat: -1.0388,
                        lng: 37.0834,
                    }),
                },
            },
        )
        .await
        .unwrap();

        assert_eq!(priced.amount, dec!(2000));
        assert_eq!(priced.estimate_source, EstimateSource::Secondary);
        assert!(state.bookings.is_empty());
    }

    #[tokio::test]
    async fn quote_needs_somewhere_to_start() {
        let (state, _recorder) = fixtures::state_offline();
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));
        let nowhere = Place {
            address: " ".to_string(),
            coordinates: None,
        };

        let err = quote(
            &state,
            QuoteRequest {
                vehicle_id: vehicle,
                origin: nowhere.clone(),
                destination: nowhere,
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn overlapping_active_job_produces_warning() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));

        let first = create_booking(&state, fixtures::customer(), fixtures::new_booking(vehicle))
            .await
            .unwrap();
        update_status(&state, fixtures::carrier(), first.booking.id, change(Confirmed)).unwrap();

        let second = create_booking(&state, fixtures::customer(), fixtures::new_booking(vehicle))
            .await
            .unwrap();

        let warning = second.warning.unwrap();
        assert!(warning.contains(&first.booking.id.to_string()));
    }

    #[tokio::test]
    async fn full_lifecycle_by_carrier() {
        let (state, recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        for next in [Confirmed, InTransit, Completed] {
            let updated = update_status(&state, fixtures::carrier(), booking.id, change(next)).unwrap();
            assert_eq!(updated.status, next);
        }

        let stored = state.bookings.get(&booking.id).unwrap().clone();
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.version, booking.version + 3);
        assert!(recorder.kinds().contains(&NotificationKind::ReviewPrompt));

        for requested in ALL {
            assert!(update_status(&state, fixtures::carrier(), booking.id, change(requested)).is_err());
        }
    }

    #[tokio::test]
    async fn customer_cancels_pending_booking() {
        let (state, recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        let cancelled = cancel_booking(
            &state,
            fixtures::customer(),
            booking.id,
            "changed plans".to_string(),
            None,
        )
        .unwrap();

        assert_eq!(cancelled.status, Cancelled);
        let cancellation = cancelled.cancellation.unwrap();
        assert_eq!(cancellation.cancelled_by, fixtures::customer().id);
        assert_eq!(cancellation.reason, "changed plans");
        assert!(recorder.kinds().contains(&NotificationKind::StatusChanged));

        let err = update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let err = edit_booking(
            &state,
            fixtures::customer(),
            booking.id,
            BookingEdit {
                instructions: Some("ring twice".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn cancellation_requires_a_reason() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        let err = cancel_booking(&state, fixtures::customer(), booking.id, "  ".to_string(), None)
            .unwrap_err();

        assert!(matches!(err, AppError::Validation(_)));
        let stored = state.bookings.get(&booking.id).unwrap().clone();
        assert_eq!(stored.status, Pending);
        assert!(stored.cancellation.is_none());
    }

    #[tokio::test]
    async fn carrier_may_cancel_confirmed_but_customer_may_not() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap();

        let err = cancel_booking(&state, fixtures::customer(), booking.id, "too slow".to_string(), None)
            .unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));

        let cancelled = cancel_booking(
            &state,
            fixtures::carrier(),
            booking.id,
            "truck broke down".to_string(),
            None,
        )
        .unwrap();
        assert_eq!(cancelled.cancellation.unwrap().cancelled_by, fixtures::carrier().id);
    }

    #[tokio::test]
    async fn strangers_cannot_drive_transitions() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        let other_carrier = Actor {
            id: Uuid::new_v4(),
            role: Role::Carrier,
        };

        let err = update_status(&state, other_carrier, booking.id, change(Confirmed)).unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));

        let err = update_status(&state, fixtures::admin(), booking.id, change(Confirmed)).unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));
    }

    #[tokio::test]
    async fn stale_version_is_rejected_without_changes() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        let stale = booking.version;

        cancel_booking(&state, fixtures::customer(), booking.id, "changed plans".to_string(), Some(stale))
            .unwrap();

        let err = update_status(
            &state,
            fixtures::carrier(),
            booking.id,
            StatusChange {
                expected_version: Some(stale),
                ..change(Confirmed)
            },
        )
        .unwrap_err();

        assert!(matches!(err, AppError::InvalidTransition(msg) if msg.contains("reload")));
        assert_eq!(state.bookings.get(&booking.id).unwrap().status, Cancelled);
    }

    #[tokio::test]
    async fn actual_amount_only_on_completion() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        let err = update_status(
            &state,
            fixtures::carrier(),
            booking.id,
            StatusChange {
                actual_amount: Some(dec!(2500)),
                ..change(Confirmed)
            },
        )
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap();
        update_status(&state, fixtures::carrier(), booking.id, change(InTransit)).unwrap();
        let completed = update_status(
            &state,
            fixtures::carrier(),
            booking.id,
            StatusChange {
                actual_amount: Some(dec!(2500)),
                ..change(Completed)
            },
        )
        .unwrap();

        assert_eq!(completed.pricing.actual_amount, Some(dec!(2500)));
        assert_eq!(completed.pricing.amount_due(), dec!(2500));
    }

    #[tokio::test]
    async fn edit_reprices_and_notifies_carrier() {
        let (state, recorder) = fixtures::state_offline();
        let booking = fixtures::pending_booking(&state).await;
        let before = booking.pricing.distance_km;

        let mut destination = booking.destination.clone();
        destination.address = "Mombasa port".to_string();
        destination.coordinates = Some(GeoPoint {
            lat: -4.0435,
            lng: 39.6682,
        });

        let edited = edit_booking(
            &state,
            fixtures::customer(),
            booking.id,
            BookingEdit {
                destination: Some(destination),
                instructions: Some("call on arrival".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(edited.pricing.distance_km > before);
        assert!(edited.pricing.estimated_amount > booking.pricing.estimated_amount);
        assert_eq!(edited.instructions.as_deref(), Some("call on arrival"));
        assert_eq!(edited.version, booking.version + 1);
        assert!(recorder.kinds().contains(&NotificationKind::BookingEdited));
    }

    #[tokio::test]
    async fn edit_loses_to_cancel_that_lands_during_repricing() {
        let (state, recorder) =
            fixtures::state_with_slow_route(40.0, std::time::Duration::from_millis(50));
        let booking = fixtures::pending_booking(&state).await;

        let mut destination = booking.destination.clone();
        destination.address = "Mombasa port".to_string();
        destination.coordinates = Some(GeoPoint {
            lat: -4.0435,
            lng: 39.6682,
        });

        let (edited, cancelled) = tokio::join!(
            edit_booking(
                &state,
                fixtures::customer(),
                booking.id,
                BookingEdit {
                    destination: Some(destination),
                    ..Default::default()
                },
            ),
            async {
                cancel_booking(
                    &state,
                    fixtures::customer(),
                    booking.id,
                    "changed plans".to_string(),
                    None,
                )
            },
        );

        assert!(cancelled.is_ok());
        let err = edited.unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(msg) if msg.contains("in progress")));

        let stored = state.bookings.get(&booking.id).unwrap().clone();
        assert_eq!(stored.status, Cancelled);
        assert_eq!(stored.destination.address, booking.destination.address);
        assert_eq!(stored.pricing.distance_km, booking.pricing.distance_km);
        assert!(!recorder.kinds().contains(&NotificationKind::BookingEdited));
    }

    #[tokio::test]
    async fn edit_with_stale_version_is_rejected() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        edit_booking(
            &state,
            fixtures::customer(),
            booking.id,
            BookingEdit {
                instructions: Some("gate B".to_string()),
                expected_version: Some(booking.version),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let err = edit_booking(
            &state,
            fixtures::customer(),
            booking.id,
            BookingEdit {
                instructions: Some("gate C".to_string()),
                expected_version: Some(booking.version),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::InvalidTransition(msg) if msg.contains("reload")));
        let stored = state.bookings.get(&booking.id).unwrap().clone();
        assert_eq!(stored.instructions.as_deref(), Some("gate B"));
        assert_eq!(stored.version, booking.version + 1);
    }

    #[tokio::test]
    async fn strangers_learn_nothing_about_the_version() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        let stranger = Actor {
            id: Uuid::new_v4(),
            role: Role::Carrier,
        };

        let err = update_status(
            &state,
            stranger,
            booking.id,
            StatusChange {
                expected_version: Some(booking.version + 7),
                ..change(Confirmed)
            },
        )
        .unwrap_err();
        assert!(matches!(&err, AppError::NotAuthorized(msg) if !msg.contains("version")));

        let outsider = Actor {
            id: Uuid::new_v4(),
            role: Role::Customer,
        };
        let err = edit_booking(
            &state,
            outsider,
            booking.id,
            BookingEdit {
                instructions: Some("gate B".to_string()),
                expected_version: Some(booking.version + 7),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(&err, AppError::NotAuthorized(msg) if !msg.contains("version")));
    }

    #[tokio::test]
    async fn edit_rejected_once_confirmed() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap();

        let err = edit_booking(
            &state,
            fixtures::customer(),
            booking.id,
            BookingEdit {
                instructions: Some("leave at gate".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AppError::InvalidTransition(msg) if msg == "only pending bookings can be edited"));
    }

    #[tokio::test]
    async fn carrier_cannot_edit_and_empty_edit_is_invalid() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;

        let err = edit_booking(
            &state,
            fixtures::carrier(),
            booking.id,
            BookingEdit {
                instructions: Some("x".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));

        let err = edit_booking(&state, fixtures::customer(), booking.id, BookingEdit::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn tracking_only_while_in_transit() {
        let (state, recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        let here = GeoPoint {
            lat: -1.2,
            lng: 36.9,
        };
        let update = || TrackingUpdate {
            location: here,
            estimated_arrival: None,
        };

        let err = update_tracking(&state, fixtures::carrier(), booking.id, update()).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap();
        update_status(&state, fixtures::carrier(), booking.id, change(InTransit)).unwrap();

        let err = update_tracking(&state, fixtures::customer(), booking.id, update()).unwrap_err();
        assert!(matches!(err, AppError::NotAuthorized(_)));

        let tracked = update_tracking(&state, fixtures::carrier(), booking.id, update()).unwrap();
        let first = tracked.tracking.unwrap();
        assert_eq!(first.location, here);
        assert!(first.estimated_arrival > first.updated_at);

        let later = GeoPoint {
            lat: -1.1,
            lng: 37.0,
        };
        let eta = Utc::now() + Duration::minutes(5);
        let tracked = update_tracking(
            &state,
            fixtures::carrier(),
            booking.id,
            TrackingUpdate {
                location: later,
                estimated_arrival: Some(eta),
            },
        )
        .unwrap();
        let latest = tracked.tracking.unwrap();
        assert_eq!(latest.location, later);
        assert_eq!(latest.estimated_arrival, eta);
        assert!(recorder.kinds().contains(&NotificationKind::LocationUpdated));
    }

    #[tokio::test]
    async fn cash_collection_is_recorded_once() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let vehicle = fixtures::vehicle(&state, dec!(50), dec!(800));
        let mut request = fixtures::new_booking(vehicle);
        request.payment_method = PaymentMethod::Cash;
        let booking = create_booking(&state, fixtures::customer(), request)
            .await
            .unwrap()
            .booking;

        let err = mark_cash_collected(&state, fixtures::carrier(), booking.id).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        update_status(&state, fixtures::carrier(), booking.id, change(Confirmed)).unwrap();
        update_status(&state, fixtures::carrier(), booking.id, change(InTransit)).unwrap();

        let in_transit = state.bookings.get(&booking.id).unwrap().clone();

        let collected = mark_cash_collected(&state, fixtures::carrier(), booking.id).unwrap();
        assert_eq!(collected.payment.status, BookingPaymentStatus::Paid);
        assert!(collected.payment.cash_collected_at.is_some());
        assert_eq!(collected.version, in_transit.version);
        assert!(collected.updated_at >= in_transit.updated_at);

        let err = mark_cash_collected(&state, fixtures::carrier(), booking.id).unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn bookings_are_visible_to_parties_only() {
        let (state, _recorder) = fixtures::state_with_route(40.0);
        let booking = fixtures::pending_booking(&state).await;
        let stranger = Actor {
            id: Uuid::new_v4(),
            role: Role::Customer,
        };

        assert!(get_booking(&state, fixtures::customer(), booking.id).is_ok());
        assert!(get_booking(&state, fixtures::admin(), booking.id).is_ok());
        assert!(matches!(
            get_booking(&state, stranger, booking.id),
            Err(AppError::NotAuthorized(_))
        ));
        assert_eq!(list_bookings(&state, fixtures::carrier()).len(), 1);
        assert!(list_bookings(&state, stranger).is_empty());
    }
}
