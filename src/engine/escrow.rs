//! Escrow payment coordination.
//!
//! Funds captured by the gateway sit in escrow (`held`) until an operator
//! releases them to the carrier or refunds them to the customer. Both moves
//! are compare-and-swap writes on the payment entry, so a second release or
//! refund of the same payment is refused.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::lifecycle::ensure_visible;
use crate::error::AppError;
use crate::gateway::{GatewayCallback, GatewayError, PushRequest};
use crate::models::actor::{Actor, Role};
use crate::models::booking::{Booking, BookingPaymentStatus, BookingStatus};
use crate::models::payment::{EscrowStatus, Payment, PaymentMethod, PaymentStatus, ProviderRefs};
use crate::notify::{Notification, NotificationKind, Recipient};
use crate::state::AppState;

/// Strips spaces and dashes; accepts an optional leading `+` and 9 to 15 digits.
pub fn normalize_phone(raw: &str) -> Result<String, AppError> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    let digits = compact.strip_prefix('+').unwrap_or(&compact);

    if (9..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits.to_string())
    } else {
        Err(AppError::Validation(format!(
            "{raw:?} is not a valid phone number"
        )))
    }
}

pub async fn initiate_payment(
    state: &AppState,
    actor: Actor,
    booking_id: Uuid,
    phone: &str,
) -> Result<Payment, AppError> {
    let phone = normalize_phone(phone)?;

    let booking = state
        .bookings
        .get(&booking_id)
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))?
        .value()
        .clone();

    if actor.role != Role::Customer || actor.id != booking.customer_id {
        return Err(AppError::NotAuthorized(
            "only the booking's customer can pay for it".to_string(),
        ));
    }
    if booking.status == BookingStatus::Cancelled {
        return Err(AppError::InvalidTransition(
            "cancelled bookings cannot be paid".to_string(),
        ));
    }
    if booking.payment.method != PaymentMethod::MobileMoney {
        return Err(AppError::Validation(
            "booking is not set up for mobile-money payment".to_string(),
        ));
    }
    ensure_unpaid(booking.payment.status)?;

    let amount = booking.pricing.amount_due();
    let request = PushRequest {
        reference: Uuid::new_v4(),
        phone: phone.clone(),
        amount,
        description: format!("freight booking {}", booking.id.simple()),
    };

    let outcome = state.gateway.push(&request).await;

    let mut payment = Payment {
        id: request.reference,
        booking_id,
        payer_id: actor.id,
        payer_phone: phone,
        amount,
        method: PaymentMethod::MobileMoney,
        provider: ProviderRefs::default(),
        status: PaymentStatus::Processing,
        escrow: None,
        failure_reason: None,
        refund_reason: None,
        operator_note: None,
        created_at: Utc::now(),
        paid_at: None,
        released_at: None,
        refunded_at: None,
    };

    match outcome {
        Ok(receipt) => {
            payment.provider.checkout_request_id = Some(receipt.checkout_request_id.clone());
            payment.provider.merchant_request_id = receipt.merchant_request_id;

            state.payments.insert(payment.id, payment.clone());
            state
                .checkout_index
                .insert(receipt.checkout_request_id, payment.id);

            if let Some(mut entry) = state.bookings.get_mut(&booking_id) {
                let booking = entry.value_mut();
                if ensure_unpaid(booking.payment.status).is_ok() {
                    booking.payment.payment_id = Some(payment.id);
                    booking.payment.status = BookingPaymentStatus::Processing;
                    booking.updated_at = Utc::now();
                }
            }

            state
                .metrics
                .payments_total
                .with_label_values(&["initiated"])
                .inc();
            info!(
                booking_id = %booking_id,
                payment_id = %payment.id,
                amount = %amount,
                "payment push accepted"
            );
        }
        Err(GatewayError::NotConfigured) => {
            return Err(AppError::UpstreamUnavailable(
                "mobile-money payments are not available".to_string(),
            ));
        }
        Err(err) => {
            payment.status = PaymentStatus::Failed;
            payment.failure_reason = Some(err.to_string());
            state.payments.insert(payment.id, payment.clone());

            state
                .metrics
                .payments_total
                .with_label_values(&["failed"])
                .inc();
            warn!(
                booking_id = %booking_id,
                payment_id = %payment.id,
                error = %err,
                "payment push failed"
            );
            state.notifier.dispatch(Notification::new(
                Recipient::User(booking.customer_id),
                NotificationKind::PaymentFailed,
                booking_id,
                booking.status,
                "we could not start your payment; please try again",
            ));
        }
    }

    Ok(payment)
}

fn ensure_unpaid(status: BookingPaymentStatus) -> Result<(), AppError> {
    match status {
        BookingPaymentStatus::Paid => Err(AppError::InvalidTransition(
            "booking is already paid".to_string(),
        )),
        BookingPaymentStatus::Refunded => Err(AppError::InvalidTransition(
            "booking payment was refunded".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Applies a gateway confirmation. Only a `processing` payment changes;
/// repeated or late callbacks return the payment as it stands.
pub fn handle_callback(state: &AppState, callback: GatewayCallback) -> Result<Payment, AppError> {
    let payment_id = state
        .checkout_index
        .get(&callback.checkout_request_id)
        .map(|entry| *entry.value())
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "no payment for checkout request {}",
                callback.checkout_request_id
            ))
        })?;

    let payment = {
        let mut entry = state
            .payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))?;
        let payment = entry.value_mut();

        if payment.status != PaymentStatus::Processing {
            info!(
                payment_id = %payment_id,
                status = ?payment.status,
                "ignoring callback for settled payment"
            );
            return Ok(payment.clone());
        }

        if callback.is_success() {
            payment.status = PaymentStatus::Completed;
            payment.escrow = Some(EscrowStatus::Held);
            payment.paid_at = Some(Utc::now());
            payment.provider.receipt_number = callback.receipt_number.clone();
        } else {
            payment.status = PaymentStatus::Failed;
            payment.failure_reason = Some(if callback.result_desc.is_empty() {
                format!("gateway result code {}", callback.result_code)
            } else {
                callback.result_desc.clone()
            });
        }
        payment.clone()
    };

    let outcome = if callback.is_success() { "captured" } else { "failed" };
    state
        .metrics
        .payments_total
        .with_label_values(&[outcome])
        .inc();
    info!(
        payment_id = %payment.id,
        booking_id = %payment.booking_id,
        result_code = callback.result_code,
        "payment callback applied"
    );

    let Some(booking) = mirror_callback(state, &payment) else {
        warn!(payment_id = %payment.id, "payment references a missing booking");
        return Ok(payment);
    };

    if callback.is_success() {
        state.notifier.dispatch(Notification::new(
            Recipient::User(booking.customer_id),
            NotificationKind::PaymentConfirmed,
            booking.id,
            booking.status,
            format!("payment of {} received and held in escrow", payment.amount),
        ));

        if booking.status.is_terminal() {
            state.notifier.dispatch(Notification::new(
                Recipient::Operators,
                NotificationKind::AwaitingSettlement,
                booking.id,
                booking.status,
                format!("payment {} captured on a closed booking", payment.id),
            ));
        }
    } else {
        state.notifier.dispatch(Notification::new(
            Recipient::User(booking.customer_id),
            NotificationKind::PaymentFailed,
            booking.id,
            booking.status,
            "payment was not completed; you can try again",
        ));
    }

    Ok(payment)
}

/// Mirrors a callback outcome onto the booking's payment sub-record and
/// returns the booking as written.
fn mirror_callback(state: &AppState, payment: &Payment) -> Option<Booking> {
    let mut entry = state.bookings.get_mut(&payment.booking_id)?;
    let booking = entry.value_mut();
    let current = booking.payment.payment_id == Some(payment.id);

    match payment.status {
        PaymentStatus::Completed => {
            if booking.payment.status == BookingPaymentStatus::Paid && !current {
                warn!(
                    booking_id = %booking.id,
                    payment_id = %payment.id,
                    "second payment captured for an already paid booking"
                );
                state.notifier.dispatch(Notification::new(
                    Recipient::Operators,
                    NotificationKind::AwaitingSettlement,
                    booking.id,
                    booking.status,
                    format!("duplicate payment {} captured; refund it", payment.id),
                ));
            } else {
                booking.payment.payment_id = Some(payment.id);
                booking.payment.status = BookingPaymentStatus::Paid;
            }
        }
        PaymentStatus::Failed => {
            if current && booking.payment.status != BookingPaymentStatus::Paid {
                booking.payment.status = BookingPaymentStatus::Failed;
            }
        }
        _ => {}
    }

    booking.updated_at = Utc::now();
    Some(booking.clone())
}

/// Moves escrow to `next` only if it currently holds one of `allowed`.
/// Returns the payment as written and the escrow state it replaced.
pub fn compare_and_swap_escrow(
    state: &AppState,
    payment_id: Uuid,
    allowed: &[EscrowStatus],
    next: EscrowStatus,
    apply: impl FnOnce(&mut Payment),
) -> Result<(Payment, EscrowStatus), AppError> {
    let mut entry = state
        .payments
        .get_mut(&payment_id)
        .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))?;
    let payment = entry.value_mut();

    let Some(current) = payment.escrow else {
        return Err(AppError::InvalidTransition(
            "payment has no captured funds in escrow".to_string(),
        ));
    };

    if !allowed.contains(&current) {
        return Err(AppError::InvalidTransition(format!(
            "escrow is {} and cannot become {}",
            current.as_str(),
            next.as_str()
        )));
    }

    payment.escrow = Some(next);
    apply(payment);
    Ok((payment.clone(), current))
}

pub fn release(state: &AppState, actor: Actor, payment_id: Uuid) -> Result<Payment, AppError> {
    let result = release_inner(state, actor, payment_id);
    record_escrow_action(state, "release", &result);
    result
}

fn release_inner(state: &AppState, actor: Actor, payment_id: Uuid) -> Result<Payment, AppError> {
    ensure_admin(actor, "release escrow")?;

    let booking_id = booking_of(state, payment_id)?;
    let (status, carrier_id) = state
        .bookings
        .get(&booking_id)
        .map(|booking| (booking.status, booking.carrier_id))
        .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))?;

    if status != BookingStatus::Completed {
        return Err(AppError::NotEligible(format!(
            "escrow is released only for completed bookings; booking is {}",
            status.as_str()
        )));
    }

    let (payment, _) = compare_and_swap_escrow(
        state,
        payment_id,
        &[EscrowStatus::Held],
        EscrowStatus::Released,
        |payment| payment.released_at = Some(Utc::now()),
    )?;

    info!(payment_id = %payment.id, booking_id = %booking_id, amount = %payment.amount, "escrow released");
    state.notifier.dispatch(Notification::new(
        Recipient::User(carrier_id),
        NotificationKind::EscrowReleased,
        booking_id,
        status,
        format!("{} released to you", payment.amount),
    ));

    Ok(payment)
}

pub fn refund(
    state: &AppState,
    actor: Actor,
    payment_id: Uuid,
    reason: &str,
    note: Option<String>,
) -> Result<Payment, AppError> {
    let result = refund_inner(state, actor, payment_id, reason, note);
    record_escrow_action(state, "refund", &result);
    result
}

fn refund_inner(
    state: &AppState,
    actor: Actor,
    payment_id: Uuid,
    reason: &str,
    note: Option<String>,
) -> Result<Payment, AppError> {
    ensure_admin(actor, "approve refunds")?;

    let reason = reason.trim();
    if reason.is_empty() {
        return Err(AppError::Validation(
            "a refund reason is required".to_string(),
        ));
    }

    let (payment, previous) = compare_and_swap_escrow(
        state,
        payment_id,
        &[EscrowStatus::Held, EscrowStatus::Released],
        EscrowStatus::Refunded,
        |payment| {
            payment.status = PaymentStatus::Refunded;
            payment.refunded_at = Some(Utc::now());
            payment.refund_reason = Some(reason.to_string());
            payment.operator_note = note.filter(|note| !note.trim().is_empty());
        },
    )?;

    if previous == EscrowStatus::Released {
        warn!(
            payment_id = %payment.id,
            booking_id = %payment.booking_id,
            reason,
            "refunding escrow that was already released to the carrier"
        );
    } else {
        info!(payment_id = %payment.id, booking_id = %payment.booking_id, reason, "escrow refunded");
    }

    if let Some(mut entry) = state.bookings.get_mut(&payment.booking_id) {
        let booking = entry.value_mut();
        if booking.payment.payment_id == Some(payment.id) {
            booking.payment.status = BookingPaymentStatus::Refunded;
            booking.updated_at = Utc::now();
        }

        state.notifier.dispatch(Notification::new(
            Recipient::User(booking.customer_id),
            NotificationKind::PaymentRefunded,
            booking.id,
            booking.status,
            format!("{} refunded: {reason}", payment.amount),
        ));
    }

    Ok(payment)
}

fn record_escrow_action(state: &AppState, action: &str, result: &Result<Payment, AppError>) {
    let outcome = if result.is_ok() { "applied" } else { "rejected" };
    state
        .metrics
        .escrow_actions_total
        .with_label_values(&[action, outcome])
        .inc();
}

/// Held funds on bookings that have closed, oldest first.
pub fn awaiting_settlement(state: &AppState, actor: Actor) -> Result<Vec<Payment>, AppError> {
    ensure_admin(actor, "review escrow")?;

    let mut payments: Vec<Payment> = state
        .payments
        .iter()
        .filter(|entry| entry.escrow == Some(EscrowStatus::Held))
        .filter(|entry| {
            state
                .bookings
                .get(&entry.booking_id)
                .is_some_and(|booking| booking.status.is_terminal())
        })
        .map(|entry| entry.value().clone())
        .collect();

    payments.sort_by_key(|payment| payment.paid_at);
    Ok(payments)
}

pub fn payments_for_booking(
    state: &AppState,
    actor: Actor,
    booking_id: Uuid,
) -> Result<Vec<Payment>, AppError> {
    {
        let booking = state
            .bookings
            .get(&booking_id)
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))?;
        ensure_visible(&booking, actor)?;
    }

    let mut payments: Vec<Payment> = state
        .payments
        .iter()
        .filter(|entry| entry.booking_id == booking_id)
        .map(|entry| entry.value().clone())
        .collect();

    payments.sort_by_key(|payment| payment.created_at);
    Ok(payments)
}

pub fn get_payment(state: &AppState, actor: Actor, payment_id: Uuid) -> Result<Payment, AppError> {
    let payment = state
        .payments
        .get(&payment_id)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))?;

    let booking = state
        .bookings
        .get(&payment.booking_id)
        .ok_or_else(|| AppError::NotFound(format!("booking {} not found", payment.booking_id)))?;
    ensure_visible(&booking, actor)?;

    Ok(payment)
}

fn booking_of(state: &AppState, payment_id: Uuid) -> Result<Uuid, AppError> {
    state
        .payments
        .get(&payment_id)
        .map(|payment| payment.booking_id)
        .ok_or_else(|| AppError::NotFound(format!("payment {payment_id} not found")))
}

fn ensure_admin(actor: Actor, action: &str) -> Result<(), AppError> {
    if actor.role == Role::Admin {
        Ok(())
    } else {
        Err(AppError::NotAuthorized(format!(
            "only administrators can {action}"
        )))
    }
}
