use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::vehicle::RateCard;

/// Upper bounds accepted by `validate_rate_card`.
pub const MAX_RATE_PER_KM: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);
pub const MAX_MINIMUM_CHARGE: Decimal = Decimal::from_parts(100_000_000, 0, 0, false, 0);

/// `max(rate_per_km * distance_km, minimum_charge)`, rounded to cents.
/// The minimum charge always applies, however short the trip.
pub fn fare(distance_km: f64, rate_card: &RateCard) -> Decimal {
    let distance = Decimal::from_f64(distance_km.max(0.0)).unwrap_or(Decimal::ZERO);
    let metered = rate_card
        .rate_per_km
        .checked_mul(distance)
        .unwrap_or(Decimal::MAX)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

    metered.max(rate_card.minimum_charge)
}

pub fn validate_rate_card(rate_card: &RateCard) -> Result<(), String> {
    if rate_card.rate_per_km <= Decimal::ZERO {
        return Err("rate_per_km must be > 0".to_string());
    }

    if rate_card.rate_per_km > MAX_RATE_PER_KM {
        return Err(format!("rate_per_km cannot exceed {MAX_RATE_PER_KM}"));
    }

    if rate_card.minimum_charge < Decimal::ZERO {
        return Err("minimum_charge cannot be negative".to_string());
    }

    if rate_card.minimum_charge > MAX_MINIMUM_CHARGE {
        return Err(format!("minimum_charge cannot exceed {MAX_MINIMUM_CHARGE}"));
    }

    Ok(())
}
