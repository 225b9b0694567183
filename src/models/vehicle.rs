use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RateCard {
    pub rate_per_km: Decimal,
    pub minimum_charge: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub carrier_id: Uuid,
    pub label: String,
    pub rate_card: RateCard,
    pub registered_at: DateTime<Utc>,
}
