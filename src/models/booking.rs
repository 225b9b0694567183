use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::payment::PaymentMethod;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InTransit,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InTransit => "in-transit",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub address: String,
    pub coordinates: Option<GeoPoint>,
    pub contact: String,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CargoType {
    General,
    Perishable,
    Fragile,
    Furniture,
    Construction,
    Livestock,
    Electronics,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cargo {
    pub cargo_type: CargoType,
    pub weight_kg: f64,
    pub volume_m3: Option<f64>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pictures: Vec<String>,
    #[serde(default)]
    pub delicate: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EstimateSource {
    Primary,
    Secondary,
    Offline,
    Default,
}

impl EstimateSource {
    pub fn as_str(self) -> &'static str {
        match self {
            EstimateSource::Primary => "primary",
            EstimateSource::Secondary => "secondary",
            EstimateSource::Offline => "offline",
            EstimateSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pricing {
    pub distance_km: f64,
    pub duration_min: f64,
    pub estimate_source: EstimateSource,
    pub rate_per_km: Decimal,
    pub minimum_charge: Decimal,
    pub estimated_amount: Decimal,
    pub actual_amount: Option<Decimal>,
    pub cancellation_fee: Option<Decimal>,
}

impl Pricing {
    /// Amount the customer owes: the carrier's actual figure once known,
    /// otherwise the estimate.
    pub fn amount_due(&self) -> Decimal {
        self.actual_amount.unwrap_or(self.estimated_amount)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BookingPaymentStatus {
    Pending,
    Processing,
    Paid,
    Failed,
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub payment_id: Option<Uuid>,
    pub status: BookingPaymentStatus,
    pub method: PaymentMethod,
    pub cash_collected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tracking {
    pub location: GeoPoint,
    pub updated_at: DateTime<Utc>,
    pub estimated_arrival: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub reason: String,
    pub cancelled_by: Uuid,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub carrier_id: Uuid,
    pub vehicle_id: Uuid,
    pub origin: Stop,
    pub destination: Stop,
    pub cargo: Cargo,
    pub instructions: Option<String>,
    pub pricing: Pricing,
    pub status: BookingStatus,
    pub payment: PaymentInfo,
    pub tracking: Option<Tracking>,
    pub cancellation: Option<Cancellation>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            BookingStatus::Confirmed | BookingStatus::InTransit
        )
    }

    /// Every mutation goes through here so stale writers can be detected.
    pub fn touch(&mut self) {
        self.version += 1;
        self.updated_at = Utc::now();
    }
}
