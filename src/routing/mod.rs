//! Distance and duration estimation.
//!
//! Each routing tier is a [`RouteProvider`] that answers `Some` or `None`.
//! [`Estimator::estimate`] walks the tiers in order under a per-tier timeout
//! and finishes with an offline great-circle estimate, so it always returns a
//! usable figure.

pub mod mapbox;
pub mod osrm;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::RoutingConfig;
use crate::error::AppError;
use crate::geo::{self, BoundingBox};
use crate::models::booking::{EstimateSource, GeoPoint};

use self::mapbox::MapboxClient;
use self::osrm::OsrmClient;

/// Returned when coordinates are missing or unusable.
pub const DEFAULT_DISTANCE_KM: f64 = 50.0;
pub const DEFAULT_DURATION_MIN: f64 = 60.0;

/// Two pins on the same spot still describe a trip.
const MIN_DISTANCE_KM: f64 = 0.1;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_min: f64,
    pub source: EstimateSource,
}

#[async_trait]
pub trait RouteProvider: Send + Sync {
    fn source(&self) -> EstimateSource;

    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteEstimate>;
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Option<GeoPoint>;
}

pub struct Estimator {
    providers: Vec<Arc<dyn RouteProvider>>,
    geocoders: Vec<Arc<dyn Geocoder>>,
    tier_timeout: Duration,
    region: BoundingBox,
}

impl Estimator {
    pub fn new(tier_timeout: Duration, region: BoundingBox) -> Self {
        Self {
            providers: Vec::new(),
            geocoders: Vec::new(),
            tier_timeout,
            region,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn RouteProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_geocoder(mut self, geocoder: Arc<dyn Geocoder>) -> Self {
        self.geocoders.push(geocoder);
        self
    }

    /// Primary tier only when a token is configured; the open routing
    /// service needs no credential and is always in the chain.
    pub fn from_config(config: &RoutingConfig) -> Result<Self, AppError> {
        let tier_timeout = Duration::from_millis(config.timeout_ms);
        let mut estimator = Self::new(tier_timeout, config.geocode_region);

        if let Some(token) = &config.primary_token {
            let mapbox = Arc::new(
                MapboxClient::new(&config.primary_url, token, tier_timeout).map_err(|err| {
                    AppError::Internal(format!("failed to build primary routing client: {err}"))
                })?,
            );
            estimator = estimator
                .with_provider(mapbox.clone())
                .with_geocoder(mapbox);
        }

        let osrm = OsrmClient::new(&config.secondary_url, tier_timeout).map_err(|err| {
            AppError::Internal(format!("failed to build secondary routing client: {err}"))
        })?;

        Ok(estimator.with_provider(Arc::new(osrm)))
    }

    pub async fn estimate(&self, from: Option<GeoPoint>, to: Option<GeoPoint>) -> RouteEstimate {
        let (Some(from), Some(to)) = (valid(from), valid(to)) else {
            return offline_estimate(None, None);
        };

        for provider in &self.providers {
            let source = provider.source();
            match timeout(self.tier_timeout, provider.route(from, to)).await {
                Ok(Some(estimate)) if is_usable(&estimate) => return normalize(estimate),
                Ok(Some(estimate)) => {
                    warn!(
                        source = source.as_str(),
                        distance_km = estimate.distance_km,
                        "routing tier returned unusable estimate"
                    );
                }
                Ok(None) => debug!(source = source.as_str(), "routing tier had no answer"),
                Err(_) => warn!(source = source.as_str(), "routing tier timed out"),
            }
        }

        offline_estimate(Some(from), Some(to))
    }

    /// Resolves an address to coordinates. Falls back to a deterministic
    /// pseudo-coordinate inside the configured region so booking creation
    /// never blocks on geocoding.
    pub async fn resolve(&self, address: &str) -> GeoPoint {
        for geocoder in &self.geocoders {
            match timeout(self.tier_timeout, geocoder.geocode(address)).await {
                Ok(Some(point)) if point.is_valid() => return point,
                Ok(_) => debug!("geocoder had no usable answer"),
                Err(_) => warn!("geocoder timed out"),
            }
        }

        geo::pseudo_coordinates(address, &self.region)
    }
}

pub fn offline_estimate(from: Option<GeoPoint>, to: Option<GeoPoint>) -> RouteEstimate {
    match (valid(from), valid(to)) {
        (Some(from), Some(to)) => {
            let distance_km = geo::road_distance_km(&from, &to).max(MIN_DISTANCE_KM);
            normalize(RouteEstimate {
                distance_km,
                duration_min: geo::drive_minutes(distance_km),
                source: EstimateSource::Offline,
            })
        }
        _ => RouteEstimate {
            distance_km: DEFAULT_DISTANCE_KM,
            duration_min: DEFAULT_DURATION_MIN,
            source: EstimateSource::Default,
        },
    }
}

fn valid(point: Option<GeoPoint>) -> Option<GeoPoint> {
    point.filter(GeoPoint::is_valid)
}

fn is_usable(estimate: &RouteEstimate) -> bool {
    estimate.distance_km.is_finite()
        && estimate.distance_km > 0.0
        && estimate.duration_min.is_finite()
        && estimate.duration_min > 0.0
}

fn normalize(estimate: RouteEstimate) -> RouteEstimate {
    RouteEstimate {
        distance_km: round2(estimate.distance_km).max(MIN_DISTANCE_KM),
        duration_min: estimate.duration_min.ceil().max(1.0),
        source: estimate.source,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Route leg as both HTTP providers report it: metres and seconds.
#[derive(Debug, Deserialize)]
pub(crate) struct RawRoute {
    pub distance: f64,
    pub duration: f64,
}

impl RawRoute {
    pub(crate) fn into_estimate(self, source: EstimateSource) -> RouteEstimate {
        RouteEstimate {
            distance_km: self.distance / 1_000.0,
            duration_min: self.duration / 60.0,
            source,
        }
    }
}

pub(crate) fn coordinate_pair(from: &GeoPoint, to: &GeoPoint) -> String {
    format!("{},{};{},{}", from.lng, from.lat, to.lng, to.lat)
}
