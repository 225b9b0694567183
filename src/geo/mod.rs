use std::str::FromStr;

use crate::models::booking::GeoPoint;

const EARTH_RADIUS_KM: f64 = 6_371.0;

/// Straight-line distance understates road distance; this is the empirical
/// ratio between the two for the regions we serve.
pub const ROAD_INDIRECTION_FACTOR: f64 = 1.35;

const AVERAGE_SPEED_KMH: f64 = 40.0;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

pub fn road_distance_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    haversine_km(a, b) * ROAD_INDIRECTION_FACTOR
}

/// Linear drive-time model used whenever no routing provider answered.
pub fn drive_minutes(distance_km: f64) -> f64 {
    (distance_km / AVERAGE_SPEED_KMH * 60.0).max(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        (self.min_lat..=self.max_lat).contains(&point.lat)
            && (self.min_lng..=self.max_lng).contains(&point.lng)
    }
}

impl FromStr for BoundingBox {
    type Err = String;

    /// Parses `min_lat,min_lng,max_lat,max_lng`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let parts = raw
            .split(',')
            .map(|part| part.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| format!("bounding box coordinate: {err}"))?;

        let &[min_lat, min_lng, max_lat, max_lng] = parts.as_slice() else {
            return Err(format!("expected 4 coordinates, got {}", parts.len()));
        };

        if min_lat >= max_lat || min_lng >= max_lng {
            return Err("bounding box minimums must be below maximums".to_string());
        }

        Ok(Self {
            min_lat,
            min_lng,
            max_lat,
            max_lng,
        })
    }
}

/// Deterministic stand-in coordinate for an address nobody could geocode.
/// The same address always lands on the same point inside `region`.
pub fn pseudo_coordinates(address: &str, region: &BoundingBox) -> GeoPoint {
    let normalized = address.trim().to_lowercase();
    let hash = fnv1a(normalized.as_bytes());

    let lat_fraction = (hash & 0xFFFF_FFFF) as f64 / u32::MAX as f64;
    let lng_fraction = (hash >> 32) as f64 / u32::MAX as f64;

    GeoPoint {
        lat: region.min_lat + lat_fraction * (region.max_lat - region.min_lat),
        lng: region.min_lng + lng_fraction * (region.max_lng - region.min_lng),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kenya() -> BoundingBox {
        BoundingBox {
            min_lat: -4.7,
            min_lng: 33.9,
            max_lat: 5.0,
            max_lng: 41.9,
        }
    }

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: -1.2921,
            lng: 36.8219,
        };
        let distance = haversine_km(&p, &p);
        assert!(distance < 1e-9);
    }

    #[test]
    fn nairobi_to_mombasa_is_around_440_km_straight_line() {
        let nairobi = GeoPoint {
            lat: -1.2921,
            lng: 36.8219,
        };
        let mombasa = GeoPoint {
            lat: -4.0435,
            lng: 39.6682,
        };
        let distance = haversine_km(&nairobi, &mombasa);
        assert!((distance - 440.0).abs() < 10.0);
    }

    #[test]
    fn road_distance_applies_indirection_factor() {
        let a = GeoPoint { lat: 0.0, lng: 36.0 };
        let b = GeoPoint { lat: 0.1, lng: 36.1 };
        let straight = haversine_km(&a, &b);
        assert!((road_distance_km(&a, &b) - straight * 1.35).abs() < 1e-9);
    }

    #[test]
    fn drive_minutes_never_drops_below_one() {
        assert_eq!(drive_minutes(0.0), 1.0);
        assert!((drive_minutes(40.0) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn pseudo_coordinates_are_stable_and_inside_region() {
        let region = kenya();
        let first = pseudo_coordinates("Moi Avenue, Nairobi", &region);
        let second = pseudo_coordinates("  moi avenue, nairobi ", &region);

        assert_eq!(first, second);
        assert!(region.contains(&first));
    }

    #[test]
    fn different_addresses_spread_out() {
        let region = kenya();
        let a = pseudo_coordinates("Kisumu bus park", &region);
        let b = pseudo_coordinates("Eldoret town", &region);
        assert_ne!(a, b);
    }

    #[test]
    fn bounding_box_parses_and_rejects_inverted_ranges() {
        let parsed: BoundingBox = "-4.7, 33.9, 5.0, 41.9".parse().unwrap();
        assert_eq!(parsed, kenya());

        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("5,2,1,4".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }
}
