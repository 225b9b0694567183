use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use tracing::warn;

use crate::models::booking::{EstimateSource, GeoPoint};
use crate::routing::{coordinate_pair, Geocoder, RawRoute, RouteEstimate, RouteProvider};

/// Primary tier: token-authenticated directions and forward geocoding.
#[derive(Clone)]
pub struct MapboxClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct DirectionsResponse {
    #[serde(default)]
    routes: Vec<RawRoute>,
}

#[derive(Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Deserialize)]
struct Feature {
    /// `[lng, lat]`
    center: [f64; 2],
}

impl MapboxClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn directions(&self, from: &GeoPoint, to: &GeoPoint) -> Result<DirectionsResponse, String> {
        let url = format!(
            "{}/directions/v5/mapbox/driving/{}",
            self.base_url,
            coordinate_pair(from, to)
        );

        self.http
            .get(url)
            .query(&[("access_token", self.token.as_str()), ("overview", "false")])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| format!("directions request failed: {err}"))?
            .json::<DirectionsResponse>()
            .await
            .map_err(|err| format!("malformed directions response: {err}"))
    }

    async fn forward_geocode(&self, address: &str) -> Result<GeocodingResponse, String> {
        let query = format!("{address}.json");
        let mut url =
            Url::parse(&self.base_url).map_err(|err| format!("invalid base url: {err}"))?;
        url.path_segments_mut()
            .map_err(|_| "base url cannot carry a path".to_string())?
            .pop_if_empty()
            .extend(["geocoding", "v5", "mapbox.places", query.as_str()]);
        url.query_pairs_mut()
            .append_pair("access_token", &self.token)
            .append_pair("limit", "1");

        self.http
            .get(url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| format!("geocoding request failed: {err}"))?
            .json::<GeocodingResponse>()
            .await
            .map_err(|err| format!("malformed geocoding response: {err}"))
    }
}

#[async_trait]
impl RouteProvider for MapboxClient {
    fn source(&self) -> EstimateSource {
        EstimateSource::Primary
    }

    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteEstimate> {
        match self.directions(&from, &to).await {
            Ok(body) => body
                .routes
                .into_iter()
                .next()
                .map(|route| route.into_estimate(EstimateSource::Primary)),
            Err(err) => {
                warn!(error = %err, "primary routing failed");
                None
            }
        }
    }
}

#[async_trait]
impl Geocoder for MapboxClient {
    async fn geocode(&self, address: &str) -> Option<GeoPoint> {
        match self.forward_geocode(address).await {
            Ok(body) => body.features.into_iter().next().map(|feature| GeoPoint {
                lat: feature.center[1],
                lng: feature.center[0],
            }),
            Err(err) => {
                warn!(error = %err, "primary geocoding failed");
                None
            }
        }
    }
}
