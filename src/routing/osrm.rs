use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::warn;

use crate::models::booking::{EstimateSource, GeoPoint};
use crate::routing::{coordinate_pair, RawRoute, RouteEstimate, RouteProvider};

/// Secondary tier: open routing service, no credential.
#[derive(Clone)]
pub struct OsrmClient {
    http: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct RouteResponse {
    code: String,
    #[serde(default)]
    routes: Vec<RawRoute>,
}

impl OsrmClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch(&self, from: &GeoPoint, to: &GeoPoint) -> Result<RouteResponse, String> {
        let url = format!(
            "{}/route/v1/driving/{}",
            self.base_url,
            coordinate_pair(from, to)
        );

        self.http
            .get(url)
            .query(&[("overview", "false")])
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| format!("route request failed: {err}"))?
            .json::<RouteResponse>()
            .await
            .map_err(|err| format!("malformed route response: {err}"))
    }
}

#[async_trait]
impl RouteProvider for OsrmClient {
    fn source(&self) -> EstimateSource {
        EstimateSource::Secondary
    }

    async fn route(&self, from: GeoPoint, to: GeoPoint) -> Option<RouteEstimate> {
        match self.fetch(&from, &to).await {
            Ok(body) if body.code == "Ok" => body
                .routes
                .into_iter()
                .next()
                .map(|route| route.into_estimate(EstimateSource::Secondary)),
            Ok(body) => {
                warn!(code = %body.code, "secondary routing returned no route");
                None
            }
            Err(err) => {
                warn!(error = %err, "secondary routing failed");
                None
            }
        }
    }
}
