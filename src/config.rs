use std::env;

use crate::error::AppError;
use crate::geo::BoundingBox;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub routing: RoutingConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone)]
pub struct RoutingConfig {
    pub primary_token: Option<String>,
    pub primary_url: String,
    pub secondary_url: String,
    pub timeout_ms: u64,
    pub geocode_region: BoundingBox,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub callback_url: String,
    pub timeout_ms: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            routing: RoutingConfig {
                primary_token: optional("PRIMARY_ROUTING_TOKEN"),
                primary_url: env::var("PRIMARY_ROUTING_URL")
                    .unwrap_or_else(|_| "https://api.mapbox.com".to_string()),
                secondary_url: env::var("SECONDARY_ROUTING_URL")
                    .unwrap_or_else(|_| "https://router.project-osrm.org".to_string()),
                timeout_ms: parse_or_default("ROUTING_TIMEOUT_MS", 4_000)?,
                geocode_region: parse_or_default(
                    "GEOCODE_REGION",
                    BoundingBox {
                        min_lat: -4.7,
                        min_lng: 33.9,
                        max_lat: 5.0,
                        max_lng: 41.9,
                    },
                )?,
            },
            gateway: GatewayConfig {
                url: optional("GATEWAY_URL"),
                api_key: optional("GATEWAY_API_KEY"),
                callback_url: env::var("GATEWAY_CALLBACK_URL")
                    .unwrap_or_else(|_| "http://localhost:3000/payments/callback".to_string()),
                timeout_ms: parse_or_default("GATEWAY_TIMEOUT_MS", 10_000)?,
            },
        })
    }
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
