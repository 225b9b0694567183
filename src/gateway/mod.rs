//! Mobile-money push-payment gateway.
//!
//! Initiation is a single time-boxed HTTP call that asks the payer's phone to
//! approve the charge. The outcome arrives later on our callback endpoint as a
//! [`GatewayCallback`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::error::AppError;

#[derive(Debug, Clone, Serialize)]
pub struct PushRequest {
    pub reference: Uuid,
    pub phone: String,
    pub amount: Decimal,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReceipt {
    pub checkout_request_id: String,
    pub merchant_request_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("payment gateway is not configured")]
    NotConfigured,

    #[error("payment gateway timed out")]
    Timeout,

    #[error("payment gateway rejected the request: {0}")]
    Rejected(String),

    #[error("payment gateway unreachable: {0}")]
    Transport(String),

    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

/// Asynchronous confirmation posted back by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub checkout_request_id: String,
    pub result_code: i64,
    #[serde(default)]
    pub result_desc: String,
    pub receipt_number: Option<String>,
}

impl GatewayCallback {
    pub fn is_success(&self) -> bool {
        self.result_code == 0
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushReceipt, GatewayError>;
}

pub fn from_config(config: &GatewayConfig) -> Result<Arc<dyn PaymentGateway>, AppError> {
    match (&config.url, &config.api_key) {
        (Some(url), Some(api_key)) => {
            let gateway = HttpGateway::new(
                url,
                api_key,
                &config.callback_url,
                Duration::from_millis(config.timeout_ms),
            )
            .map_err(|err| AppError::Internal(format!("failed to build gateway client: {err}")))?;
            Ok(Arc::new(gateway))
        }
        _ => {
            warn!("payment gateway credentials missing; mobile-money payments disabled");
            Ok(Arc::new(DisabledGateway))
        }
    }
}

pub struct DisabledGateway;

#[async_trait]
impl PaymentGateway for DisabledGateway {
    async fn push(&self, _request: &PushRequest) -> Result<PushReceipt, GatewayError> {
        Err(GatewayError::NotConfigured)
    }
}

pub struct HttpGateway {
    http: Client,
    base_url: String,
    api_key: String,
    callback_url: String,
}

#[derive(Serialize)]
struct PushBody<'a> {
    reference: Uuid,
    phone: &'a str,
    amount: Decimal,
    description: &'a str,
    callback_url: &'a str,
}

#[derive(Deserialize)]
struct PushResponse {
    response_code: String,
    #[serde(default)]
    response_description: String,
    checkout_request_id: Option<String>,
    merchant_request_id: Option<String>,
}

impl HttpGateway {
    pub fn new(
        base_url: &str,
        api_key: &str,
        callback_url: &str,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            callback_url: callback_url.to_string(),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn push(&self, request: &PushRequest) -> Result<PushReceipt, GatewayError> {
        let response = self
            .http
            .post(format!("{}/stkpush", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&PushBody {
                reference: request.reference,
                phone: &request.phone,
                amount: request.amount,
                description: &request.description,
                callback_url: &self.callback_url,
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    GatewayError::Timeout
                } else {
                    GatewayError::Transport(err.to_string())
                }
            })?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::Rejected(body));
            }
            status => {
                return Err(GatewayError::Transport(format!("gateway returned {status}")));
            }
        }

        let body = response
            .json::<PushResponse>()
            .await
            .map_err(|err| GatewayError::Malformed(err.to_string()))?;

        if body.response_code != "0" {
            return Err(GatewayError::Rejected(body.response_description));
        }

        let checkout_request_id = body
            .checkout_request_id
            .ok_or_else(|| GatewayError::Malformed("missing checkout_request_id".to_string()))?;

        Ok(PushReceipt {
            checkout_request_id,
            merchant_request_id: body.merchant_request_id,
        })
    }
}
