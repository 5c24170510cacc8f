//! Client for the banking gateway's token API.
//!
//! The gateway is the source of truth for whether a payment happened. Every
//! transport or protocol failure is turned into a [`GatewayError`] here so the
//! engine never sees a raw `reqwest` error.

use std::future::Future;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::GatewayConfig;

/// Status marker the gateway reports for a completed payment.
pub const SUCCESSFUL_PAYMENT: &str = "successful_payment";

/// Characters left untouched when a token is placed in a URL path segment.
const TOKEN_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway api error status={status} body={body}")]
    Api { status: u16, body: String },

    #[error("invalid gateway response: {0}")]
    InvalidResponse(String),
}

/// Result of asking the gateway about a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValidation {
    Found(PaymentStatus),
    /// The gateway no longer knows the token: consumed or expired.
    NotFound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentStatus {
    /// Whether the authorization key matched the merchant's.
    pub authorized: bool,
    pub status_marker: String,
    pub paid_amount: i64,
    pub raw: serde_json::Value,
}

impl PaymentStatus {
    pub fn is_successful(&self) -> bool {
        self.authorized && self.status_marker == SUCCESSFUL_PAYMENT
    }
}

/// The two remote calls reconciliation depends on.
pub trait PaymentGateway: Send + Sync + 'static {
    /// Mints an opaque payment token for `amount`. The token must be used verbatim.
    fn mint_token(&self, amount: i64)
    -> impl Future<Output = Result<String, GatewayError>> + Send;

    fn validate(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<TokenValidation, GatewayError>> + Send;

    /// URL the browser is sent to in order to pay against `token`.
    fn checkout_url(&self, token: &str) -> String;
}

#[derive(Debug, Serialize)]
struct MintTokenRequest<'a> {
    amount: i64,
    callback_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct MintTokenResponse {
    token: String,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    status: String,
    auth_key: String,
    amount: i64,
}

pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    callback_url: String,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig, callback_url: String) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            config,
            callback_url,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.as_str().trim_end_matches('/'),
            path
        )
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<(StatusCode, String), GatewayError> {
        let resp = self
            .client
            .post(self.endpoint(path))
            .header("X-Api-Key", &self.config.api_key)
            .json(body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        let body = resp.text().await.map_err(classify)?;
        Ok((status, body))
    }
}

fn classify(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::Timeout
    } else {
        GatewayError::Http(err)
    }
}

impl PaymentGateway for HttpGateway {
    async fn mint_token(&self, amount: i64) -> Result<String, GatewayError> {
        let request = MintTokenRequest {
            amount,
            callback_url: &self.callback_url,
        };
        let (status, body) = self.post_json("api/payments/token", &request).await?;

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let parsed = serde_json::from_str::<MintTokenResponse>(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))?;

        if parsed.token.is_empty() {
            return Err(GatewayError::InvalidResponse("empty token".to_string()));
        }

        Ok(parsed.token)
    }

    async fn validate(&self, token: &str) -> Result<TokenValidation, GatewayError> {
        let (status, body) = self
            .post_json("api/payments/validate", &ValidateRequest { token })
            .await?;

        if status == StatusCode::NOT_FOUND {
            debug!("Gateway reports token not found");
            return Ok(TokenValidation::NotFound);
        }

        if !status.is_success() {
            return Err(GatewayError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let raw: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))?;
        let parsed = ValidateResponse::deserialize(&raw)
            .map_err(|e| GatewayError::InvalidResponse(format!("{e}; body={body}")))?;

        Ok(TokenValidation::Found(PaymentStatus {
            authorized: parsed.auth_key == self.config.expected_auth_key,
            status_marker: parsed.status,
            paid_amount: parsed.amount,
            raw,
        }))
    }

    fn checkout_url(&self, token: &str) -> String {
        self.endpoint(&format!("pay/{}", encode_token_segment(token)))
    }
}

/// Percent-encodes only what a path segment requires; tokens made of
/// unreserved characters pass through byte for byte.
pub fn encode_token_segment(token: &str) -> String {
    utf8_percent_encode(token, TOKEN_SEGMENT).to_string()
}
