use std::time::Duration;

use axum::http::HeaderValue;
use url::Url;

use crate::error::BillingError;

/// What to do with a callback that matches no pending order and no prior
/// payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UncorrelatedPolicy {
    /// Send the user to the success page and leave the case to manual audit.
    #[default]
    Lenient,
    /// Only report success when a payment record backs it.
    Strict,
}

impl std::str::FromStr for UncorrelatedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown callback policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: Url,
    pub api_key: String,
    /// Value the gateway must echo in the authorization-key field.
    pub expected_auth_key: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    pub frontend_url: String,
    /// Public base URL of this service, used to build the gateway callback URL.
    pub public_url: String,
    pub cookie_secure: bool,
    pub cookie_ttl: chrono::Duration,
    pub recency_window: chrono::Duration,
    pub stale_order_age: chrono::Duration,
    pub uncorrelated_policy: UncorrelatedPolicy,
}

fn required(name: &str) -> Result<String, BillingError> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| BillingError::Config(format!("{name} environment variable must be set")))
}

fn parse_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, BillingError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{name} has an invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, BillingError> {
        let base_url = required("GATEWAY_BASE_URL")?;
        let base_url = Url::parse(&base_url).map_err(|e| {
            BillingError::Config(format!("GATEWAY_BASE_URL '{base_url}' is not a valid URL: {e}"))
        })?;

        let gateway = GatewayConfig {
            base_url,
            api_key: required("GATEWAY_API_KEY")?,
            expected_auth_key: required("GATEWAY_AUTH_KEY")?,
            timeout: Duration::from_secs(parse_or("GATEWAY_TIMEOUT_SECS", 10u64)?),
        };

        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:5173".to_string());

        HeaderValue::from_str(&frontend_url).map_err(|e| {
            BillingError::Config(format!(
                "FRONTEND_URL '{frontend_url}' is not a valid header value: {e}"
            ))
        })?;

        let public_url = std::env::var("BILLING_PUBLIC_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            gateway,
            frontend_url: frontend_url.trim_end_matches('/').to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
            cookie_secure: parse_or("ORDER_COOKIE_SECURE", true)?,
            cookie_ttl: chrono::Duration::minutes(parse_or("ORDER_COOKIE_TTL_MINUTES", 30i64)?),
            recency_window: chrono::Duration::minutes(parse_or(
                "ORDER_RECENCY_WINDOW_MINUTES",
                60i64,
            )?),
            stale_order_age: chrono::Duration::hours(parse_or("STALE_ORDER_HOURS", 24i64)?),
            uncorrelated_policy: parse_or("UNCORRELATED_CALLBACK_POLICY", UncorrelatedPolicy::Lenient)?,
        })
    }

    pub fn callback_url(&self) -> String {
        format!("{}/payment/callback", self.public_url)
    }

    pub fn success_url(&self) -> String {
        format!("{}/payment/success", self.frontend_url)
    }

    pub fn failure_url(&self) -> String {
        format!("{}/payment/failed", self.frontend_url)
    }
}
