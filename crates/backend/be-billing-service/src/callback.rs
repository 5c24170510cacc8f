//! Inbound gateway redirects.
//!
//! Gateways put the payment token in different places: a trailing path
//! segment, a `token` query parameter, or a provider specific parameter. All
//! shapes end up in [`ReconciliationEngine::resolve_callback`].
//!
//! [`ReconciliationEngine::resolve_callback`]: crate::engine::ReconciliationEngine::resolve_callback

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Redirect;
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics;
use crate::engine::RedirectOutcome;
use crate::gateway::PaymentGateway;
use crate::handlers::{ORDER_COOKIE, clear_order_cookie};
use crate::service::AppState;
use crate::store::BillingStore;

/// One place a token may be found in a callback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    PathSuffix,
    QueryParam(&'static str),
}

/// Tried in order; the first non-empty value wins.
pub const TOKEN_SOURCES: &[TokenSource] = &[
    TokenSource::PathSuffix,
    TokenSource::QueryParam("token"),
    TokenSource::QueryParam("Token"),
    TokenSource::QueryParam("payment_token"),
];

/// The token-bearing parts of a callback request.
#[derive(Debug)]
pub struct InboundCallback<'a> {
    pub path_suffix: Option<&'a str>,
    pub query: &'a HashMap<String, String>,
}

impl TokenSource {
    pub fn extract<'a>(&self, callback: &InboundCallback<'a>) -> Option<&'a str> {
        let value = match self {
            TokenSource::PathSuffix => callback.path_suffix.map(|s| s.trim_matches('/')),
            TokenSource::QueryParam(name) => callback.query.get(*name).map(String::as_str),
        };
        value.filter(|v| !v.is_empty())
    }
}

pub fn extract_token<'a>(callback: &InboundCallback<'a>) -> Option<&'a str> {
    TOKEN_SOURCES.iter().find_map(|source| {
        let token = source.extract(callback)?;
        debug!(?source, "Callback token found");
        Some(token)
    })
}

/// Reads the order id the purchase flow left in the session cookie.
pub fn correlation_hint(jar: &CookieJar) -> Option<Uuid> {
    let raw = jar.get(ORDER_COOKIE)?.value();
    match Uuid::parse_str(raw) {
        Ok(order_id) => Some(order_id),
        Err(_) => {
            debug!("Ignoring malformed order cookie");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// GET /payment/callback
// GET /payment/callback/{*token}
// ---------------------------------------------------------------------------

pub async fn payment_callback<S: BillingStore, G: PaymentGateway>(
    State(state): State<Arc<AppState<S, G>>>,
    jar: CookieJar,
    Query(query): Query<HashMap<String, String>>,
) -> (CookieJar, Redirect) {
    finish_callback(&state, jar, None, &query).await
}

pub async fn payment_callback_with_token<S: BillingStore, G: PaymentGateway>(
    State(state): State<Arc<AppState<S, G>>>,
    jar: CookieJar,
    Path(suffix): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> (CookieJar, Redirect) {
    finish_callback(&state, jar, Some(&suffix), &query).await
}

async fn finish_callback<S: BillingStore, G: PaymentGateway>(
    state: &AppState<S, G>,
    jar: CookieJar,
    path_suffix: Option<&str>,
    query: &HashMap<String, String>,
) -> (CookieJar, Redirect) {
    let hint = correlation_hint(&jar);
    let token = extract_token(&InboundCallback { path_suffix, query });

    let result = state.engine.resolve_callback(hint, token).await;
    let outcome = state.engine.redirect_outcome(&result);

    let kind = match &result {
        Ok(resolution) => {
            info!(?resolution, has_hint = hint.is_some(), "Callback resolved");
            resolution_kind(resolution)
        }
        Err(e) => {
            warn!(error = %e, kind = e.kind(), has_hint = hint.is_some(), "Callback failed");
            e.kind()
        }
    };
    analytics::track_callback_resolved(kind, outcome == RedirectOutcome::Succeeded);

    match outcome {
        RedirectOutcome::Succeeded => (
            clear_order_cookie(jar),
            Redirect::to(&state.config.success_url()),
        ),
        RedirectOutcome::Failed => (jar, Redirect::to(&state.config.failure_url())),
    }
}

fn resolution_kind(resolution: &crate::engine::Resolution) -> &'static str {
    use crate::engine::Resolution;
    match resolution {
        Resolution::Settled { .. } => "settled",
        Resolution::AlreadySettled { .. } => "already_settled",
        Resolution::Uncorrelated => "uncorrelated",
    }
}
