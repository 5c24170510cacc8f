use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::analytics;
use crate::auth::AuthUser;
use crate::error::BillingError;
use crate::gateway::PaymentGateway;
use crate::service::AppState;
use crate::store::BillingStore;
use crate::types::{CreateOrderRequest, CreateOrderResponse, EntitlementsResponse};

/// Session cookie carrying the order id from order creation to the callback.
pub const ORDER_COOKIE: &str = "billing_order";

const ORDER_COOKIE_PATH: &str = "/payment";

fn order_cookie(order_id: Uuid, ttl: chrono::Duration, secure: bool) -> Cookie<'static> {
    // Lax, not Strict: the callback is a cross-site top-level redirect from the gateway.
    Cookie::build((ORDER_COOKIE, order_id.to_string()))
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Lax)
        .path(ORDER_COOKIE_PATH)
        .max_age(cookie::time::Duration::seconds(ttl.num_seconds()))
        .build()
}

pub fn clear_order_cookie(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build(ORDER_COOKIE).path(ORDER_COOKIE_PATH))
}

// ---------------------------------------------------------------------------
// POST /payment/orders
// ---------------------------------------------------------------------------

/// Starts a purchase: records the order, mints a gateway token and hands the
/// browser the gateway URL plus the correlation cookie.
pub async fn create_order<S: BillingStore, G: PaymentGateway>(
    State(state): State<Arc<AppState<S, G>>>,
    AuthUser(claims): AuthUser,
    jar: CookieJar,
    Json(body): Json<CreateOrderRequest>,
) -> Result<(CookieJar, Json<CreateOrderResponse>), BillingError> {
    let created = match state.engine.create_order(&claims.sub, &body.product).await {
        Ok(created) => created,
        Err(e) => {
            analytics::track_order_creation_failed(&body.product, e.kind());
            return Err(e.into());
        }
    };
    analytics::track_order_created(&body.product);

    let cookie = order_cookie(
        created.order_id,
        state.config.cookie_ttl,
        state.config.cookie_secure,
    );

    Ok((
        jar.add(cookie),
        Json(CreateOrderResponse {
            order_id: created.order_id.to_string(),
            redirect_url: created.redirect_url,
        }),
    ))
}

// ---------------------------------------------------------------------------
// GET /payment/entitlements
// ---------------------------------------------------------------------------

/// Current subscription and active boosts of the calling profile.
pub async fn get_entitlements<S: BillingStore, G: PaymentGateway>(
    State(state): State<Arc<AppState<S, G>>>,
    AuthUser(claims): AuthUser,
) -> Result<Json<EntitlementsResponse>, BillingError> {
    let now = Utc::now();
    let store = state.engine.store();

    let subscription = store
        .subscription(&claims.sub)
        .await?
        .filter(|s| s.is_active(now));
    let boosts = store.active_boosts(&claims.sub, now).await?;

    debug!(
        subject_id = %claims.sub,
        has_subscription = subscription.is_some(),
        boosts = boosts.len(),
        "Entitlements read"
    );

    Ok(Json(EntitlementsResponse::new(subscription, boosts)))
}
