use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Extension, Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use be_billing_db::DatabaseManager;
use tower::ServiceBuilder;
use tower_governor::{
    GovernorLayer, governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor,
};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::debug;

pub mod analytics;
pub mod auth;
pub mod callback;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod service;
pub mod store;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod types;

use gateway::PaymentGateway;
use service::AppState;
use store::BillingStore;

pub fn create_router<S: BillingStore, G: PaymentGateway>(state: Arc<AppState<S, G>>) -> Router {
    // FRONTEND_URL is validated during BillingConfig::from_env(), so this
    // parse cannot fail at runtime.
    let origin = state
        .config
        .frontend_url
        .parse()
        .expect("FRONTEND_URL was validated during config loading");

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::exact(origin))
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true);

    let order_governor = GovernorConfigBuilder::default()
        .per_second(6)
        .burst_size(10)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("valid governor config");

    let jwt_config = state.jwt_config.clone();

    let order_route = Router::new()
        .route("/payment/orders", post(handlers::create_order::<S, G>))
        .layer(GovernorLayer::new(Arc::new(order_governor)));

    let authed_routes = Router::new().route(
        "/payment/entitlements",
        get(handlers::get_entitlements::<S, G>),
    );

    // Reached by a top-level browser redirect from the gateway; no bearer token.
    let callback_routes = Router::new()
        .route("/payment/callback", get(callback::payment_callback::<S, G>))
        .route(
            "/payment/callback/{*token}",
            get(callback::payment_callback_with_token::<S, G>),
        );

    order_route
        .merge(authed_routes)
        .merge(callback_routes)
        .layer(Extension(jwt_config))
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

pub fn init_billing_service(db: Arc<DatabaseManager>) -> Result<Router> {
    debug!("Initializing billing service");

    let state = Arc::new(AppState::from_env(db).context("Failed to create billing service state")?);

    Ok(create_router(state))
}

pub use config::{BillingConfig, UncorrelatedPolicy};
pub use engine::{CreatedOrder, ReconciliationEngine, Resolution};
pub use error::{BillingError, ReconcileError};
pub use gateway::{GatewayError, HttpGateway};
pub use types::{CreateOrderRequest, CreateOrderResponse, EntitlementsResponse};

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use be_auth_core::{Claims, JwtConfig};
    use chrono::Utc;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;

    use super::*;
    use crate::handlers::ORDER_COOKIE;
    use crate::testkit::{
        InMemoryStore, ScriptedGateway, TEST_FRONTEND_URL, ValidationScript, test_config,
        test_state,
    };

    const SECRET: &[u8] = b"router-test-secret";

    fn bearer(sub: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + 600,
            iat: now,
            token_type: "access".to_string(),
        };
        let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
        format!("Bearer {token}")
    }

    fn router() -> (Router, Arc<InMemoryStore>, Arc<ScriptedGateway>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let state = test_state(
            store.clone(),
            gateway.clone(),
            test_config(),
            JwtConfig::from_hmac_secret(SECRET),
        );
        (create_router(Arc::new(state)), store, gateway)
    }

    fn order_request(auth: Option<String>, product: &str) -> Request<Body> {
        let mut builder = Request::post("/payment/orders")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "203.0.113.7");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder
            .body(Body::from(format!(r#"{{"product":"{product}"}}"#)))
            .unwrap()
    }

    fn location(response: &axum::response::Response) -> &str {
        response
            .headers()
            .get(header::LOCATION)
            .unwrap()
            .to_str()
            .unwrap()
    }

    fn set_cookies(response: &axum::response::Response) -> Vec<String> {
        response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn create_order_requires_bearer_token() {
        let (app, store, _) = router();

        let response = app.oneshot(order_request(None, "tier_a")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.payment_records().is_empty());
    }

    #[tokio::test]
    async fn create_order_sets_correlation_cookie() {
        let (app, store, _) = router();

        let response = app
            .oneshot(order_request(Some(bearer("profile-1")), "tier_b"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let cookies = set_cookies(&response);
        let cookie = cookies
            .iter()
            .find(|c| c.starts_with(ORDER_COOKIE))
            .unwrap();
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Path=/payment"));
        assert!(cookie.contains("Max-Age=1800"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: CreateOrderResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(created.redirect_url, "https://gateway.test/pay/tok-1");

        let order_id = created.order_id.parse().unwrap();
        let order = store.pending_order(order_id).unwrap();
        assert_eq!(order.subject_id, "profile-1");
        assert_eq!(order.amount, 9000);
        assert!(cookie.contains(&created.order_id));
    }

    #[tokio::test]
    async fn create_order_rejects_unknown_product() {
        let (app, _, gateway) = router();

        let response = app
            .oneshot(order_request(Some(bearer("profile-1")), "lifetime"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gateway.minted_amounts().is_empty());
    }

    #[tokio::test]
    async fn create_order_reports_gateway_outage() {
        let (app, _, gateway) = router();
        gateway.set_mint_unavailable(true);

        let response = app
            .oneshot(order_request(Some(bearer("profile-1")), "tier_a"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn callback_with_cookie_settles_and_clears_cookie() {
        let (app, store, gateway) = router();
        let created = store
            .insert_order("profile-1", be_billing_db::Product::TierA, 5000)
            .await
            .unwrap();
        store.attach_token(created.order_id, "tok-a").await.unwrap();
        gateway.on_validate("tok-a", ValidationScript::Paid { amount: 5000 });

        let response = app
            .oneshot(
                Request::get("/payment/callback?token=tok-a")
                    .header(header::COOKIE, format!("{ORDER_COOKIE}={}", created.order_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            location(&response),
            format!("{TEST_FRONTEND_URL}/payment/success")
        );
        let cookies = set_cookies(&response);
        assert!(
            cookies
                .iter()
                .any(|c| c.starts_with(&format!("{ORDER_COOKIE}=")) && c.contains("Max-Age=0"))
        );
        assert!(store.pending_order(created.order_id).is_none());
        assert_eq!(store.payment_records().len(), 1);
    }

    #[tokio::test]
    async fn callback_token_in_path_is_accepted() {
        let (app, store, gateway) = router();
        let created = store
            .insert_order("profile-2", be_billing_db::Product::OneTimeBoost, 1500)
            .await
            .unwrap();
        store.attach_token(created.order_id, "tok-path").await.unwrap();
        gateway.on_validate("tok-path", ValidationScript::Paid { amount: 1500 });

        let response = app
            .oneshot(
                Request::get("/payment/callback/tok-path")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            location(&response),
            format!("{TEST_FRONTEND_URL}/payment/success")
        );
        assert_eq!(store.boosts_of("profile-2").len(), 1);
    }

    #[tokio::test]
    async fn declined_callback_redirects_to_failure_and_keeps_cookie() {
        let (app, store, gateway) = router();
        let created = store
            .insert_order("profile-1", be_billing_db::Product::TierA, 5000)
            .await
            .unwrap();
        store.attach_token(created.order_id, "tok-d").await.unwrap();
        gateway.on_validate(
            "tok-d",
            ValidationScript::Declined {
                status_marker: "declined".to_string(),
            },
        );

        let response = app
            .oneshot(
                Request::get("/payment/callback")
                    .header(header::COOKIE, format!("{ORDER_COOKIE}={}", created.order_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            location(&response),
            format!("{TEST_FRONTEND_URL}/payment/failed")
        );
        assert!(set_cookies(&response).is_empty());
        assert!(store.pending_order(created.order_id).is_some());
    }

    #[tokio::test]
    async fn entitlements_reflect_settled_purchase() {
        let (app, store, gateway) = router();
        let created = store
            .insert_order("profile-3", be_billing_db::Product::TierB, 9000)
            .await
            .unwrap();
        store.attach_token(created.order_id, "tok-e").await.unwrap();
        gateway.on_validate("tok-e", ValidationScript::Paid { amount: 9000 });

        app.clone()
            .oneshot(
                Request::get("/payment/callback?token=tok-e")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::get("/payment/entitlements")
                    .header(header::AUTHORIZATION, bearer("profile-3"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let entitlements: EntitlementsResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(entitlements.tier, be_billing_db::SubscriptionTier::TierB);
        assert!(entitlements.expires_at.unwrap() > Utc::now());
        assert!(entitlements.boosts.is_empty());
    }
}
