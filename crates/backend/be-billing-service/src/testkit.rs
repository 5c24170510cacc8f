//! In-memory implementations of the store and gateway seams, for tests and
//! for exercising the HTTP surface without Postgres or a live gateway.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use be_auth_core::JwtConfig;
use be_billing_db::{
    Boost, DbError, DbResult, EntitlementGrant, NewPaymentRecord, Order, OrderStatus,
    PaymentRecord, Product, SettleOutcome, Subscription, next_subscription_expiry,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use url::Url;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::{BillingConfig, GatewayConfig, UncorrelatedPolicy};
use crate::engine::{EngineSettings, ReconciliationEngine};
use crate::gateway::{
    GatewayError, PaymentGateway, PaymentStatus, SUCCESSFUL_PAYMENT, TokenValidation,
    encode_token_segment,
};
use crate::service::AppState;
use crate::store::BillingStore;

#[derive(Default)]
struct Tables {
    orders: HashMap<Uuid, Order>,
    subscriptions: HashMap<String, Subscription>,
    boosts: Vec<Boost>,
    records: Vec<PaymentRecord>,
}

/// A single mutex over all tables makes `settle` atomic.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an order as-is, e.g. with a back-dated `created_at`.
    pub fn put_order(&self, order: Order) {
        self.tables.lock().orders.insert(order.order_id, order);
    }

    pub fn order(&self, order_id: Uuid) -> Option<Order> {
        self.tables.lock().orders.get(&order_id).cloned()
    }

    pub fn pending_order(&self, order_id: Uuid) -> Option<Order> {
        self.order(order_id).filter(Order::is_pending)
    }

    pub fn payment_records(&self) -> Vec<PaymentRecord> {
        self.tables.lock().records.clone()
    }

    pub fn subscription_of(&self, subject_id: &str) -> Option<Subscription> {
        self.tables.lock().subscriptions.get(subject_id).cloned()
    }

    pub fn boosts_of(&self, subject_id: &str) -> Vec<Boost> {
        self.tables
            .lock()
            .boosts
            .iter()
            .filter(|b| b.subject_id == subject_id)
            .cloned()
            .collect()
    }
}

impl BillingStore for InMemoryStore {
    async fn insert_order(&self, subject_id: &str, product: Product, amount: i64) -> DbResult<Order> {
        let now = Utc::now();
        let order = Order {
            order_id: Uuid::now_v7(),
            subject_id: subject_id.to_string(),
            product,
            amount,
            gateway_token: None,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.put_order(order.clone());
        Ok(order)
    }

    async fn attach_token(&self, order_id: Uuid, token: &str) -> DbResult<Order> {
        let mut tables = self.tables.lock();
        let order = tables
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| DbError::not_found_with_id("order", order_id.to_string()))?;

        if order.gateway_token.is_some() {
            return Err(DbError::conflict("order", "gateway token already attached"));
        }

        order.gateway_token = Some(token.to_string());
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn load_order(&self, order_id: Uuid) -> DbResult<Option<Order>> {
        Ok(self.order(order_id))
    }

    async fn recent_pending_orders(&self, since: DateTime<Utc>) -> DbResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .tables
            .lock()
            .orders
            .values()
            .filter(|o| o.is_pending() && o.created_at >= since)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn payment_record_for_token(&self, token: &str) -> DbResult<Option<PaymentRecord>> {
        Ok(self
            .tables
            .lock()
            .records
            .iter()
            .find(|r| r.gateway_token == token)
            .cloned())
    }

    async fn settle(
        &self,
        order_id: Uuid,
        grant: EntitlementGrant,
        record: NewPaymentRecord,
        now: DateTime<Utc>,
    ) -> DbResult<SettleOutcome> {
        let mut tables = self.tables.lock();

        let pending = tables
            .orders
            .get(&order_id)
            .is_some_and(Order::is_pending);
        let token_recorded = tables
            .records
            .iter()
            .any(|r| r.gateway_token == record.gateway_token || r.order_id == order_id);

        if !pending || token_recorded {
            return Ok(SettleOutcome::AlreadySettled);
        }

        match grant {
            EntitlementGrant::Subscription { tier, duration } => {
                let expires_at = next_subscription_expiry(
                    tables.subscriptions.get(&record.subject_id),
                    tier,
                    duration,
                    now,
                );
                tables.subscriptions.insert(
                    record.subject_id.clone(),
                    Subscription {
                        subject_id: record.subject_id.clone(),
                        tier,
                        expires_at,
                        updated_at: now,
                    },
                );
            }
            EntitlementGrant::Boost { duration } => tables.boosts.push(Boost {
                id: Uuid::now_v7(),
                subject_id: record.subject_id.clone(),
                expires_at: now + duration,
                created_at: now,
            }),
        }

        let inserted = PaymentRecord {
            id: Uuid::now_v7(),
            order_id: record.order_id,
            subject_id: record.subject_id,
            product: record.product,
            amount: record.amount,
            gateway_token: record.gateway_token,
            gateway_response: record.gateway_response,
            created_at: now,
        };
        tables.records.push(inserted.clone());

        if let Some(order) = tables.orders.get_mut(&order_id) {
            order.status = OrderStatus::Resolved;
            order.updated_at = now;
        }

        Ok(SettleOutcome::Settled(inserted))
    }

    async fn abandon_stale(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let mut tables = self.tables.lock();
        let mut abandoned = 0;
        for order in tables.orders.values_mut() {
            if order.is_pending() && order.created_at < cutoff {
                order.status = OrderStatus::Abandoned;
                abandoned += 1;
            }
        }
        Ok(abandoned)
    }

    async fn subscription(&self, subject_id: &str) -> DbResult<Option<Subscription>> {
        Ok(self.subscription_of(subject_id))
    }

    async fn active_boosts(&self, subject_id: &str, now: DateTime<Utc>) -> DbResult<Vec<Boost>> {
        let mut boosts: Vec<Boost> = self
            .boosts_of(subject_id)
            .into_iter()
            .filter(|b| b.expires_at > now)
            .collect();
        boosts.sort_by_key(|b| b.expires_at);
        Ok(boosts)
    }
}

/// How the scripted gateway answers `validate` for a token.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationScript {
    /// Successful payment of `amount`. Consumed on first validation, after
    /// which the token reports `NotFound` like the real gateway.
    Paid { amount: i64 },
    /// Gateway answers with a non-success status marker.
    Declined { status_marker: String },
    /// Success marker but the authorization key does not match.
    Unauthorized { amount: i64 },
    NotFound,
    Unavailable,
}

#[derive(Default)]
struct Script {
    tokens: VecDeque<String>,
    minted: Vec<i64>,
    mint_unavailable: bool,
    validations: HashMap<String, ValidationScript>,
    validated: Vec<String>,
}

#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<Script>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next token returned by `mint_token`. Without one, tokens are generated.
    pub fn push_token(&self, token: impl Into<String>) {
        self.script.lock().tokens.push_back(token.into());
    }

    pub fn set_mint_unavailable(&self, unavailable: bool) {
        self.script.lock().mint_unavailable = unavailable;
    }

    pub fn on_validate(&self, token: impl Into<String>, answer: ValidationScript) {
        self.script.lock().validations.insert(token.into(), answer);
    }

    pub fn minted_amounts(&self) -> Vec<i64> {
        self.script.lock().minted.clone()
    }

    pub fn validated_tokens(&self) -> Vec<String> {
        self.script.lock().validated.clone()
    }
}

fn status(authorized: bool, status_marker: &str, paid_amount: i64) -> PaymentStatus {
    PaymentStatus {
        authorized,
        status_marker: status_marker.to_string(),
        paid_amount,
        raw: serde_json::json!({ "status": status_marker, "amount": paid_amount }),
    }
}

impl PaymentGateway for ScriptedGateway {
    async fn mint_token(&self, amount: i64) -> Result<String, GatewayError> {
        let mut script = self.script.lock();
        if script.mint_unavailable {
            return Err(GatewayError::Api {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        script.minted.push(amount);
        let generated = format!("tok-{}", script.minted.len());
        Ok(script.tokens.pop_front().unwrap_or(generated))
    }

    async fn validate(&self, token: &str) -> Result<TokenValidation, GatewayError> {
        let mut script = self.script.lock();
        script.validated.push(token.to_string());

        let answer = script
            .validations
            .get(token)
            .cloned()
            .unwrap_or(ValidationScript::NotFound);

        match answer {
            ValidationScript::Paid { amount } => {
                script
                    .validations
                    .insert(token.to_string(), ValidationScript::NotFound);
                Ok(TokenValidation::Found(status(true, SUCCESSFUL_PAYMENT, amount)))
            }
            ValidationScript::Declined { status_marker } => {
                Ok(TokenValidation::Found(status(true, &status_marker, 0)))
            }
            ValidationScript::Unauthorized { amount } => {
                Ok(TokenValidation::Found(status(false, SUCCESSFUL_PAYMENT, amount)))
            }
            ValidationScript::NotFound => Ok(TokenValidation::NotFound),
            ValidationScript::Unavailable => Err(GatewayError::Timeout),
        }
    }

    fn checkout_url(&self, token: &str) -> String {
        format!("https://gateway.test/pay/{}", encode_token_segment(token))
    }
}

pub const TEST_FRONTEND_URL: &str = "https://app.test";

/// Configuration with fixed URLs and the default windows.
pub fn test_config() -> BillingConfig {
    BillingConfig {
        gateway: GatewayConfig {
            base_url: Url::parse("https://gateway.test").expect("static url"),
            api_key: "test-api-key".to_string(),
            expected_auth_key: "test-auth-key".to_string(),
            timeout: std::time::Duration::from_secs(1),
        },
        frontend_url: TEST_FRONTEND_URL.to_string(),
        public_url: "https://billing.test".to_string(),
        cookie_secure: true,
        cookie_ttl: chrono::Duration::minutes(30),
        recency_window: chrono::Duration::hours(1),
        stale_order_age: chrono::Duration::hours(24),
        uncorrelated_policy: UncorrelatedPolicy::Lenient,
    }
}

/// Wires an [`AppState`] around the in-memory doubles.
pub fn test_state(
    store: Arc<InMemoryStore>,
    gateway: Arc<ScriptedGateway>,
    config: BillingConfig,
    jwt_config: JwtConfig,
) -> AppState<InMemoryStore, ScriptedGateway> {
    let engine = ReconciliationEngine::new(
        store,
        gateway,
        Catalog::default(),
        EngineSettings::from(&config),
    );
    AppState {
        engine,
        config,
        jwt_config: Arc::new(jwt_config),
    }
}
