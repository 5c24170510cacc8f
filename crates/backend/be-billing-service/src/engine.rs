//! Reconciliation engine.
//!
//! Ties a browser redirect back from the gateway to the order that started it,
//! checks the payment with the gateway and activates the purchased entitlement
//! exactly once. The engine keeps no state between requests: everything it
//! knows comes from the correlation hint, the inbound token and the store.

use std::sync::Arc;

use be_billing_db::{NewPaymentRecord, Order, OrderStatus, Product, SettleOutcome};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::{BillingConfig, UncorrelatedPolicy};
use crate::error::ReconcileError;
use crate::gateway::{PaymentGateway, TokenValidation};
use crate::store::BillingStore;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// How far back the hint-less fallback looks for a pending order.
    pub recency_window: Duration,
    /// Pending orders older than this are marked abandoned.
    pub stale_order_age: Duration,
    pub uncorrelated_policy: UncorrelatedPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            recency_window: Duration::hours(1),
            stale_order_age: Duration::hours(24),
            uncorrelated_policy: UncorrelatedPolicy::Lenient,
        }
    }
}

impl From<&BillingConfig> for EngineSettings {
    fn from(config: &BillingConfig) -> Self {
        Self {
            recency_window: config.recency_window,
            stale_order_age: config.stale_order_age,
            uncorrelated_policy: config.uncorrelated_policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_id: Uuid,
    pub redirect_url: String,
}

/// Outcome of a callback that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// This call validated the payment and activated the entitlement.
    Settled {
        order_id: Uuid,
        subject_id: String,
        product: Product,
    },
    /// The payment had already been reconciled; nothing was changed.
    AlreadySettled { order_id: Uuid },
    /// No order and no payment record could be matched to the callback.
    Uncorrelated,
}

/// The only two states a browser is ever redirected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOutcome {
    Succeeded,
    Failed,
}

enum Correlation {
    Pending(Order),
    /// Already reconciled, either by order status or by a recorded token.
    Resolved { order_id: Uuid },
    Unmatched,
}

/// Where the validated payment evidence came from.
enum Evidence {
    Gateway { paid_amount: i64, raw: serde_json::Value },
    TrustedRedirect,
}

pub struct ReconciliationEngine<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    catalog: Catalog,
    settings: EngineSettings,
}

impl<S: BillingStore, G: PaymentGateway> ReconciliationEngine<S, G> {
    pub fn new(store: Arc<S>, gateway: Arc<G>, catalog: Catalog, settings: EngineSettings) -> Self {
        Self {
            store,
            gateway,
            catalog,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Records a purchase intent and obtains a gateway token for it.
    ///
    /// If the gateway fails the order row stays behind unmatched; it is never
    /// settled without a token and is reaped once stale.
    pub async fn create_order(
        &self,
        subject_id: &str,
        product: &str,
    ) -> Result<CreatedOrder, ReconcileError> {
        let product: Product = product
            .parse()
            .map_err(|_| ReconcileError::InvalidProduct(product.to_string()))?;

        if let Err(e) = self.reap_stale_orders().await {
            warn!(error = %e, "Failed to reap stale orders");
        }

        let amount = self.catalog.amount(product);
        let order = self.store.insert_order(subject_id, product, amount).await?;
        let order_id = order.order_id;

        let token = match self.gateway.mint_token(amount).await {
            Ok(token) => token,
            Err(e) => {
                warn!(%order_id, %product, error = %e, "Gateway failed to mint token");
                return Err(ReconcileError::GatewayUnavailable(e));
            }
        };

        self.store.attach_token(order_id, &token).await?;

        info!(
            %order_id,
            subject_id,
            %product,
            amount,
            token = token_prefix(&token),
            "Order created"
        );

        Ok(CreatedOrder {
            order_id,
            redirect_url: self.gateway.checkout_url(&token),
        })
    }

    /// Reconciles a gateway redirect with the order it belongs to.
    ///
    /// Safe to call repeatedly for the same payment: once an order is
    /// resolved, later calls find it resolved (or find its payment record)
    /// and change nothing.
    pub async fn resolve_callback(
        &self,
        hint: Option<Uuid>,
        inbound_token: Option<&str>,
    ) -> Result<Resolution, ReconcileError> {
        let now = Utc::now();

        let order = match self.correlate(hint, inbound_token, now).await? {
            Correlation::Pending(order) => order,
            Correlation::Resolved { order_id } => {
                info!(%order_id, "Duplicate callback for resolved order");
                return Ok(Resolution::AlreadySettled { order_id });
            }
            Correlation::Unmatched => return self.resolve_unmatched(inbound_token).await,
        };
        let order_id = order.order_id;

        // The stored token is the one that was actually paid against.
        let token = match (order.gateway_token.as_deref(), inbound_token) {
            (Some(stored), inbound) => {
                if inbound.is_some_and(|t| t != stored) {
                    debug!(%order_id, "Inbound token differs from stored token, using stored");
                }
                stored.to_string()
            }
            (None, Some(inbound)) => {
                warn!(%order_id, "Order has no stored token, validating inbound token");
                inbound.to_string()
            }
            (None, None) => return Err(ReconcileError::MissingToken { order_id }),
        };

        let evidence = match self.gateway.validate(&token).await? {
            TokenValidation::Found(status) if status.is_successful() => Evidence::Gateway {
                paid_amount: status.paid_amount,
                raw: status.raw,
            },
            TokenValidation::Found(status) => {
                warn!(
                    %order_id,
                    status_marker = %status.status_marker,
                    authorized = status.authorized,
                    audit = true,
                    "Gateway rejected payment"
                );
                return Err(ReconcileError::ValidationRejected {
                    order_id,
                    status_marker: status.status_marker,
                    authorized: status.authorized,
                });
            }
            TokenValidation::NotFound => {
                // Tokens are single-use; a prior validation may have consumed
                // it. The gateway only redirects here after a completed
                // payment, so the redirect itself is the evidence.
                warn!(
                    %order_id,
                    token = token_prefix(&token),
                    audit = true,
                    "Token unknown to gateway, trusting redirect"
                );
                Evidence::TrustedRedirect
            }
        };

        let (paid_amount, gateway_response) = match evidence {
            Evidence::Gateway { paid_amount, raw } => {
                if paid_amount < order.amount {
                    warn!(
                        %order_id,
                        expected = order.amount,
                        paid = paid_amount,
                        audit = true,
                        "Paid amount below order amount"
                    );
                    return Err(ReconcileError::AmountMismatch {
                        order_id,
                        expected: order.amount,
                        paid: paid_amount,
                    });
                }
                (paid_amount, raw)
            }
            Evidence::TrustedRedirect => (
                order.amount,
                json!({ "validation": "not_found", "trusted_redirect": true }),
            ),
        };

        let grant = self.catalog.grant(order.product);
        let record = NewPaymentRecord {
            order_id,
            subject_id: order.subject_id.clone(),
            product: order.product,
            amount: paid_amount,
            gateway_token: token,
            gateway_response,
        };

        match self.store.settle(order_id, grant, record, now).await? {
            SettleOutcome::Settled(record) => {
                info!(
                    %order_id,
                    subject_id = %order.subject_id,
                    product = %order.product,
                    amount = record.amount,
                    "Payment reconciled"
                );
                Ok(Resolution::Settled {
                    order_id,
                    subject_id: order.subject_id,
                    product: order.product,
                })
            }
            SettleOutcome::AlreadySettled => {
                info!(%order_id, "Order settled concurrently, nothing applied");
                Ok(Resolution::AlreadySettled { order_id })
            }
        }
    }

    /// Marks pending orders older than the configured age as abandoned.
    pub async fn reap_stale_orders(&self) -> Result<u64, ReconcileError> {
        let cutoff = Utc::now() - self.settings.stale_order_age;
        let abandoned = self.store.abandon_stale(cutoff).await?;
        if abandoned > 0 {
            info!(abandoned, %cutoff, "Abandoned stale orders");
        }
        Ok(abandoned)
    }

    /// Maps a callback result onto the browser-visible outcome.
    pub fn redirect_outcome(&self, result: &Result<Resolution, ReconcileError>) -> RedirectOutcome {
        match result {
            Ok(Resolution::Settled { .. } | Resolution::AlreadySettled { .. }) => {
                RedirectOutcome::Succeeded
            }
            Ok(Resolution::Uncorrelated) => match self.settings.uncorrelated_policy {
                UncorrelatedPolicy::Lenient => RedirectOutcome::Succeeded,
                UncorrelatedPolicy::Strict => RedirectOutcome::Failed,
            },
            Err(_) => RedirectOutcome::Failed,
        }
    }

    async fn correlate(
        &self,
        hint: Option<Uuid>,
        inbound_token: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Correlation, ReconcileError> {
        // A hint pins the callback to one order; it never falls back to
        // whichever other order happens to be open.
        if let Some(order_id) = hint {
            return match self.store.load_order(order_id).await? {
                Some(order) => match order.status {
                    OrderStatus::Pending => Ok(Correlation::Pending(order)),
                    OrderStatus::Resolved => Ok(Correlation::Resolved { order_id }),
                    OrderStatus::Abandoned => {
                        warn!(%order_id, audit = true, "Callback for abandoned order");
                        Ok(Correlation::Unmatched)
                    }
                },
                None => {
                    warn!(%order_id, audit = true, "Correlation hint names unknown order");
                    Ok(Correlation::Unmatched)
                }
            };
        }

        // Success redirects clear the cookie, so a replayed callback arrives
        // here without a hint.
        if let Some(token) = inbound_token
            && let Some(record) = self.store.payment_record_for_token(token).await?
        {
            debug!(order_id = %record.order_id, "Hint-less callback for recorded token");
            return Ok(Correlation::Resolved {
                order_id: record.order_id,
            });
        }

        let recent = self
            .store
            .recent_pending_orders(now - self.settings.recency_window)
            .await?;

        if let Some(token) = inbound_token {
            let mut matching = recent
                .iter()
                .filter(|o| o.gateway_token.as_deref() == Some(token));
            if let (Some(order), None) = (matching.next(), matching.next()) {
                debug!(order_id = %order.order_id, "Correlated callback by inbound token");
                return Ok(Correlation::Pending(order.clone()));
            }
        }

        match recent.as_slice() {
            [order] => {
                if let (Some(stored), Some(inbound)) = (order.gateway_token.as_deref(), inbound_token)
                    && stored != inbound
                {
                    warn!(
                        order_id = %order.order_id,
                        token = token_prefix(inbound),
                        audit = true,
                        "Inbound token belongs to no recent order, not borrowing the only one"
                    );
                    return Ok(Correlation::Unmatched);
                }
                debug!(order_id = %order.order_id, "Correlated callback to only recent order");
                Ok(Correlation::Pending(order.clone()))
            }
            [] => Ok(Correlation::Unmatched),
            many => {
                // Picking one here could activate the wrong subject.
                warn!(
                    pending = many.len(),
                    audit = true,
                    "Several recent pending orders and no usable hint, not guessing"
                );
                Ok(Correlation::Unmatched)
            }
        }
    }

    async fn resolve_unmatched(
        &self,
        inbound_token: Option<&str>,
    ) -> Result<Resolution, ReconcileError> {
        if let Some(token) = inbound_token
            && let Some(record) = self.store.payment_record_for_token(token).await?
        {
            info!(order_id = %record.order_id, "Late callback for recorded payment");
            return Ok(Resolution::AlreadySettled {
                order_id: record.order_id,
            });
        }

        warn!(
            token = inbound_token.map(token_prefix),
            policy = ?self.settings.uncorrelated_policy,
            audit = true,
            "Callback matches no order or payment record"
        );
        Ok(Resolution::Uncorrelated)
    }
}

/// Enough of a token to find it in gateway logs.
fn token_prefix(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map_or(token.len(), |(idx, _)| idx);
    &token[..end]
}

#[cfg(test)]
mod tests {
    use be_billing_db::SubscriptionTier;

    use super::*;
    use crate::testkit::{InMemoryStore, ScriptedGateway, ValidationScript};

    type Engine = ReconciliationEngine<InMemoryStore, ScriptedGateway>;

    fn engine_with(settings: EngineSettings) -> (Engine, Arc<InMemoryStore>, Arc<ScriptedGateway>) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let engine = ReconciliationEngine::new(
            store.clone(),
            gateway.clone(),
            Catalog::default(),
            settings,
        );
        (engine, store, gateway)
    }

    fn engine() -> (Engine, Arc<InMemoryStore>, Arc<ScriptedGateway>) {
        engine_with(EngineSettings::default())
    }

    fn back_dated(order: Order, age: Duration) -> Order {
        Order {
            created_at: order.created_at - age,
            ..order
        }
    }

    #[tokio::test]
    async fn create_order_prices_from_catalog() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok123");

        let created = engine.create_order("s1", "tier_a").await.unwrap();

        assert_eq!(gateway.minted_amounts(), vec![5000]);
        assert_eq!(created.redirect_url, "https://gateway.test/pay/tok123");
        let order = store.order(created.order_id).unwrap();
        assert_eq!(order.amount, 5000);
        assert_eq!(order.gateway_token.as_deref(), Some("tok123"));
        assert!(order.is_pending());
    }

    #[tokio::test]
    async fn create_order_rejects_unknown_product() {
        let (engine, _, gateway) = engine();
        let err = engine.create_order("s1", "tier_z").await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidProduct(p) if p == "tier_z"));
        assert!(gateway.minted_amounts().is_empty());
    }

    #[tokio::test]
    async fn gateway_outage_leaves_order_without_token() {
        let (engine, store, gateway) = engine();
        gateway.set_mint_unavailable(true);

        let err = engine.create_order("s1", "tier_b").await.unwrap_err();
        assert!(matches!(err, ReconcileError::GatewayUnavailable(_)));

        let orphans = store.recent_pending_orders(Utc::now() - Duration::hours(1)).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].gateway_token.is_none());
    }

    #[tokio::test]
    async fn validates_stored_token_not_inbound_one() {
        let (engine, store, gateway) = engine();
        gateway.push_token("stored-token");
        gateway.on_validate("stored-token", ValidationScript::Paid { amount: 5000 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        let resolution = engine
            .resolve_callback(Some(created.order_id), Some("forged-token"))
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::Settled { .. }));
        assert_eq!(gateway.validated_tokens(), vec!["stored-token".to_string()]);
        assert_eq!(store.payment_records()[0].gateway_token, "stored-token");
    }

    #[tokio::test]
    async fn order_without_stored_token_falls_back_to_inbound() {
        let (engine, store, gateway) = engine();
        let order = store.insert_order("s1", Product::TierA, 5000).await.unwrap();
        gateway.on_validate("inbound", ValidationScript::Paid { amount: 5000 });

        let resolution = engine
            .resolve_callback(Some(order.order_id), Some("inbound"))
            .await
            .unwrap();

        assert!(matches!(resolution, Resolution::Settled { .. }));
        assert_eq!(gateway.validated_tokens(), vec!["inbound".to_string()]);
    }

    #[tokio::test]
    async fn order_without_any_token_is_rejected() {
        let (engine, store, _) = engine();
        let order = store.insert_order("s1", Product::TierA, 5000).await.unwrap();

        let err = engine
            .resolve_callback(Some(order.order_id), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::MissingToken { .. }));
        assert!(store.pending_order(order.order_id).is_some());
    }

    #[tokio::test]
    async fn declined_payment_keeps_order_for_review() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate(
            "tok",
            ValidationScript::Declined {
                status_marker: "failed_payment".into(),
            },
        );
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        let result = engine.resolve_callback(Some(created.order_id), None).await;

        assert!(matches!(result, Err(ReconcileError::ValidationRejected { .. })));
        assert_eq!(engine.redirect_outcome(&result), RedirectOutcome::Failed);
        assert!(store.pending_order(created.order_id).is_some());
        assert!(store.subscription_of("s1").is_none());
    }

    #[tokio::test]
    async fn authorization_key_mismatch_is_rejected() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Unauthorized { amount: 5000 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        let err = engine
            .resolve_callback(Some(created.order_id), None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReconcileError::ValidationRejected { authorized: false, .. }
        ));
        assert!(store.payment_records().is_empty());
    }

    #[tokio::test]
    async fn validation_outage_is_transient_and_keeps_order() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Unavailable);
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        let err = engine
            .resolve_callback(Some(created.order_id), None)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert!(store.pending_order(created.order_id).is_some());
    }

    #[tokio::test]
    async fn overpayment_is_accepted() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Paid { amount: 5200 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        engine
            .resolve_callback(Some(created.order_id), None)
            .await
            .unwrap();

        assert_eq!(store.payment_records()[0].amount, 5200);
    }

    #[tokio::test]
    async fn underpayment_is_rejected_for_every_product() {
        for product in Product::ALL {
            let (engine, store, gateway) = engine();
            gateway.push_token("tok");
            let expected = engine.catalog().amount(product);
            gateway.on_validate(
                "tok",
                ValidationScript::Paid {
                    amount: expected - 1,
                },
            );
            let created = engine.create_order("s1", product.as_str()).await.unwrap();

            let err = engine
                .resolve_callback(Some(created.order_id), None)
                .await
                .unwrap_err();

            assert!(matches!(err, ReconcileError::AmountMismatch { paid, .. } if paid == expected - 1));
            assert!(store.pending_order(created.order_id).is_some());
            assert!(store.subscription_of("s1").is_none());
            assert!(store.boosts_of("s1").is_empty());
        }
    }

    #[tokio::test]
    async fn boosts_are_appended_never_merged() {
        let (engine, store, gateway) = engine();
        for token in ["b1", "b2"] {
            gateway.push_token(token);
            gateway.on_validate(token, ValidationScript::Paid { amount: 1500 });
            let created = engine.create_order("s1", "one_time_boost").await.unwrap();
            engine
                .resolve_callback(Some(created.order_id), None)
                .await
                .unwrap();
        }

        assert_eq!(store.boosts_of("s1").len(), 2);
        assert!(store.subscription_of("s1").is_none());
    }

    #[tokio::test]
    async fn subscription_renewal_stacks_onto_active_period() {
        let (engine, store, gateway) = engine();
        for token in ["t1", "t2"] {
            gateway.push_token(token);
            gateway.on_validate(token, ValidationScript::Paid { amount: 5000 });
        }

        let first = engine.create_order("s1", "tier_a").await.unwrap();
        engine.resolve_callback(Some(first.order_id), None).await.unwrap();
        let after_first = store.subscription_of("s1").unwrap().expires_at;

        let second = engine.create_order("s1", "tier_a").await.unwrap();
        engine.resolve_callback(Some(second.order_id), None).await.unwrap();
        let after_second = store.subscription_of("s1").unwrap();

        assert_eq!(after_second.tier, SubscriptionTier::TierA);
        assert_eq!(after_second.expires_at, after_first + Duration::days(7));
    }

    #[tokio::test]
    async fn hintless_callback_uses_single_recent_order() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Paid { amount: 5000 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();

        let resolution = engine.resolve_callback(None, None).await.unwrap();

        assert_eq!(
            resolution,
            Resolution::Settled {
                order_id: created.order_id,
                subject_id: "s1".into(),
                product: Product::TierA,
            }
        );
        assert!(store.pending_order(created.order_id).is_none());
    }

    #[tokio::test]
    async fn hintless_callback_with_ambiguous_orders_changes_nothing() {
        let (engine, store, gateway) = engine();
        for token in ["t1", "t2"] {
            gateway.push_token(token);
            gateway.on_validate(token, ValidationScript::Paid { amount: 5000 });
        }
        engine.create_order("s1", "tier_a").await.unwrap();
        engine.create_order("s2", "tier_a").await.unwrap();

        let result = engine.resolve_callback(None, None).await;

        assert_eq!(result.as_ref().unwrap(), &Resolution::Uncorrelated);
        assert!(gateway.validated_tokens().is_empty());
        assert!(store.subscription_of("s1").is_none());
        assert!(store.subscription_of("s2").is_none());
    }

    #[tokio::test]
    async fn hintless_callback_matches_inbound_token_among_many() {
        let (engine, store, gateway) = engine();
        for token in ["t1", "t2"] {
            gateway.push_token(token);
            gateway.on_validate(token, ValidationScript::Paid { amount: 5000 });
        }
        engine.create_order("s1", "tier_a").await.unwrap();
        let second = engine.create_order("s2", "tier_a").await.unwrap();

        let resolution = engine.resolve_callback(None, Some("t2")).await.unwrap();

        assert!(matches!(resolution, Resolution::Settled { order_id, .. } if order_id == second.order_id));
        assert!(store.subscription_of("s1").is_none());
        assert!(store.subscription_of("s2").is_some());
    }

    #[tokio::test]
    async fn recency_window_excludes_old_orders() {
        let (engine, store, _) = engine();
        let order = store.insert_order("s1", Product::TierA, 5000).await.unwrap();
        store.put_order(back_dated(order, Duration::hours(2)));

        let resolution = engine.resolve_callback(None, None).await.unwrap();
        assert_eq!(resolution, Resolution::Uncorrelated);
    }

    #[tokio::test]
    async fn strict_policy_fails_uncorrelated_callbacks() {
        let (engine, _, _) = engine_with(EngineSettings {
            uncorrelated_policy: UncorrelatedPolicy::Strict,
            ..EngineSettings::default()
        });

        let result = engine.resolve_callback(None, Some("whatever")).await;
        assert_eq!(result.as_ref().unwrap(), &Resolution::Uncorrelated);
        assert_eq!(engine.redirect_outcome(&result), RedirectOutcome::Failed);
    }

    #[tokio::test]
    async fn lenient_policy_succeeds_uncorrelated_callbacks() {
        let (engine, _, _) = engine();
        let result = engine.resolve_callback(None, None).await;
        assert_eq!(engine.redirect_outcome(&result), RedirectOutcome::Succeeded);
    }

    #[tokio::test]
    async fn late_callback_with_recorded_token_is_already_settled() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Paid { amount: 5000 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();
        engine.resolve_callback(Some(created.order_id), None).await.unwrap();

        let resolution = engine.resolve_callback(None, Some("tok")).await.unwrap();

        assert_eq!(
            resolution,
            Resolution::AlreadySettled {
                order_id: created.order_id
            }
        );
        assert_eq!(store.payment_records().len(), 1);
    }

    #[tokio::test]
    async fn reaping_abandons_only_stale_orders() {
        let (engine, store, _) = engine();
        let fresh = store.insert_order("s1", Product::TierA, 5000).await.unwrap();
        let stale = store.insert_order("s2", Product::TierA, 5000).await.unwrap();
        store.put_order(back_dated(stale.clone(), Duration::hours(30)));

        assert_eq!(engine.reap_stale_orders().await.unwrap(), 1);
        assert_eq!(
            store.order(stale.order_id).unwrap().status,
            OrderStatus::Abandoned
        );
        assert!(store.pending_order(fresh.order_id).is_some());
    }

    #[tokio::test]
    async fn callback_for_abandoned_order_is_not_settled() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok");
        gateway.on_validate("tok", ValidationScript::Paid { amount: 5000 });
        let created = engine.create_order("s1", "tier_a").await.unwrap();
        let order = store.order(created.order_id).unwrap();
        store.put_order(back_dated(order, Duration::hours(30)));
        engine.reap_stale_orders().await.unwrap();

        let resolution = engine
            .resolve_callback(Some(created.order_id), None)
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Uncorrelated);
        assert!(store.subscription_of("s1").is_none());
    }

    #[tokio::test]
    async fn abandoned_hint_never_borrows_another_subjects_order() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok-a");
        let abandoned = engine.create_order("s1", "tier_a").await.unwrap();
        let order = store.order(abandoned.order_id).unwrap();
        store.put_order(back_dated(order, Duration::hours(30)));
        engine.reap_stale_orders().await.unwrap();

        gateway.push_token("tok-b");
        gateway.on_validate("tok-b", ValidationScript::NotFound);
        let other = engine.create_order("s2", "tier_b").await.unwrap();

        let resolution = engine
            .resolve_callback(Some(abandoned.order_id), None)
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Uncorrelated);
        assert!(gateway.validated_tokens().is_empty());
        assert!(store.subscription_of("s2").is_none());
        assert!(store.pending_order(other.order_id).is_some());
    }

    #[tokio::test]
    async fn unknown_hint_never_borrows_the_only_recent_order() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok-b");
        gateway.on_validate("tok-b", ValidationScript::NotFound);
        let other = engine.create_order("s2", "tier_a").await.unwrap();

        let resolution = engine
            .resolve_callback(Some(Uuid::now_v7()), None)
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Uncorrelated);
        assert!(gateway.validated_tokens().is_empty());
        assert!(store.pending_order(other.order_id).is_some());
    }

    #[tokio::test]
    async fn hintless_callback_with_foreign_token_skips_the_only_recent_order() {
        let (engine, store, gateway) = engine();
        gateway.push_token("tok-b");
        gateway.on_validate("tok-b", ValidationScript::NotFound);
        let other = engine.create_order("s2", "tier_a").await.unwrap();

        let resolution = engine
            .resolve_callback(None, Some("tok-unknown"))
            .await
            .unwrap();

        assert_eq!(resolution, Resolution::Uncorrelated);
        assert!(gateway.validated_tokens().is_empty());
        assert!(store.subscription_of("s2").is_none());
        assert!(store.pending_order(other.order_id).is_some());
    }

    #[test]
    fn token_prefix_truncates_on_char_boundary() {
        assert_eq!(token_prefix("abcdefghijkl"), "abcdefgh");
        assert_eq!(token_prefix("abc"), "abc");
        assert_eq!(token_prefix("ééééééééé"), "éééééééé");
    }
}
