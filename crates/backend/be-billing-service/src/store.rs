use std::future::Future;

use be_billing_db::{
    Boost, DatabaseManager, DbResult, EntitlementGrant, NewPaymentRecord, Order, PaymentRecord,
    Product, SettleOutcome, Subscription,
};
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Persistence the reconciliation engine relies on.
///
/// `settle` must apply retirement, entitlement grant and payment record as one
/// unit: either all of them are visible afterwards or none is.
pub trait BillingStore: Send + Sync + 'static {
    fn insert_order(
        &self,
        subject_id: &str,
        product: Product,
        amount: i64,
    ) -> impl Future<Output = DbResult<Order>> + Send;

    fn attach_token(
        &self,
        order_id: Uuid,
        token: &str,
    ) -> impl Future<Output = DbResult<Order>> + Send;

    fn load_order(&self, order_id: Uuid) -> impl Future<Output = DbResult<Option<Order>>> + Send;

    fn recent_pending_orders(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = DbResult<Vec<Order>>> + Send;

    fn payment_record_for_token(
        &self,
        token: &str,
    ) -> impl Future<Output = DbResult<Option<PaymentRecord>>> + Send;

    fn settle(
        &self,
        order_id: Uuid,
        grant: EntitlementGrant,
        record: NewPaymentRecord,
        now: DateTime<Utc>,
    ) -> impl Future<Output = DbResult<SettleOutcome>> + Send;

    fn abandon_stale(&self, cutoff: DateTime<Utc>) -> impl Future<Output = DbResult<u64>> + Send;

    fn subscription(
        &self,
        subject_id: &str,
    ) -> impl Future<Output = DbResult<Option<Subscription>>> + Send;

    fn active_boosts(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = DbResult<Vec<Boost>>> + Send;
}

impl BillingStore for DatabaseManager {
    async fn insert_order(&self, subject_id: &str, product: Product, amount: i64) -> DbResult<Order> {
        self.create_order()
            .subject_id(subject_id.to_string())
            .product(product)
            .amount(amount)
            .call()
            .await
    }

    async fn attach_token(&self, order_id: Uuid, token: &str) -> DbResult<Order> {
        self.attach_gateway_token()
            .order_id(order_id)
            .token(token.to_string())
            .call()
            .await
    }

    async fn load_order(&self, order_id: Uuid) -> DbResult<Option<Order>> {
        self.find_order(order_id).await
    }

    async fn recent_pending_orders(&self, since: DateTime<Utc>) -> DbResult<Vec<Order>> {
        self.list_pending_orders_since(since).await
    }

    async fn payment_record_for_token(&self, token: &str) -> DbResult<Option<PaymentRecord>> {
        self.find_payment_record_by_token(token).await
    }

    async fn settle(
        &self,
        order_id: Uuid,
        grant: EntitlementGrant,
        record: NewPaymentRecord,
        now: DateTime<Utc>,
    ) -> DbResult<SettleOutcome> {
        self.settle_order()
            .order_id(order_id)
            .grant(grant)
            .record(record)
            .now(now)
            .call()
            .await
    }

    async fn abandon_stale(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        self.abandon_pending_orders_before(cutoff).await
    }

    async fn subscription(&self, subject_id: &str) -> DbResult<Option<Subscription>> {
        self.get_subscription(subject_id).await
    }

    async fn active_boosts(&self, subject_id: &str, now: DateTime<Utc>) -> DbResult<Vec<Boost>> {
        self.list_active_boosts(subject_id, now).await
    }
}
