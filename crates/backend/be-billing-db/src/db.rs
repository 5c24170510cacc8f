use bon::bon;
use chrono::{DateTime, Utc};
use sqlx::{
    Postgres, Transaction,
    migrate::MigrateDatabase,
    postgres::{PgPool, PgPoolOptions},
};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::{DbError, DbResult},
    types::{
        Boost, EntitlementGrant, NewPaymentRecord, Order, PaymentRecord, Product, SettleOutcome,
        Subscription, SubscriptionTier,
    },
};

const ORDER_COLUMNS: &str =
    "order_id, subject_id, product, amount, gateway_token, status, created_at, updated_at";

const PAYMENT_RECORD_COLUMNS: &str =
    "id, order_id, subject_id, product, amount, gateway_token, gateway_response, created_at";

#[derive(Debug)]
pub struct DatabaseManager {
    pub pool: PgPool,
}

#[bon]
impl DatabaseManager {
    pub async fn new(database_url: &str) -> DbResult<Self> {
        if !sqlx::Postgres::database_exists(database_url).await? {
            sqlx::Postgres::create_database(database_url).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(20)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        let db_manager = DatabaseManager { pool };

        Self::run_migrations(&db_manager.pool).await?;

        Ok(db_manager)
    }

    async fn run_migrations(pool: &PgPool) -> DbResult<()> {
        let migrator = sqlx::migrate!("./src/migrations");
        migrator.run(pool).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Order ledger
    // ------------------------------------------------------------------

    #[builder]
    pub async fn create_order(
        &self,
        subject_id: String,
        product: Product,
        amount: i64,
    ) -> DbResult<Order> {
        let order_id = Uuid::now_v7();
        let now = Utc::now();

        let query = format!(
            r#"
            INSERT INTO orders (order_id, subject_id, product, amount, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'pending', $5, $5)
            RETURNING {ORDER_COLUMNS}
            "#
        );

        let order = sqlx::query_as::<_, Order>(&query)
            .bind(order_id)
            .bind(&subject_id)
            .bind(product)
            .bind(amount)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        Ok(order)
    }

    /// Attaches the gateway token. A token, once set, is never overwritten.
    #[builder]
    pub async fn attach_gateway_token(&self, order_id: Uuid, token: String) -> DbResult<Order> {
        let query = format!(
            r#"
            UPDATE orders
            SET gateway_token = $2, updated_at = $3
            WHERE order_id = $1 AND gateway_token IS NULL
            RETURNING {ORDER_COLUMNS}
            "#
        );

        let updated = sqlx::query_as::<_, Order>(&query)
            .bind(order_id)
            .bind(&token)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(order) => Ok(order),
            None => match self.find_order(order_id).await? {
                Some(_) => Err(DbError::conflict(
                    "order",
                    "gateway token already attached",
                )),
                None => Err(DbError::not_found_with_id("order", order_id.to_string())),
            },
        }
    }

    pub async fn find_order(&self, order_id: Uuid) -> DbResult<Option<Order>> {
        let query = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE order_id = $1");

        let order = sqlx::query_as::<_, Order>(&query)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(order)
    }

    /// Pending orders created at or after `since`, newest first.
    pub async fn list_pending_orders_since(&self, since: DateTime<Utc>) -> DbResult<Vec<Order>> {
        let query = format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE status = 'pending' AND created_at >= $1
            ORDER BY created_at DESC
            "#
        );

        let orders = sqlx::query_as::<_, Order>(&query)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;

        Ok(orders)
    }

    /// Marks pending orders created before `cutoff` as abandoned.
    pub async fn abandon_pending_orders_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'abandoned', updated_at = $2
            WHERE status = 'pending' AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Payment records
    // ------------------------------------------------------------------

    pub async fn find_payment_record_by_token(
        &self,
        gateway_token: &str,
    ) -> DbResult<Option<PaymentRecord>> {
        let query = format!(
            "SELECT {PAYMENT_RECORD_COLUMNS} FROM payment_records WHERE gateway_token = $1"
        );

        let record = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(gateway_token)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    // ------------------------------------------------------------------
    // Settlement
    // ------------------------------------------------------------------

    /// Retires the order, applies the grant and writes the payment record in
    /// one transaction. Nothing is applied unless all three succeed.
    #[builder]
    pub async fn settle_order(
        &self,
        order_id: Uuid,
        grant: EntitlementGrant,
        record: NewPaymentRecord,
        now: DateTime<Utc>,
    ) -> DbResult<SettleOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claiming the row serialises concurrent settlements of the same order.
        let claimed = sqlx::query(
            r#"
            UPDATE orders
            SET status = 'resolved', updated_at = $2
            WHERE order_id = $1 AND status = 'pending'
            "#,
        )
        .bind(order_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            debug!(%order_id, "Order no longer pending, skipping settlement");
            tx.rollback().await?;
            return Ok(SettleOutcome::AlreadySettled);
        }

        match grant {
            EntitlementGrant::Subscription { tier, duration } => {
                Self::upsert_subscription(&mut tx, &record.subject_id, tier, duration, now)
                    .await?;
            }
            EntitlementGrant::Boost { duration } => {
                Self::insert_boost(&mut tx, &record.subject_id, now + duration, now).await?;
            }
        }

        let inserted = match Self::insert_payment_record(&mut tx, &record, now).await {
            Ok(inserted) => inserted,
            Err(e) if e.is_duplicate() => {
                debug!(%order_id, "Payment record already exists for token, rolling back");
                tx.rollback().await?;
                return Ok(SettleOutcome::AlreadySettled);
            }
            Err(e) => return Err(e),
        };

        tx.commit().await?;

        Ok(SettleOutcome::Settled(inserted))
    }

    async fn upsert_subscription(
        tx: &mut Transaction<'_, Postgres>,
        subject_id: &str,
        tier: SubscriptionTier,
        duration: chrono::Duration,
        now: DateTime<Utc>,
    ) -> DbResult<Subscription> {
        // Extend-or-set happens inside the upsert so concurrent grants never
        // lose an extension.
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (subject_id, tier, expires_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (subject_id) DO UPDATE SET
                expires_at = CASE
                    WHEN subscriptions.tier = EXCLUDED.tier AND subscriptions.expires_at > $4
                        THEN subscriptions.expires_at + ($5::bigint * INTERVAL '1 second')
                    ELSE EXCLUDED.expires_at
                END,
                tier = EXCLUDED.tier,
                updated_at = EXCLUDED.updated_at
            RETURNING subject_id, tier, expires_at, updated_at
            "#,
        )
        .bind(subject_id)
        .bind(tier)
        .bind(now + duration)
        .bind(now)
        .bind(duration.num_seconds())
        .fetch_one(&mut **tx)
        .await?;

        Ok(subscription)
    }

    async fn insert_boost(
        tx: &mut Transaction<'_, Postgres>,
        subject_id: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DbResult<Boost> {
        let boost = sqlx::query_as::<_, Boost>(
            r#"
            INSERT INTO boosts (id, subject_id, expires_at, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, subject_id, expires_at, created_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(subject_id)
        .bind(expires_at)
        .bind(now)
        .fetch_one(&mut **tx)
        .await?;

        Ok(boost)
    }

    async fn insert_payment_record(
        tx: &mut Transaction<'_, Postgres>,
        record: &NewPaymentRecord,
        now: DateTime<Utc>,
    ) -> DbResult<PaymentRecord> {
        let query = format!(
            r#"
            INSERT INTO payment_records
                (id, order_id, subject_id, product, amount, gateway_token, gateway_response, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {PAYMENT_RECORD_COLUMNS}
            "#
        );

        let inserted = sqlx::query_as::<_, PaymentRecord>(&query)
            .bind(Uuid::now_v7())
            .bind(record.order_id)
            .bind(&record.subject_id)
            .bind(record.product)
            .bind(record.amount)
            .bind(&record.gateway_token)
            .bind(&record.gateway_response)
            .bind(now)
            .fetch_one(&mut **tx)
            .await?;

        Ok(inserted)
    }

    // ------------------------------------------------------------------
    // Entitlement reads
    // ------------------------------------------------------------------

    pub async fn get_subscription(&self, subject_id: &str) -> DbResult<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            r#"
            SELECT subject_id, tier, expires_at, updated_at
            FROM subscriptions
            WHERE subject_id = $1
            "#,
        )
        .bind(subject_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    pub async fn list_active_boosts(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> DbResult<Vec<Boost>> {
        let boosts = sqlx::query_as::<_, Boost>(
            r#"
            SELECT id, subject_id, expires_at, created_at
            FROM boosts
            WHERE subject_id = $1 AND expires_at > $2
            ORDER BY expires_at ASC
            "#,
        )
        .bind(subject_id)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(boosts)
    }
}
