use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};
use uuid::Uuid;

/// Purchasable products. Prices and durations live in the service catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "billing_product", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Product {
    TierA,
    TierB,
    OneTimeBoost,
}

impl Product {
    pub const ALL: [Product; 3] = [Product::TierA, Product::TierB, Product::OneTimeBoost];

    pub fn as_str(&self) -> &'static str {
        match self {
            Product::TierA => "tier_a",
            Product::TierB => "tier_b",
            Product::OneTimeBoost => "one_time_boost",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Product {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Product::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown product '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "subscription_tier", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    None,
    TierA,
    TierB,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "order_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Resolved,
    Abandoned,
}

/// A locally-initiated purchase intent.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub order_id: Uuid,
    pub subject_id: String,
    pub product: Product,
    pub amount: i64,
    /// Set once after the gateway mints a token, never changed afterwards.
    pub gateway_token: Option<String>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_pending(&self) -> bool {
        self.status == OrderStatus::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub subject_id: String,
    pub tier: SubscriptionTier,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.tier != SubscriptionTier::None && self.expires_at > now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Boost {
    pub id: Uuid,
    pub subject_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Write-once audit record of a validated payment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub subject_id: String,
    pub product: Product,
    pub amount: i64,
    pub gateway_token: String,
    pub gateway_response: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPaymentRecord {
    pub order_id: Uuid,
    pub subject_id: String,
    pub product: Product,
    pub amount: i64,
    pub gateway_token: String,
    pub gateway_response: serde_json::Value,
}

/// The entitlement mutation a settled order applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntitlementGrant {
    Subscription {
        tier: SubscriptionTier,
        duration: Duration,
    },
    Boost {
        duration: Duration,
    },
}

#[derive(Debug, Clone)]
pub enum SettleOutcome {
    Settled(PaymentRecord),
    /// The order was no longer pending, or its token already has a record.
    AlreadySettled,
}

/// Extend-or-set: stack onto a still-active subscription of the same tier,
/// otherwise start a fresh period at `now`.
pub fn next_subscription_expiry(
    current: Option<&Subscription>,
    tier: SubscriptionTier,
    duration: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match current {
        Some(sub) if sub.tier == tier && sub.is_active(now) => sub.expires_at + duration,
        _ => now + duration,
    }
}
