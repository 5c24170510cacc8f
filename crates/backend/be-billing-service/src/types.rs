use be_billing_db::{Boost, Subscription, SubscriptionTier};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub product: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub redirect_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntitlementsResponse {
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
    pub boosts: Vec<BoostView>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BoostView {
    pub expires_at: DateTime<Utc>,
}

impl EntitlementsResponse {
    /// `subscription` is expected to be active already.
    pub fn new(subscription: Option<Subscription>, boosts: Vec<Boost>) -> Self {
        let (tier, expires_at) = match subscription {
            Some(sub) => (sub.tier, Some(sub.expires_at)),
            None => (SubscriptionTier::None, None),
        };
        Self {
            tier,
            expires_at,
            boosts: boosts
                .into_iter()
                .map(|b| BoostView {
                    expires_at: b.expires_at,
                })
                .collect(),
        }
    }
}
