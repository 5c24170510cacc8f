use be_billing_db::{EntitlementGrant, Product, SubscriptionTier};
use chrono::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    /// Price in integer currency units.
    pub amount: i64,
    pub duration: Duration,
}

/// Static price table. Read-only to reconciliation; the client never supplies a price.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub tier_a: Offer,
    pub tier_b: Offer,
    pub one_time_boost: Offer,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            tier_a: Offer {
                amount: 5000,
                duration: Duration::days(7),
            },
            tier_b: Offer {
                amount: 9000,
                duration: Duration::days(30),
            },
            one_time_boost: Offer {
                amount: 1500,
                duration: Duration::minutes(30),
            },
        }
    }
}

impl Catalog {
    pub fn offer(&self, product: Product) -> Offer {
        match product {
            Product::TierA => self.tier_a,
            Product::TierB => self.tier_b,
            Product::OneTimeBoost => self.one_time_boost,
        }
    }

    pub fn amount(&self, product: Product) -> i64 {
        self.offer(product).amount
    }

    /// Entitlement mutation applied when an order for `product` settles.
    pub fn grant(&self, product: Product) -> EntitlementGrant {
        let duration = self.offer(product).duration;
        match product {
            Product::TierA => EntitlementGrant::Subscription {
                tier: SubscriptionTier::TierA,
                duration,
            },
            Product::TierB => EntitlementGrant::Subscription {
                tier: SubscriptionTier::TierB,
                duration,
            },
            Product::OneTimeBoost => EntitlementGrant::Boost { duration },
        }
    }
}
