//! Platform fee calculation.
//!
//! The fee for an item is chosen from a table of amount ranges ([`FeeTier`]). Verified sellers and sellers with an
//! active membership get a discount off the tier's base rate, but the resulting rate never drops below a configured
//! floor. The calculation is pure: the same amount, seller and schedule always produce the same fee.
use market_common::{FeeRate, Money};
use serde::{Deserialize, Serialize};

use crate::db_types::{FeeTier, SellerProfile};

pub const DEFAULT_FEE_RATE: FeeRate = FeeRate::from_bps(500);
pub const MINIMUM_FEE_RATE: FeeRate = FeeRate::from_bps(200);
pub const DEFAULT_LEGIT_DISCOUNT: FeeRate = FeeRate::from_bps(100);
pub const DEFAULT_MEMBERSHIP_DISCOUNT: FeeRate = FeeRate::from_bps(50);

/// Schedule-wide fallbacks, used when no tier matches or a tier leaves a discount unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeDefaults {
    pub base_rate: FeeRate,
    pub minimum_rate: FeeRate,
    pub legit_discount: FeeRate,
    pub membership_discount: FeeRate,
}

impl Default for FeeDefaults {
    fn default() -> Self {
        Self {
            base_rate: DEFAULT_FEE_RATE,
            minimum_rate: MINIMUM_FEE_RATE,
            legit_discount: DEFAULT_LEGIT_DISCOUNT,
            membership_discount: DEFAULT_MEMBERSHIP_DISCOUNT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub fee_rate: FeeRate,
    pub fee: Money,
}

#[derive(Debug, Clone, Default)]
pub struct FeeSchedule {
    tiers: Vec<FeeTier>,
    defaults: FeeDefaults,
}

impl FeeSchedule {
    pub fn new(mut tiers: Vec<FeeTier>, defaults: FeeDefaults) -> Self {
        tiers.sort_by_key(|t| (t.min_amount, t.id));
        Self { tiers, defaults }
    }

    pub fn defaults(&self) -> &FeeDefaults {
        &self.defaults
    }

    /// The first tier (by ascending lower bound) whose range contains `amount`.
    pub fn tier_for(&self, amount: Money) -> Option<&FeeTier> {
        self.tiers.iter().find(|t| t.contains(amount))
    }

    pub fn compute_fee(&self, amount: Money, seller: &SellerProfile) -> FeeQuote {
        let tier = self.tier_for(amount);
        let base = tier.map(|t| t.base_rate).unwrap_or(self.defaults.base_rate);
        let mut rate = base;
        if seller.legit_verified {
            let discount = tier.and_then(|t| t.legit_discount).unwrap_or(self.defaults.legit_discount);
            rate = rate.less(discount);
        }
        if seller.membership_active {
            let discount = tier.and_then(|t| t.membership_discount).unwrap_or(self.defaults.membership_discount);
            rate = rate.less(discount);
        }
        let fee_rate = rate.at_least(self.defaults.minimum_rate);
        FeeQuote { fee_rate, fee: fee_rate.apply(amount) }
    }
}
