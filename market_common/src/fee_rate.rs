use std::fmt::Display;

use serde::{Deserialize, Serialize};
use sqlx::Type;

use crate::Money;

/// A percentage expressed in basis points (`100` bps = 1%). Fee percentages are snapshotted onto order items in this
/// form, so they are exact and comparable.
#[derive(Debug, Clone, Copy, Default, Type, Ord, PartialOrd, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[sqlx(transparent)]
pub struct FeeRate(i64);

impl FeeRate {
    pub const fn from_bps(bps: i64) -> Self {
        Self(bps)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn bps(&self) -> i64 {
        self.0
    }

    /// Subtracts a discount from this rate. May go negative; callers clamp with [`FeeRate::at_least`].
    pub fn less(self, discount: FeeRate) -> Self {
        Self(self.0 - discount.0)
    }

    pub fn at_least(self, floor: FeeRate) -> Self {
        Self(self.0.max(floor.0))
    }

    /// The share of `amount` this rate represents, rounded to the nearest cent with halves rounded away from zero.
    pub fn apply(&self, amount: Money) -> Money {
        let product = i128::from(amount.cents()) * i128::from(self.0);
        let rounded = if product >= 0 { (product + 5_000) / 10_000 } else { -((-product + 5_000) / 10_000) };
        #[allow(clippy::cast_possible_truncation)]
        Money::from_cents(rounded as i64)
    }
}

impl From<i64> for FeeRate {
    fn from(bps: i64) -> Self {
        Self(bps)
    }
}

impl Display for FeeRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{sign}{}.{:02}%", abs / 100, abs % 100)
    }
}
