//! Money in integer minor units.

use serde::{Deserialize, Serialize};
use std::fmt;

/// An amount of money in the smallest currency unit.
///
/// Prices, gross amounts and payout accruals are all `Money`; floating point
/// never touches an amount.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// Creates a `Money` value from minor units
    #[must_use]
    pub const fn from_minor(minor: u64) -> Self {
        Self(minor)
    }

    /// Returns the amount in minor units
    #[must_use]
    pub const fn minor(&self) -> u64 {
        self.0
    }

    /// Checks if the amount is zero
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Adds two money amounts with overflow checking
    #[must_use]
    pub const fn checked_add(self, other: Self) -> Option<Self> {
        match self.0.checked_add(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Subtracts with underflow checking
    #[must_use]
    pub const fn checked_sub(self, other: Self) -> Option<Self> {
        match self.0.checked_sub(other.0) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// Scales the amount by an integer factor (gateway amount encoding).
    #[must_use]
    pub const fn checked_scale(self, factor: u64) -> Option<Self> {
        match self.0.checked_mul(factor) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }

    /// `percent`% of this amount, rounded down.
    #[must_use]
    pub const fn percent_floor(self, percent: u8) -> Self {
        // u128 keeps `amount * percent` from overflowing for any u64 amount
        #[allow(clippy::cast_possible_truncation)]
        let share = ((self.0 as u128) * (percent as u128) / 100) as u64;
        Self(share)
    }

    /// Sums an iterator of amounts, `None` on overflow.
    pub fn checked_sum(amounts: impl IntoIterator<Item = Self>) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Self::ZERO, Self::checked_add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn percent_floor_rounds_down() {
        assert_eq!(Money::from_minor(999).percent_floor(20), Money::from_minor(199));
        assert_eq!(Money::from_minor(100_000).percent_floor(20), Money::from_minor(20_000));
    }

    #[test]
    fn checked_sum_detects_overflow() {
        assert_eq!(
            Money::checked_sum([Money::from_minor(u64::MAX), Money::from_minor(1)]),
            None
        );
        assert_eq!(
            Money::checked_sum([Money::from_minor(2), Money::from_minor(3)]),
            Some(Money::from_minor(5))
        );
    }

    proptest! {
        #[test]
        fn percent_share_never_exceeds_whole(amount in any::<u64>(), percent in 0u8..=100) {
            let whole = Money::from_minor(amount);
            let share = whole.percent_floor(percent);
            prop_assert!(share <= whole);
            prop_assert!(whole.checked_sub(share).is_some());
        }
    }
}
