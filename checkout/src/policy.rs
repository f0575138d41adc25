//! Ticket class resolution and fee split.
//!
//! Each seat is priced by the ticket class whose category matches the seat's
//! category. What happens when no class matches is a business decision, so it
//! is an explicit [`TicketClassPolicy`] rather than a silent default.

use boxoffice_core::ids::SeatLabel;
use boxoffice_core::model::{Seat, TicketClass};
use boxoffice_core::money::Money;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Platform share of every payment, in percent. Rounded down.
pub const PLATFORM_FEE_PERCENT: u8 = 20;

/// How to price a seat whose category has no matching ticket class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketClassPolicy {
    /// No match, no ticket: the seat is unresolvable.
    StrictCategoryMatch,
    /// Fall back to the cheapest class of the session.
    FallbackToCheapest,
    /// Fall back to the first class in listing order.
    #[default]
    FallbackToFirst,
}

impl TicketClassPolicy {
    /// Configuration string of the policy.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StrictCategoryMatch => "strict_category_match",
            Self::FallbackToCheapest => "fallback_to_cheapest",
            Self::FallbackToFirst => "fallback_to_first",
        }
    }

    /// Pick the class for `seat` from `classes` (in listing order).
    ///
    /// A class matches when both the seat and the class carry the same
    /// category. Among several matches the first listed wins.
    #[must_use]
    pub fn resolve<'a>(&self, seat: &Seat, classes: &'a [TicketClass]) -> Option<&'a TicketClass> {
        let matched = seat.category.as_deref().and_then(|category| {
            classes
                .iter()
                .find(|class| class.category.as_deref() == Some(category))
        });
        if matched.is_some() {
            return matched;
        }

        match self {
            Self::StrictCategoryMatch => None,
            Self::FallbackToCheapest => classes.iter().min_by_key(|class| class.price),
            Self::FallbackToFirst => classes.first(),
        }
    }
}

impl fmt::Display for TicketClassPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TicketClassPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict_category_match" | "strict" => Ok(Self::StrictCategoryMatch),
            "fallback_to_cheapest" | "cheapest" => Ok(Self::FallbackToCheapest),
            "fallback_to_first" | "first" => Ok(Self::FallbackToFirst),
            other => Err(format!("unknown ticket class policy: {other}")),
        }
    }
}

/// A seat with the class that prices it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricedSeat {
    /// Seat
    pub seat: SeatLabel,
    /// Resolved class
    pub class: TicketClass,
}

/// Result of pricing a checkout's seats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeatPricing {
    /// Seats with a class, in request order
    pub priced: Vec<PricedSeat>,
    /// Seats with no class (or unknown to the catalog)
    pub unresolved: Vec<SeatLabel>,
}

impl SeatPricing {
    /// Price every requested seat.
    #[must_use]
    pub fn resolve(
        policy: TicketClassPolicy,
        requested: &[SeatLabel],
        seats: &[Seat],
        classes: &[TicketClass],
    ) -> Self {
        let mut pricing = Self::default();
        for label in requested {
            let class = seats
                .iter()
                .find(|seat| &seat.label == label)
                .and_then(|seat| policy.resolve(seat, classes));
            match class {
                Some(class) => pricing.priced.push(PricedSeat {
                    seat: label.clone(),
                    class: class.clone(),
                }),
                None => pricing.unresolved.push(label.clone()),
            }
        }
        pricing
    }

    /// Sum of the priced seats, `None` on overflow.
    #[must_use]
    pub fn gross(&self) -> Option<Money> {
        Money::checked_sum(self.priced.iter().map(|priced| priced.class.price))
    }
}

/// Gross amount split between platform and organizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    /// Total charged
    pub gross: Money,
    /// Platform share, rounded down
    pub platform_fee: Money,
    /// Remainder
    pub organizer_amount: Money,
}

impl FeeSplit {
    /// Split `gross` at [`PLATFORM_FEE_PERCENT`].
    #[must_use]
    pub fn of(gross: Money) -> Self {
        let platform_fee = gross.percent_floor(PLATFORM_FEE_PERCENT);
        let organizer_amount = gross.checked_sub(platform_fee).unwrap_or(Money::ZERO);
        Self {
            gross,
            platform_fee,
            organizer_amount,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boxoffice_core::ids::{SessionId, TicketClassId};
    use proptest::prelude::*;

    fn class(name: &str, category: Option<&str>, price: u64, sort_order: i32) -> TicketClass {
        TicketClass {
            id: TicketClassId::new(),
            session_id: SessionId::new(),
            name: name.to_string(),
            category: category.map(str::to_string),
            price: Money::from_minor(price),
            sort_order,
        }
    }

    fn seat(label: &str, category: Option<&str>) -> Seat {
        Seat {
            session_id: SessionId::new(),
            label: SeatLabel::new(label),
            category: category.map(str::to_string),
        }
    }

    fn classes() -> Vec<TicketClass> {
        vec![
            class("Stalls", Some("stalls"), 80_000, 0),
            class("Balcony", Some("balcony"), 50_000, 1),
        ]
    }

    #[test]
    fn category_match_wins_under_every_policy() {
        let classes = classes();
        for policy in [
            TicketClassPolicy::StrictCategoryMatch,
            TicketClassPolicy::FallbackToCheapest,
            TicketClassPolicy::FallbackToFirst,
        ] {
            let resolved = policy.resolve(&seat("B1", Some("balcony")), &classes);
            assert_eq!(resolved.map(|c| c.name.as_str()), Some("Balcony"));
        }
    }

    #[test]
    fn unmatched_category_follows_policy() {
        let classes = classes();
        let vip = seat("V1", Some("vip"));

        assert!(TicketClassPolicy::StrictCategoryMatch.resolve(&vip, &classes).is_none());
        assert_eq!(
            TicketClassPolicy::FallbackToCheapest
                .resolve(&vip, &classes)
                .map(|c| c.name.as_str()),
            Some("Balcony")
        );
        assert_eq!(
            TicketClassPolicy::FallbackToFirst
                .resolve(&vip, &classes)
                .map(|c| c.name.as_str()),
            Some("Stalls")
        );
    }

    #[test]
    fn uncategorized_seat_is_unresolvable_when_strict() {
        let classes = classes();
        assert!(
            TicketClassPolicy::StrictCategoryMatch
                .resolve(&seat("X1", None), &classes)
                .is_none()
        );
    }

    #[test]
    fn pricing_reports_unknown_seats() {
        let classes = classes();
        let seats = vec![seat("A1", Some("stalls"))];
        let requested = vec![SeatLabel::new("A1"), SeatLabel::new("Z9")];

        let pricing =
            SeatPricing::resolve(TicketClassPolicy::FallbackToFirst, &requested, &seats, &classes);

        assert_eq!(pricing.priced.len(), 1);
        assert_eq!(pricing.unresolved, vec![SeatLabel::new("Z9")]);
        assert_eq!(pricing.gross(), Some(Money::from_minor(80_000)));
    }

    #[test]
    fn policy_parses_config_spellings() {
        assert_eq!(
            "fallback_to_cheapest".parse::<TicketClassPolicy>(),
            Ok(TicketClassPolicy::FallbackToCheapest)
        );
        assert_eq!(
            "STRICT".parse::<TicketClassPolicy>(),
            Ok(TicketClassPolicy::StrictCategoryMatch)
        );
        assert!("random".parse::<TicketClassPolicy>().is_err());
    }

    #[test]
    fn fee_split_of_round_amount() {
        let split = FeeSplit::of(Money::from_minor(100_000));
        assert_eq!(split.platform_fee, Money::from_minor(20_000));
        assert_eq!(split.organizer_amount, Money::from_minor(80_000));
    }

    proptest! {
        #[test]
        fn fee_split_is_exact(gross in any::<u64>()) {
            let split = FeeSplit::of(Money::from_minor(gross));
            prop_assert_eq!(
                split.platform_fee.checked_add(split.organizer_amount),
                Some(split.gross)
            );
            prop_assert!(split.platform_fee <= split.organizer_amount || gross < 5);
        }
    }
}
