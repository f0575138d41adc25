//! Identifiers.
//!
//! Entity ids are UUID v4 newtypes so a `CheckoutId` can never be passed where
//! a `PaymentId` is expected. Seats are addressed by their chart label
//! (`"A1"`, `"Balcony-3-14"`) because that is the key the seat-chart
//! authority understands.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            #[doc = concat!("Creates a new random `", stringify!($name), "`")]
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[doc = concat!("Create a `", stringify!($name), "` from a `Uuid`")]
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the inner UUID
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Unique identifier for a checkout attempt
    CheckoutId
);
uuid_id!(
    /// Unique identifier for a payment
    PaymentId
);
uuid_id!(
    /// Unique identifier for an issued ticket
    TicketId
);
uuid_id!(
    /// Unique identifier for a buyer
    UserId
);
uuid_id!(
    /// Unique identifier for a sellable session (one performance of an event)
    SessionId
);
uuid_id!(
    /// Unique identifier for a ticket class (price tier)
    TicketClassId
);

/// A seat as addressed on the seat chart.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeatLabel(String);

impl SeatLabel {
    /// Wraps a chart label.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// The label as the authority knows it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the label, returning the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for SeatLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SeatLabel {
    fn from(label: &str) -> Self {
        Self::new(label)
    }
}

impl From<String> for SeatLabel {
    fn from(label: String) -> Self {
        Self(label)
    }
}

impl AsRef<str> for SeatLabel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Builds a label list from string literals.
///
/// ```
/// use boxoffice_core::ids::seat_labels;
///
/// let seats = seat_labels(&["A1", "A2"]);
/// assert_eq!(seats[1].as_str(), "A2");
/// ```
#[must_use]
pub fn seat_labels(labels: &[&str]) -> Vec<SeatLabel> {
    labels.iter().map(|label| SeatLabel::new(*label)).collect()
}
