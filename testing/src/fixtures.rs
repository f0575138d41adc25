//! Catalog fixtures.

use crate::store::InMemoryStore;
use boxoffice_core::ids::{SeatLabel, SessionId, TicketClassId};
use boxoffice_core::model::{Seat, SellableSession, TicketClass};
use boxoffice_core::money::Money;

/// Builds a session with seats and ticket classes.
///
/// The chart key defaults to the session name. Ticket classes are listed in
/// the order they are added.
#[derive(Debug, Clone)]
pub struct VenueBuilder {
    session: SellableSession,
    seats: Vec<(String, Option<String>)>,
    classes: Vec<(String, Option<String>, u64)>,
}

impl VenueBuilder {
    /// Start a session called `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            session: SellableSession {
                id: SessionId::new(),
                name: name.to_string(),
                chart_key: Some(name.to_string()),
            },
            seats: Vec::new(),
            classes: Vec::new(),
        }
    }

    /// Override the chart key; `None` makes the session unsellable.
    #[must_use]
    pub fn chart_key(mut self, chart_key: Option<&str>) -> Self {
        self.session.chart_key = chart_key.map(str::to_string);
        self
    }

    /// Add a seat.
    #[must_use]
    pub fn seat(mut self, label: &str, category: Option<&str>) -> Self {
        self.seats
            .push((label.to_string(), category.map(str::to_string)));
        self
    }

    /// Add several seats of one category.
    #[must_use]
    pub fn seats(mut self, labels: &[&str], category: Option<&str>) -> Self {
        for label in labels {
            self = self.seat(label, category);
        }
        self
    }

    /// Add a ticket class priced in minor units.
    #[must_use]
    pub fn ticket_class(mut self, name: &str, category: Option<&str>, price: u64) -> Self {
        self.classes
            .push((name.to_string(), category.map(str::to_string), price));
        self
    }

    /// Write the session into `store` and return it.
    pub fn seed(self, store: &InMemoryStore) -> SellableSession {
        let session_id = self.session.id;
        for (label, category) in self.seats {
            store.add_seat(Seat {
                session_id,
                label: SeatLabel::new(label),
                category,
            });
        }
        for (sort_order, (name, category, price)) in (0_i32..).zip(self.classes) {
            store.add_ticket_class(TicketClass {
                id: TicketClassId::new(),
                session_id,
                name,
                category,
                price: Money::from_minor(price),
                sort_order,
            });
        }
        store.add_session(self.session.clone());
        self.session
    }
}
