//! Reminder target types.
//!
//! A reminder target is an approved registration that has not checked in,
//! created before the sweep cutoff, on a ticket whose event has not ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl From<Uuid> for TicketId {
    fn from(uuid: Uuid) -> Self {
        TicketId(uuid)
    }
}

impl std::ops::Deref for TicketId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// A ticket eligible for the reminder sweep.
#[derive(Debug, Clone, Serialize)]
pub struct TicketReminder {
    pub ticket_id: TicketId,
    pub ticket_name: String,
    pub event_name: String,
    /// Tickets whose event has ended are skipped entirely.
    pub event_ends_at: DateTime<Utc>,
    pub reminders_enabled: bool,
}

/// One registration row, as returned by the un-checked-in query.
#[derive(Debug, Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub name: String,
    pub contact: String,
    pub approved: bool,
    pub checked_in_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Registration {
    /// Whether this registration should receive a reminder given the cutoff.
    ///
    /// Same-day registrations are never reminded: the row must predate the
    /// cutoff (now minus one day for the daily sweep).
    pub fn is_reminder_target(&self, cutoff: DateTime<Utc>) -> bool {
        self.approved && self.checked_in_at.is_none() && self.created_at < cutoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn registration(
        approved: bool,
        checked_in: bool,
        age: Duration,
    ) -> Registration {
        Registration {
            email: "a@example.com".to_string(),
            name: "A".to_string(),
            contact: String::new(),
            approved,
            checked_in_at: checked_in.then(Utc::now),
            created_at: Utc::now() - age,
        }
    }

    #[test]
    fn same_day_registrations_are_not_targets() {
        let cutoff = Utc::now() - Duration::days(1);
        assert!(!registration(true, false, Duration::hours(2)).is_reminder_target(cutoff));
        assert!(registration(true, false, Duration::days(3)).is_reminder_target(cutoff));
    }

    #[test]
    fn checked_in_or_unapproved_registrations_are_not_targets() {
        let cutoff = Utc::now() - Duration::days(1);
        assert!(!registration(true, true, Duration::days(3)).is_reminder_target(cutoff));
        assert!(!registration(false, false, Duration::days(3)).is_reminder_target(cutoff));
    }
}
