//! Bulk campaign email dispatch engine.
//!
//! This crate provides a dispatcher that accepts a named contact list (from
//! an uploaded spreadsheet), a message template, and a delivery policy
//! (immediate or scheduled, batch size, inter-batch delay), and delivers
//! personalized email to every recipient while tracking partial progress.
//! Campaigns survive process restarts: schedules are re-armed from storage at
//! startup. A companion reminder sweep scans for registrations that never
//! checked in and dispatches reminder batches on the same machinery.

pub mod contacts;
mod delivery;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod mailer;
pub mod reminder;
pub mod storage;
pub mod template;

// Re-export commonly used types
pub use contacts::ContactRecord;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{BroadsideError, Result};
pub use mailer::{
    DeliveryId, EmailAttachment, Mailer, MockMailer, OutgoingEmail, SmtpConfig, SmtpMailer,
    TlsMode,
};
pub use reminder::{ReminderConfig, ReminderSweep, SweepStats};
pub use storage::{FileStore, MemoryStore, Storage};
#[cfg(feature = "postgres")]
pub use storage::PostgresStore;

/// Get the broadside database migrator
///
/// Returns a migrator that can be run against a connection pool.
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
