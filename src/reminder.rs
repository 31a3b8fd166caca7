//! Daily reminder sweep over un-actioned registrations.
//!
//! The sweep scans tickets with reminder notifications enabled, finds
//! approved registrations that never checked in and are older than the
//! cutoff, and pushes them through the same chunked delivery loop as the
//! campaign executor. Same-day registrations are never reminded, and tickets
//! whose event has already ended are skipped entirely.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::contacts::ContactRecord;
use crate::delivery::{deliver_slice, load_attachments};
use crate::domain::reminder::Registration;
use crate::domain::template::Channel;
use crate::error::Result;
use crate::mailer::Mailer;
use crate::storage::{FileStore, Storage};

/// Configuration for the reminder sweep.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ReminderConfig {
    /// How often the sweep runs. Defaults to daily.
    pub sweep_interval_ms: u64,

    /// Recipients per delivery chunk.
    pub batch_size: usize,

    /// Delay between chunks.
    pub batch_delay_ms: u64,

    /// Registrations younger than this are skipped. Defaults to one day, so
    /// same-day registrations are never reminded.
    pub cutoff_ms: u64,
}

impl Default for ReminderConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 86_400_000,
            batch_size: 100,
            batch_delay_ms: 60_000,
            cutoff_ms: 86_400_000,
        }
    }
}

/// Totals from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Tickets that produced at least one reminder.
    pub tickets_swept: usize,
    pub sent: u64,
    pub failed: u64,
}

/// Periodic job dispatching reminder messages on the campaign delivery
/// machinery.
pub struct ReminderSweep<S, M> {
    storage: Arc<S>,
    mailer: Arc<M>,
    config: ReminderConfig,
    shutdown: CancellationToken,
}

impl<S, M> ReminderSweep<S, M>
where
    S: Storage + FileStore + 'static,
    M: Mailer + 'static,
{
    pub fn new(
        storage: Arc<S>,
        mailer: Arc<M>,
        config: ReminderConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            storage,
            mailer,
            config,
            shutdown,
        }
    }

    /// Run the sweep on its fixed schedule until shutdown.
    #[tracing::instrument(skip(self))]
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.sweep_interval_ms));
        tracing::info!(
            interval_ms = self.config.sweep_interval_ms,
            "Reminder sweep started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(stats) => {
                            tracing::info!(
                                tickets_swept = stats.tickets_swept,
                                sent = stats.sent,
                                failed = stats.failed,
                                "Reminder sweep pass finished"
                            );
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Reminder sweep pass failed");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Shutting down reminder sweep");
                    break;
                }
            }
        }
    }

    /// One pass over every reminder-enabled ticket.
    pub async fn sweep_once(&self) -> Result<SweepStats> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.cutoff_ms as i64);
        let tickets = self.storage.reminder_tickets().await?;
        let mut stats = SweepStats::default();

        for ticket in tickets {
            if ticket.event_ends_at <= Utc::now() {
                tracing::debug!(ticket_id = %ticket.ticket_id, "Event already ended, skipping");
                continue;
            }

            let Some(template) = self
                .storage
                .reminder_template(ticket.ticket_id, Channel::Email)
                .await?
            else {
                tracing::debug!(
                    ticket_id = %ticket.ticket_id,
                    "No reminder template configured, skipping"
                );
                continue;
            };

            let registrations = self
                .storage
                .unchecked_registrations(ticket.ticket_id, cutoff)
                .await?;
            if registrations.is_empty() {
                continue;
            }

            let recipients: Vec<ContactRecord> =
                registrations.iter().map(registration_contact).collect();
            let attachments = load_attachments(self.storage.as_ref(), &template).await;

            let mut base = Map::new();
            base.insert(
                "eventName".to_string(),
                Value::String(ticket.event_name.clone()),
            );
            base.insert(
                "ticketName".to_string(),
                Value::String(ticket.ticket_name.clone()),
            );

            let mut ticket_sent = 0u64;
            let mut ticket_failed = 0u64;
            for (index, chunk) in recipients.chunks(self.config.batch_size).enumerate() {
                if index > 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)) => {}
                        _ = self.shutdown.cancelled() => {
                            tracing::info!("Reminder sweep interrupted by shutdown");
                            return Ok(stats);
                        }
                    }
                }
                let outcome =
                    deliver_slice(self.mailer.as_ref(), &template, &attachments, chunk, &base)
                        .await;
                ticket_sent += outcome.sent;
                ticket_failed += outcome.failed;
            }

            tracing::info!(
                ticket_id = %ticket.ticket_id,
                sent = ticket_sent,
                failed = ticket_failed,
                "Reminders dispatched for ticket"
            );
            stats.tickets_swept += 1;
            stats.sent += ticket_sent;
            stats.failed += ticket_failed;
        }

        Ok(stats)
    }
}

fn registration_contact(registration: &Registration) -> ContactRecord {
    ContactRecord {
        email: registration.email.clone(),
        name: registration.name.clone(),
        contact: registration.contact.clone(),
        extra: Vec::new(),
    }
}
