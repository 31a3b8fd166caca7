//! Storage traits for the dispatch engine.
//!
//! This module defines the `Storage` and `FileStore` traits, which provide
//! the interface for persisting campaigns, reading templates, resolving
//! uploaded files, and querying reminder targets. The wider CRUD backend owns
//! the full entity schemas; the dispatcher only touches the slices below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::campaign::{
    AnyCampaign, Campaign, CampaignData, CampaignId, CampaignStatus, Pending,
};
use crate::domain::reminder::{Registration, TicketId, TicketReminder};
use crate::domain::template::{Channel, MessageTemplate, TemplateId};
use crate::error::Result;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Storage trait for campaigns, templates, and reminder targets.
///
/// Progress counters must be incremented atomically relative to concurrent
/// campaign reads: implementations use in-place increments, never
/// read-modify-write.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist a new campaign in the `pending` state.
    async fn create_campaign(&self, data: CampaignData) -> Result<Campaign<Pending>>;

    /// Load a campaign in whatever state it is in.
    async fn get_campaign(&self, id: CampaignId) -> Result<AnyCampaign>;

    /// Compare-and-swap the pending → processing edge.
    ///
    /// Returns `false` if the campaign was not `pending` — the caller lost
    /// the start race (or the campaign already finished) and must not run.
    async fn begin_processing(&self, id: CampaignId) -> Result<bool>;

    /// Record one batch's outcome: increment the sent/failed counters, set
    /// the next batch index, and retain the most recent error message.
    async fn record_batch_progress(
        &self,
        id: CampaignId,
        sent_delta: u64,
        failed_delta: u64,
        current_batch: u32,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Move a `processing` campaign to a terminal state. A campaign that is
    /// not `processing` is left untouched (transitions are forward-only).
    async fn finish_campaign(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        error: Option<String>,
    ) -> Result<()>;

    /// All campaigns with a schedule that have not started: `scheduled`,
    /// `scheduled_at` set, `status = pending`. Past-due entries are included
    /// so a restart can fire them immediately.
    async fn pending_scheduled_campaigns(&self) -> Result<Vec<Campaign<Pending>>>;

    /// Load a message template.
    async fn get_template(&self, id: TemplateId) -> Result<MessageTemplate>;

    /// Tickets with reminder notifications enabled.
    async fn reminder_tickets(&self) -> Result<Vec<TicketReminder>>;

    /// Approved registrations without a check-in timestamp, created before
    /// the cutoff, in creation order.
    async fn unchecked_registrations(
        &self,
        ticket_id: TicketId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Registration>>;

    /// Notification template keyed by (ticket, action "reminder", channel).
    async fn reminder_template(
        &self,
        ticket_id: TicketId,
        channel: Channel,
    ) -> Result<Option<MessageTemplate>>;
}

/// Resolves stored relative paths to file bytes, for both contact
/// spreadsheets and attachment files.
#[async_trait]
pub trait FileStore: Send + Sync {
    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}
