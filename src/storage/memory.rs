//! In-memory storage, for tests and single-process development use.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::domain::campaign::{
    AnyCampaign, Campaign, CampaignData, CampaignId, CampaignProgress, CampaignStatus, Completed,
    Failed, Pending, Processing,
};
use crate::domain::reminder::{Registration, TicketId, TicketReminder};
use crate::domain::template::{Channel, MessageTemplate, TemplateId};
use crate::error::{BroadsideError, Result};
use crate::storage::{FileStore, Storage};

#[derive(Debug, Clone)]
struct CampaignRow {
    data: CampaignData,
    status: CampaignStatus,
    progress: CampaignProgress,
    error: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl CampaignRow {
    fn to_any(&self) -> AnyCampaign {
        let data = self.data.clone();
        let progress = self.progress;
        match self.status {
            CampaignStatus::Pending => AnyCampaign::Pending(Campaign {
                state: Pending,
                data,
            }),
            CampaignStatus::Processing => AnyCampaign::Processing(Campaign {
                state: Processing {
                    started_at: self.started_at.unwrap_or(self.data.created_at),
                    progress,
                },
                data,
            }),
            CampaignStatus::Completed => AnyCampaign::Completed(Campaign {
                state: Completed {
                    finished_at: self.finished_at.unwrap_or(self.data.created_at),
                    progress,
                },
                data,
            }),
            CampaignStatus::Failed => AnyCampaign::Failed(Campaign {
                state: Failed {
                    failed_at: self.finished_at.unwrap_or(self.data.created_at),
                    error: self.error.clone(),
                    progress,
                },
                data,
            }),
        }
    }
}

/// Mutex-guarded maps standing in for the document store.
///
/// Counter updates happen in place under the lock, so progress reads never
/// observe a half-applied batch.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: Mutex<HashMap<CampaignId, CampaignRow>>,
    templates: Mutex<HashMap<TemplateId, MessageTemplate>>,
    tickets: Mutex<Vec<TicketReminder>>,
    registrations: Mutex<HashMap<TicketId, Vec<Registration>>>,
    reminder_templates: Mutex<HashMap<(TicketId, Channel), MessageTemplate>>,
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a template.
    pub fn insert_template(&self, template: MessageTemplate) {
        self.templates.lock().insert(template.id, template);
    }

    /// Seed an uploaded file.
    pub fn insert_file(&self, path: &str, bytes: Vec<u8>) {
        self.files.lock().insert(path.to_string(), bytes);
    }

    /// Seed a ticket for the reminder sweep.
    pub fn insert_ticket(&self, ticket: TicketReminder) {
        self.tickets.lock().push(ticket);
    }

    /// Seed a registration under a ticket.
    pub fn insert_registration(&self, ticket_id: TicketId, registration: Registration) {
        self.registrations
            .lock()
            .entry(ticket_id)
            .or_default()
            .push(registration);
    }

    /// Seed a reminder notification template for a ticket/channel pair.
    pub fn insert_reminder_template(
        &self,
        ticket_id: TicketId,
        channel: Channel,
        template: MessageTemplate,
    ) {
        self.reminder_templates
            .lock()
            .insert((ticket_id, channel), template);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn create_campaign(&self, data: CampaignData) -> Result<Campaign<Pending>> {
        let row = CampaignRow {
            data: data.clone(),
            status: CampaignStatus::Pending,
            progress: CampaignProgress::default(),
            error: None,
            started_at: None,
            finished_at: None,
        };
        self.campaigns.lock().insert(data.id, row);
        Ok(Campaign {
            state: Pending,
            data,
        })
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<AnyCampaign> {
        self.campaigns
            .lock()
            .get(&id)
            .map(CampaignRow::to_any)
            .ok_or(BroadsideError::CampaignNotFound(id))
    }

    async fn begin_processing(&self, id: CampaignId) -> Result<bool> {
        let mut campaigns = self.campaigns.lock();
        let row = campaigns
            .get_mut(&id)
            .ok_or(BroadsideError::CampaignNotFound(id))?;
        if row.status != CampaignStatus::Pending {
            return Ok(false);
        }
        row.status = CampaignStatus::Processing;
        row.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn record_batch_progress(
        &self,
        id: CampaignId,
        sent_delta: u64,
        failed_delta: u64,
        current_batch: u32,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut campaigns = self.campaigns.lock();
        let row = campaigns
            .get_mut(&id)
            .ok_or(BroadsideError::CampaignNotFound(id))?;
        row.progress.sent_count += sent_delta;
        row.progress.failed_count += failed_delta;
        row.progress.current_batch = current_batch;
        if last_error.is_some() {
            row.error = last_error;
        }
        Ok(())
    }

    async fn finish_campaign(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut campaigns = self.campaigns.lock();
        let row = campaigns
            .get_mut(&id)
            .ok_or(BroadsideError::CampaignNotFound(id))?;
        if row.status != CampaignStatus::Processing {
            tracing::warn!(
                campaign_id = %id,
                status = %row.status,
                "Ignoring terminal transition for a campaign that is not processing"
            );
            return Ok(());
        }
        row.status = status;
        row.finished_at = Some(Utc::now());
        if error.is_some() {
            row.error = error;
        }
        Ok(())
    }

    async fn pending_scheduled_campaigns(&self) -> Result<Vec<Campaign<Pending>>> {
        let campaigns = self.campaigns.lock();
        Ok(campaigns
            .values()
            .filter(|row| {
                row.status == CampaignStatus::Pending
                    && row.data.scheduled
                    && row.data.scheduled_at.is_some()
            })
            .map(|row| Campaign {
                state: Pending,
                data: row.data.clone(),
            })
            .collect())
    }

    async fn get_template(&self, id: TemplateId) -> Result<MessageTemplate> {
        self.templates
            .lock()
            .get(&id)
            .cloned()
            .ok_or(BroadsideError::TemplateNotFound(id))
    }

    async fn reminder_tickets(&self) -> Result<Vec<TicketReminder>> {
        Ok(self
            .tickets
            .lock()
            .iter()
            .filter(|ticket| ticket.reminders_enabled)
            .cloned()
            .collect())
    }

    async fn unchecked_registrations(
        &self,
        ticket_id: TicketId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Registration>> {
        let registrations = self.registrations.lock();
        let mut targets: Vec<Registration> = registrations
            .get(&ticket_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.is_reminder_target(cutoff))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        targets.sort_by_key(|r| r.created_at);
        Ok(targets)
    }

    async fn reminder_template(
        &self,
        ticket_id: TicketId,
        channel: Channel,
    ) -> Result<Option<MessageTemplate>> {
        Ok(self
            .reminder_templates
            .lock()
            .get(&(ticket_id, channel))
            .cloned())
    }
}

#[async_trait]
impl FileStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| BroadsideError::FileNotFound(path.to_string()))
    }
}
