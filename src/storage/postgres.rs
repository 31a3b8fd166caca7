//! PostgreSQL implementation of Storage and FileStore.
//!
//! Campaign counters are incremented in SQL (`sent_count = sent_count + $n`)
//! and the pending → processing edge is an `UPDATE ... WHERE status =
//! 'pending'`, so concurrent progress queries and racing starters both see
//! consistent state. Uploaded files live on disk under a configured root and
//! are resolved by stored relative path.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use crate::domain::campaign::{
    AnyCampaign, Campaign, CampaignData, CampaignId, CampaignProgress, CampaignStatus, Completed,
    Failed, Pending, Processing,
};
use crate::domain::reminder::{Registration, TicketId, TicketReminder};
use crate::domain::template::{AttachmentRef, Channel, MessageTemplate, TemplateId};
use crate::error::{BroadsideError, Result};
use crate::storage::{FileStore, Storage};

/// PostgreSQL-backed store.
///
/// # Example
/// ```ignore
/// let pool = PgPool::connect("postgresql://localhost/broadside").await?;
/// broadside::migrator().run(&pool).await?;
/// let store = PostgresStore::new(pool, "/var/lib/broadside/uploads".into());
/// ```
pub struct PostgresStore {
    pool: PgPool,
    files_root: PathBuf,
}

impl PostgresStore {
    pub fn new(pool: PgPool, files_root: PathBuf) -> Self {
        Self { pool, files_root }
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const CAMPAIGN_COLUMNS: &str = "id, name, event_name, template_id, contact_file, total_contacts, \
     scheduled, scheduled_at, batch_size, batch_interval_mins, status, sent_count, failed_count, \
     current_batch, error, created_at, started_at, finished_at";

fn campaign_from_row(row: &PgRow) -> Result<AnyCampaign> {
    let data = CampaignData {
        id: CampaignId(row.try_get::<Uuid, _>("id").map_err(sql_err)?),
        name: row.try_get("name").map_err(sql_err)?,
        event_name: row.try_get("event_name").map_err(sql_err)?,
        template_id: TemplateId(row.try_get::<Uuid, _>("template_id").map_err(sql_err)?),
        contact_file: row.try_get("contact_file").map_err(sql_err)?,
        total_contacts: row.try_get::<i32, _>("total_contacts").map_err(sql_err)? as u32,
        scheduled: row.try_get("scheduled").map_err(sql_err)?,
        scheduled_at: row.try_get("scheduled_at").map_err(sql_err)?,
        batch_size: row.try_get::<i32, _>("batch_size").map_err(sql_err)? as u32,
        batch_interval_mins: row.try_get::<i32, _>("batch_interval_mins").map_err(sql_err)? as u32,
        created_at: row.try_get("created_at").map_err(sql_err)?,
    };

    let progress = CampaignProgress {
        sent_count: row.try_get::<i64, _>("sent_count").map_err(sql_err)? as u64,
        failed_count: row.try_get::<i64, _>("failed_count").map_err(sql_err)? as u64,
        current_batch: row.try_get::<i32, _>("current_batch").map_err(sql_err)? as u32,
    };

    let status: String = row.try_get("status").map_err(sql_err)?;
    let status = CampaignStatus::from_str(&status).map_err(BroadsideError::Validation)?;
    let started_at: Option<DateTime<Utc>> = row.try_get("started_at").map_err(sql_err)?;
    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at").map_err(sql_err)?;

    Ok(match status {
        CampaignStatus::Pending => AnyCampaign::Pending(Campaign {
            state: Pending,
            data,
        }),
        CampaignStatus::Processing => AnyCampaign::Processing(Campaign {
            state: Processing {
                started_at: started_at.unwrap_or(data.created_at),
                progress,
            },
            data,
        }),
        CampaignStatus::Completed => AnyCampaign::Completed(Campaign {
            state: Completed {
                finished_at: finished_at.unwrap_or(data.created_at),
                progress,
            },
            data,
        }),
        CampaignStatus::Failed => AnyCampaign::Failed(Campaign {
            state: Failed {
                failed_at: finished_at.unwrap_or(data.created_at),
                error: row.try_get("error").map_err(sql_err)?,
                progress,
            },
            data,
        }),
    })
}

fn template_from_row(row: &PgRow) -> Result<MessageTemplate> {
    let channel: String = row.try_get("channel").map_err(sql_err)?;
    let attachments: serde_json::Value = row.try_get("attachments").map_err(sql_err)?;
    Ok(MessageTemplate {
        id: TemplateId(row.try_get::<Uuid, _>("id").map_err(sql_err)?),
        name: row.try_get("name").map_err(sql_err)?,
        channel: Channel::from_str(&channel).map_err(BroadsideError::Validation)?,
        subject: row.try_get("subject").map_err(sql_err)?,
        body: row.try_get("body").map_err(sql_err)?,
        attachments: serde_json::from_value::<Vec<AttachmentRef>>(attachments)?,
        created_at: row.try_get("created_at").map_err(sql_err)?,
        updated_at: row.try_get("updated_at").map_err(sql_err)?,
    })
}

fn sql_err(e: sqlx::Error) -> BroadsideError {
    BroadsideError::Other(anyhow!("Database error: {}", e))
}

#[async_trait]
impl Storage for PostgresStore {
    async fn create_campaign(&self, data: CampaignData) -> Result<Campaign<Pending>> {
        sqlx::query(
            "INSERT INTO campaigns (id, name, event_name, template_id, contact_file, \
             total_contacts, scheduled, scheduled_at, batch_size, batch_interval_mins, status, \
             created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11)",
        )
        .bind(*data.id)
        .bind(&data.name)
        .bind(&data.event_name)
        .bind(*data.template_id)
        .bind(&data.contact_file)
        .bind(data.total_contacts as i32)
        .bind(data.scheduled)
        .bind(data.scheduled_at)
        .bind(data.batch_size as i32)
        .bind(data.batch_interval_mins as i32)
        .bind(data.created_at)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(Campaign {
            state: Pending,
            data,
        })
    }

    async fn get_campaign(&self, id: CampaignId) -> Result<AnyCampaign> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM campaigns WHERE id = $1",
            CAMPAIGN_COLUMNS
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        .ok_or(BroadsideError::CampaignNotFound(id))?;

        campaign_from_row(&row)
    }

    async fn begin_processing(&self, id: CampaignId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = 'processing', started_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(*id)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_batch_progress(
        &self,
        id: CampaignId,
        sent_delta: u64,
        failed_delta: u64,
        current_batch: u32,
        last_error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET \
                 sent_count = sent_count + $2, \
                 failed_count = failed_count + $3, \
                 current_batch = $4, \
                 error = COALESCE($5, error) \
             WHERE id = $1",
        )
        .bind(*id)
        .bind(sent_delta as i64)
        .bind(failed_delta as i64)
        .bind(current_batch as i32)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        if result.rows_affected() == 0 {
            return Err(BroadsideError::CampaignNotFound(id));
        }
        Ok(())
    }

    async fn finish_campaign(
        &self,
        id: CampaignId,
        status: CampaignStatus,
        error: Option<String>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET status = $2, finished_at = NOW(), error = COALESCE($3, error) \
             WHERE id = $1 AND status = 'processing'",
        )
        .bind(*id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                campaign_id = %id,
                "Ignoring terminal transition for a campaign that is not processing"
            );
        }
        Ok(())
    }

    async fn pending_scheduled_campaigns(&self) -> Result<Vec<Campaign<Pending>>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM campaigns \
             WHERE status = 'pending' AND scheduled AND scheduled_at IS NOT NULL \
             ORDER BY scheduled_at",
            CAMPAIGN_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter()
            .map(|row| {
                campaign_from_row(row).and_then(|c| {
                    c.into_pending().ok_or_else(|| {
                        BroadsideError::Other(anyhow!("Pending query returned non-pending row"))
                    })
                })
            })
            .collect()
    }

    async fn get_template(&self, id: TemplateId) -> Result<MessageTemplate> {
        let row = sqlx::query(
            "SELECT id, name, channel, subject, body, attachments, created_at, updated_at \
             FROM templates WHERE id = $1",
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?
        .ok_or(BroadsideError::TemplateNotFound(id))?;

        template_from_row(&row)
    }

    async fn reminder_tickets(&self) -> Result<Vec<TicketReminder>> {
        let rows = sqlx::query(
            "SELECT id, name, event_name, event_ends_at, reminders_enabled \
             FROM tickets WHERE reminders_enabled",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter()
            .map(|row| {
                Ok(TicketReminder {
                    ticket_id: TicketId(row.try_get::<Uuid, _>("id").map_err(sql_err)?),
                    ticket_name: row.try_get("name").map_err(sql_err)?,
                    event_name: row.try_get("event_name").map_err(sql_err)?,
                    event_ends_at: row.try_get("event_ends_at").map_err(sql_err)?,
                    reminders_enabled: row.try_get("reminders_enabled").map_err(sql_err)?,
                })
            })
            .collect()
    }

    async fn unchecked_registrations(
        &self,
        ticket_id: TicketId,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Registration>> {
        let rows = sqlx::query(
            "SELECT email, name, contact, approved, checked_in_at, created_at \
             FROM registrations \
             WHERE ticket_id = $1 AND approved AND checked_in_at IS NULL AND created_at < $2 \
             ORDER BY created_at",
        )
        .bind(*ticket_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(sql_err)?;

        rows.iter()
            .map(|row| {
                Ok(Registration {
                    email: row.try_get("email").map_err(sql_err)?,
                    name: row.try_get("name").map_err(sql_err)?,
                    contact: row.try_get("contact").map_err(sql_err)?,
                    approved: row.try_get("approved").map_err(sql_err)?,
                    checked_in_at: row.try_get("checked_in_at").map_err(sql_err)?,
                    created_at: row.try_get("created_at").map_err(sql_err)?,
                })
            })
            .collect()
    }

    async fn reminder_template(
        &self,
        ticket_id: TicketId,
        channel: Channel,
    ) -> Result<Option<MessageTemplate>> {
        let row = sqlx::query(
            "SELECT id, name, channel, subject, body, attachments, created_at, updated_at \
             FROM templates \
             WHERE ticket_id = $1 AND action = 'reminder' AND channel = $2 \
             LIMIT 1",
        )
        .bind(*ticket_id)
        .bind(channel.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sql_err)?;

        row.as_ref().map(template_from_row).transpose()
    }
}

#[async_trait]
impl FileStore for PostgresStore {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.files_root.join(path))
            .await
            .map_err(|_| BroadsideError::FileNotFound(path.to_string()))
    }
}
