//! Campaign scheduling and batched delivery.
//!
//! The dispatcher owns the whole campaign lifecycle: creation with contact
//! validation, one-shot schedule timers, schedule restoration at startup, and
//! the cooperative batch loop. Each batch is one unit of work; between
//! batches control returns to the runtime via a deferred timer, so the
//! process stays responsive during the inter-batch delay.
//!
//! Timers live in an owned registry on the dispatcher instance (no ambient
//! module state), keyed by campaign id; every deferred task also selects on
//! the shutdown token.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use serde_json::{Map, Value};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::contacts::{self, ContactRecord};
use crate::delivery::{deliver_slice, load_attachments};
use crate::domain::campaign::{
    AnyCampaign, BatchPlan, Campaign, CampaignData, CampaignId, CampaignStatus, NewCampaign,
    Pending,
};
use crate::error::{BroadsideError, Result};
use crate::mailer::Mailer;
use crate::storage::{FileStore, Storage};

/// Configuration for the dispatcher.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DispatcherConfig {
    /// Batch size applied when a campaign does not specify one.
    pub default_batch_size: u32,

    /// Inter-batch delay in minutes applied when a campaign does not specify
    /// one.
    pub default_batch_interval_mins: u32,

    /// Length of one interval "minute" in milliseconds. Production leaves
    /// this at 60_000; tests shrink it so multi-batch runs finish quickly.
    pub batch_interval_unit_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 100,
            default_batch_interval_mins: 1,
            batch_interval_unit_ms: 60_000,
        }
    }
}

/// Dispatcher for bulk campaigns.
///
/// A cheap handle around shared state: clones share the timer registry and
/// shutdown token, so the dispatcher can hand copies of itself to its own
/// deferred tasks. Generic over storage and mailer so tests run against
/// `MemoryStore` and `MockMailer` with no external services.
pub struct Dispatcher<S, M> {
    inner: Arc<Inner<S, M>>,
}

struct Inner<S, M> {
    storage: Arc<S>,
    mailer: Arc<M>,
    config: DispatcherConfig,
    /// Active one-shot timers (schedule timers and batch continuations),
    /// keyed by campaign id.
    timers: DashMap<CampaignId, AbortHandle>,
    shutdown: CancellationToken,
}

impl<S, M> Clone for Dispatcher<S, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S, M> Dispatcher<S, M>
where
    S: Storage + FileStore + 'static,
    M: Mailer + 'static,
{
    /// Create a new dispatcher.
    pub fn new(
        storage: Arc<S>,
        mailer: Arc<M>,
        config: DispatcherConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                storage,
                mailer,
                config,
                timers: DashMap::new(),
                shutdown,
            }),
        }
    }

    /// Get a reference to the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.inner.storage
    }

    /// Create a campaign from an uploaded contact file.
    ///
    /// Validates that the file yields at least one contact, persists the
    /// campaign, and either begins batch 0 immediately (`scheduled = false`)
    /// or arms a one-shot timer for `scheduled_at`.
    ///
    /// # Errors
    /// Returns a `Validation` error for an empty contact list, a zero batch
    /// size, or a scheduled campaign without a schedule time. Runtime
    /// delivery errors are not surfaced here; they land in the campaign's
    /// counters and status.
    pub async fn create_campaign(&self, input: NewCampaign) -> Result<AnyCampaign> {
        let batch_size = input
            .batch_size
            .unwrap_or(self.inner.config.default_batch_size);
        if batch_size == 0 {
            return Err(BroadsideError::Validation(
                "batch size must be at least 1".to_string(),
            ));
        }
        if input.scheduled && input.scheduled_at.is_none() {
            return Err(BroadsideError::Validation(
                "scheduled campaign requires a schedule time".to_string(),
            ));
        }

        let bytes = self.inner.storage.read(&input.contact_file).await?;
        let contact_list = contacts::read(&bytes)?;
        if contact_list.is_empty() {
            return Err(BroadsideError::Validation(
                "contact file must contain at least one contact".to_string(),
            ));
        }

        let data = CampaignData {
            id: CampaignId::from(Uuid::new_v4()),
            name: input.name,
            event_name: input.event_name,
            template_id: input.template_id,
            contact_file: input.contact_file,
            total_contacts: contact_list.len() as u32,
            scheduled: input.scheduled,
            scheduled_at: input.scheduled_at,
            batch_size,
            batch_interval_mins: input
                .batch_interval_mins
                .unwrap_or(self.inner.config.default_batch_interval_mins),
            created_at: Utc::now(),
        };

        let campaign = self.inner.storage.create_campaign(data).await?;
        let id = campaign.data.id;
        tracing::info!(
            campaign_id = %id,
            total_contacts = campaign.data.total_contacts,
            total_batches = campaign.data.total_batches(),
            scheduled = campaign.data.scheduled,
            "Campaign created"
        );

        if campaign.data.scheduled {
            self.schedule(&campaign);
            Ok(AnyCampaign::Pending(campaign))
        } else {
            // Immediate send: batch 0 runs before creation returns.
            self.execute(id).await?;
            self.inner.storage.get_campaign(id).await
        }
    }

    /// Force immediate execution of batch 0, regardless of scheduling
    /// configuration. Any armed timer for the campaign is dropped first.
    pub async fn send_now(&self, id: CampaignId) -> Result<()> {
        if let Some((_, timer)) = self.inner.timers.remove(&id) {
            timer.abort();
        }
        self.execute(id).await
    }

    /// Re-arm timers for scheduled campaigns that are still pending.
    ///
    /// Called once at process startup; this is how in-flight schedules
    /// survive a restart. Past-due schedules fire on the next tick.
    /// Campaigns that were mid-`processing` when the process stopped are not
    /// resumed.
    pub async fn restore_pending(&self) -> Result<usize> {
        let campaigns = self.inner.storage.pending_scheduled_campaigns().await?;
        let count = campaigns.len();
        for campaign in &campaigns {
            self.schedule(campaign);
        }
        tracing::info!(count, "Restored pending campaign schedules");
        Ok(count)
    }

    /// Arm a one-shot timer firing at the campaign's schedule time (now, if
    /// past due) that begins batch 0. Re-scheduling replaces any previous
    /// timer for the same campaign.
    pub fn schedule(&self, campaign: &Campaign<Pending>) {
        let id = campaign.data.id;
        let Some(scheduled_at) = campaign.data.scheduled_at else {
            tracing::warn!(campaign_id = %id, "Campaign has no schedule time, not arming a timer");
            return;
        };

        let delay = (scheduled_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let dispatcher = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = dispatcher.execute(id).await {
                        tracing::error!(campaign_id = %id, error = %e, "Scheduled campaign failed to start");
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!(campaign_id = %id, "Schedule timer cancelled by shutdown");
                }
            }
        });

        if let Some(previous) = self.inner.timers.insert(id, handle.abort_handle()) {
            previous.abort();
        }
        tracing::info!(campaign_id = %id, scheduled_at = %scheduled_at, "Campaign schedule armed");
    }

    /// Abort every armed timer. The shutdown token stops timers that already
    /// fired; this drops the ones still waiting.
    pub fn abort_timers(&self) {
        for entry in self.inner.timers.iter() {
            entry.value().abort();
        }
        self.inner.timers.clear();
    }

    /// Begin a campaign run at batch 0.
    ///
    /// The pending → processing edge is compare-and-swapped in storage, so a
    /// campaign that is both restored from a schedule and sent immediately
    /// only ever starts one run; the loser of the race is a logged no-op.
    ///
    /// Failures loading the campaign, template, or contact file here are
    /// fatal for the whole campaign: status goes to `failed` and no batches
    /// run.
    #[tracing::instrument(skip_all, fields(campaign_id = %id))]
    pub async fn execute(&self, id: CampaignId) -> Result<()> {
        let campaign = self.inner.storage.get_campaign(id).await?;
        let pending = match campaign {
            AnyCampaign::Pending(c) => c,
            other => {
                tracing::debug!(
                    campaign_id = %id,
                    status = %other.status(),
                    "Campaign is not pending, skipping run"
                );
                return Ok(());
            }
        };

        let processing = match pending.begin(self.inner.storage.as_ref()).await {
            Ok(p) => p,
            Err(BroadsideError::InvalidState(..)) => {
                tracing::debug!(campaign_id = %id, "Lost the start race, another run owns this campaign");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        tracing::info!(campaign_id = %id, "Campaign processing started");

        // Contacts are loaded once per run and sliced per batch. The
        // template, by contrast, is re-read at the start of every batch.
        let contact_list = match self.load_contacts(&processing.data.contact_file).await {
            Ok(list) => list,
            Err(e) => {
                self.fail_campaign(id, format!("contact file could not be loaded: {}", e))
                    .await;
                return Ok(());
            }
        };

        let plan = BatchPlan::new(contact_list.len() as u32, processing.data.batch_size);
        self.run_batch(id, Arc::new(contact_list), plan, 0, 0).await;
        Ok(())
    }

    async fn load_contacts(&self, path: &str) -> Result<Vec<ContactRecord>> {
        let bytes = self.inner.storage.read(path).await?;
        let contact_list = contacts::read(&bytes)?;
        if contact_list.is_empty() {
            return Err(BroadsideError::Validation(
                "contact file contains no contacts".to_string(),
            ));
        }
        Ok(contact_list)
    }

    /// Process one batch slice, persist progress, then either arm the
    /// continuation timer or finish the campaign.
    #[tracing::instrument(skip_all, fields(campaign_id = %id, batch_index = batch_index))]
    async fn run_batch(
        &self,
        id: CampaignId,
        contact_list: Arc<Vec<ContactRecord>>,
        plan: BatchPlan,
        batch_index: u32,
        failed_so_far: u64,
    ) {
        let campaign = match self.inner.storage.get_campaign(id).await {
            Ok(c) => c,
            Err(e) => {
                self.fail_campaign(id, format!("campaign could not be loaded: {}", e))
                    .await;
                return;
            }
        };

        let template = match self
            .inner
            .storage
            .get_template(campaign.data().template_id)
            .await
        {
            Ok(t) => t,
            Err(e) => {
                self.fail_campaign(id, format!("template could not be loaded: {}", e))
                    .await;
                return;
            }
        };
        let attachments = load_attachments(self.inner.storage.as_ref(), &template).await;

        let mut base = Map::new();
        base.insert(
            "eventName".to_string(),
            Value::String(campaign.data().event_name.clone()),
        );
        base.insert(
            "campaignName".to_string(),
            Value::String(campaign.data().name.clone()),
        );

        let (start, end) = plan.bounds(batch_index);
        let slice = &contact_list[start..end];
        let outcome =
            deliver_slice(self.inner.mailer.as_ref(), &template, &attachments, slice, &base).await;
        tracing::info!(
            campaign_id = %id,
            batch_index,
            sent = outcome.sent,
            failed = outcome.failed,
            "Batch delivered"
        );

        if let Err(e) = self
            .inner
            .storage
            .record_batch_progress(
                id,
                outcome.sent,
                outcome.failed,
                batch_index + 1,
                outcome.last_error,
            )
            .await
        {
            self.fail_campaign(id, format!("progress could not be persisted: {}", e))
                .await;
            return;
        }

        let failed_total = failed_so_far + outcome.failed;
        if plan.is_last(batch_index) {
            let status = if failed_total == 0 {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Failed
            };
            if let Err(e) = self.inner.storage.finish_campaign(id, status, None).await {
                tracing::error!(campaign_id = %id, error = %e, "Terminal status could not be recorded");
            }
            counter!("broadside_campaigns_finished_total", "status" => status.as_str())
                .increment(1);
            self.inner.timers.remove(&id);
            tracing::info!(campaign_id = %id, status = %status, failed_total, "Campaign finished");
        } else {
            let delay = Duration::from_millis(
                u64::from(campaign.data().batch_interval_mins)
                    * self.inner.config.batch_interval_unit_ms,
            );
            self.spawn_continuation(id, contact_list, plan, batch_index + 1, failed_total, delay);
        }
    }

    /// Arm the deferred continuation for the next batch. The calling context
    /// is not held open across the delay.
    fn spawn_continuation(
        &self,
        id: CampaignId,
        contact_list: Arc<Vec<ContactRecord>>,
        plan: BatchPlan,
        next_index: u32,
        failed_so_far: u64,
        delay: Duration,
    ) {
        let dispatcher = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    run_batch_boxed(dispatcher, id, contact_list, plan, next_index, failed_so_far)
                        .await;
                }
                _ = shutdown.cancelled() => {
                    tracing::debug!(campaign_id = %id, "Batch continuation cancelled by shutdown");
                }
            }
        });
        self.inner.timers.insert(id, handle.abort_handle());
        tracing::debug!(campaign_id = %id, next_index, delay_ms = delay.as_millis() as u64, "Next batch armed");
    }

    /// Terminate a campaign after an unrecoverable error.
    async fn fail_campaign(&self, id: CampaignId, message: String) {
        tracing::error!(campaign_id = %id, error = %message, "Campaign failed");
        if let Err(e) = self
            .inner
            .storage
            .finish_campaign(id, CampaignStatus::Failed, Some(message))
            .await
        {
            tracing::error!(campaign_id = %id, error = %e, "Failure status could not be recorded");
        }
        counter!("broadside_campaigns_finished_total", "status" => "failed").increment(1);
        self.inner.timers.remove(&id);
    }
}

// Boxed so a deferred continuation can re-enter run_batch without a
// recursive future type.
fn run_batch_boxed<S, M>(
    dispatcher: Dispatcher<S, M>,
    id: CampaignId,
    contact_list: Arc<Vec<ContactRecord>>,
    plan: BatchPlan,
    batch_index: u32,
    failed_so_far: u64,
) -> Pin<Box<dyn Future<Output = ()> + Send>>
where
    S: Storage + FileStore + 'static,
    M: Mailer + 'static,
{
    Box::pin(async move {
        dispatcher
            .run_batch(id, contact_list, plan, batch_index, failed_so_far)
            .await;
    })
}
