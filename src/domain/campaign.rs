//! Campaign types and the campaign lifecycle using the typestate pattern.
//!
//! A campaign progresses through distinct states, enforced at compile time:
//!
//! ```text
//! Campaign<Pending> ──begin()──> Campaign<Processing> ──complete()──> Campaign<Completed>
//!                                        │
//!                                        └──────fail()──────> Campaign<Failed>
//! ```
//!
//! `Completed` and `Failed` are terminal. The pending → processing edge is a
//! compare-and-swap in storage, so a campaign that is both restored from a
//! schedule and sent immediately only ever starts one run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::template::TemplateId;

/// Unique identifier for a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub Uuid);

impl From<Uuid> for CampaignId {
    fn from(uuid: Uuid) -> Self {
        CampaignId(uuid)
    }
}

impl std::ops::Deref for CampaignId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for CampaignId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Marker trait for valid campaign states.
pub trait CampaignState: Send + Sync {}

/// A configured bulk-send job over a contact list and a template.
///
/// The generic parameter `T` represents the current state of the campaign.
#[derive(Debug, Clone, Serialize)]
pub struct Campaign<T: CampaignState> {
    /// The current state of the campaign.
    pub state: T,
    /// The campaign configuration.
    pub data: CampaignData,
}

/// Campaign configuration, written at creation time.
///
/// Progress counters live in the state types; configuration fields are only
/// mutated by the owning CRUD path before processing starts.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignData {
    pub id: CampaignId,
    pub name: String,
    /// Denormalized event name, merged into every rendering context.
    pub event_name: String,
    pub template_id: TemplateId,
    /// Stored relative path of the uploaded contact file.
    pub contact_file: String,
    /// Counted once at creation, after dropping rows without an email.
    pub total_contacts: u32,
    pub scheduled: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub batch_size: u32,
    pub batch_interval_mins: u32,
    pub created_at: DateTime<Utc>,
}

impl CampaignData {
    /// Number of batches this campaign's contact list splits into.
    pub fn total_batches(&self) -> u32 {
        BatchPlan::new(self.total_contacts, self.batch_size).total_batches
    }
}

/// Input for creating a new campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub event_name: String,
    pub template_id: TemplateId,
    pub contact_file: String,
    pub scheduled: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Defaults to the dispatcher's configured batch size.
    pub batch_size: Option<u32>,
    /// Defaults to the dispatcher's configured interval.
    pub batch_interval_mins: Option<u32>,
}

/// Progress counters, mutated only through atomic storage increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CampaignProgress {
    pub sent_count: u64,
    pub failed_count: u64,
    /// Index of the next batch to run; equals `total_batches` when done.
    pub current_batch: u32,
}

// ============================================================================
// Campaign States
// ============================================================================

/// Campaign is waiting to start: either an immediate send that has not begun
/// or a scheduled campaign whose timer has not fired.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Pending;

impl CampaignState for Pending {}

/// A batch run is underway.
#[derive(Debug, Clone, Serialize)]
pub struct Processing {
    pub started_at: DateTime<Utc>,
    pub progress: CampaignProgress,
}

impl CampaignState for Processing {}

/// All batches finished with zero failures.
#[derive(Debug, Clone, Serialize)]
pub struct Completed {
    pub finished_at: DateTime<Utc>,
    pub progress: CampaignProgress,
}

impl CampaignState for Completed {}

/// The run finished with at least one failure, or an unrecoverable error
/// stopped it outright.
#[derive(Debug, Clone, Serialize)]
pub struct Failed {
    pub failed_at: DateTime<Utc>,
    pub error: Option<String>,
    pub progress: CampaignProgress,
}

impl CampaignState for Failed {}

// ============================================================================
// Unified Campaign Representation
// ============================================================================

/// Enum that can hold a campaign in any state.
///
/// Used for storage and API responses where campaigns are handled uniformly
/// regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "campaign")]
pub enum AnyCampaign {
    Pending(Campaign<Pending>),
    Processing(Campaign<Processing>),
    Completed(Campaign<Completed>),
    Failed(Campaign<Failed>),
}

impl AnyCampaign {
    /// Get the campaign ID regardless of state.
    pub fn id(&self) -> CampaignId {
        self.data().id
    }

    /// Get the campaign configuration regardless of state.
    pub fn data(&self) -> &CampaignData {
        match self {
            AnyCampaign::Pending(c) => &c.data,
            AnyCampaign::Processing(c) => &c.data,
            AnyCampaign::Completed(c) => &c.data,
            AnyCampaign::Failed(c) => &c.data,
        }
    }

    /// Get the status enum for the current state.
    pub fn status(&self) -> CampaignStatus {
        match self {
            AnyCampaign::Pending(_) => CampaignStatus::Pending,
            AnyCampaign::Processing(_) => CampaignStatus::Processing,
            AnyCampaign::Completed(_) => CampaignStatus::Completed,
            AnyCampaign::Failed(_) => CampaignStatus::Failed,
        }
    }

    /// Progress counters, if the campaign has started.
    pub fn progress(&self) -> Option<&CampaignProgress> {
        match self {
            AnyCampaign::Pending(_) => None,
            AnyCampaign::Processing(c) => Some(&c.state.progress),
            AnyCampaign::Completed(c) => Some(&c.state.progress),
            AnyCampaign::Failed(c) => Some(&c.state.progress),
        }
    }

    /// Last recorded error, if any.
    pub fn error(&self) -> Option<&str> {
        match self {
            AnyCampaign::Failed(c) => c.state.error.as_deref(),
            _ => None,
        }
    }

    /// Check if this campaign is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnyCampaign::Completed(_) | AnyCampaign::Failed(_))
    }

    /// Try to take as a Pending campaign, consuming self.
    pub fn into_pending(self) -> Option<Campaign<Pending>> {
        match self {
            AnyCampaign::Pending(c) => Some(c),
            _ => None,
        }
    }
}

impl From<Campaign<Pending>> for AnyCampaign {
    fn from(c: Campaign<Pending>) -> Self {
        AnyCampaign::Pending(c)
    }
}

impl From<Campaign<Processing>> for AnyCampaign {
    fn from(c: Campaign<Processing>) -> Self {
        AnyCampaign::Processing(c)
    }
}

impl From<Campaign<Completed>> for AnyCampaign {
    fn from(c: Campaign<Completed>) -> Self {
        AnyCampaign::Completed(c)
    }
}

impl From<Campaign<Failed>> for AnyCampaign {
    fn from(c: Campaign<Failed>) -> Self {
        AnyCampaign::Failed(c)
    }
}

/// Campaign status for storage and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "pending",
            CampaignStatus::Processing => "processing",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CampaignStatus::Pending),
            "processing" => Ok(CampaignStatus::Processing),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

// ============================================================================
// Batch arithmetic
// ============================================================================

/// Slicing plan for one campaign run.
///
/// Computed once when processing starts and carried through continuations, so
/// the batch count stays fixed even if the campaign row is edited mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchPlan {
    pub total_contacts: u32,
    pub batch_size: u32,
    pub total_batches: u32,
}

impl BatchPlan {
    /// Build a plan. `batch_size` must be nonzero (validated at creation).
    pub fn new(total_contacts: u32, batch_size: u32) -> Self {
        let batch_size = batch_size.max(1);
        BatchPlan {
            total_contacts,
            batch_size,
            total_batches: total_contacts.div_ceil(batch_size),
        }
    }

    /// The `[start, end)` slice for a batch index.
    pub fn bounds(&self, batch_index: u32) -> (usize, usize) {
        let start = (batch_index as usize) * (self.batch_size as usize);
        let end = (start + self.batch_size as usize).min(self.total_contacts as usize);
        (start.min(end), end)
    }

    /// Whether this is the final batch of the run.
    pub fn is_last(&self, batch_index: u32) -> bool {
        batch_index + 1 >= self.total_batches
    }
}
