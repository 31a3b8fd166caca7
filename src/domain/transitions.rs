//! State transitions for campaigns.
//!
//! Transitions persist through the [`Storage`] trait and return the
//! next-state value, so a caller holding a `Campaign<Processing>` is proof
//! that the pending → processing edge was won.

use chrono::Utc;

use crate::error::{BroadsideError, Result};
use crate::storage::Storage;

use super::campaign::{
    Campaign, CampaignProgress, CampaignStatus, Completed, Failed, Pending, Processing,
};

impl Campaign<Pending> {
    /// Attempt the pending → processing edge.
    ///
    /// The edge is a compare-and-swap in storage: if another starter (an
    /// immediate send racing a restored schedule) already moved the campaign
    /// out of `pending`, this returns `InvalidState` and nothing runs twice.
    pub async fn begin<S: Storage + ?Sized>(self, storage: &S) -> Result<Campaign<Processing>> {
        let started = storage.begin_processing(self.data.id).await?;
        if !started {
            return Err(BroadsideError::InvalidState(
                self.data.id,
                "started".to_string(),
                "pending".to_string(),
            ));
        }
        Ok(Campaign {
            state: Processing {
                started_at: Utc::now(),
                progress: CampaignProgress::default(),
            },
            data: self.data,
        })
    }
}

impl Campaign<Processing> {
    /// Finish the run with zero failures.
    pub async fn complete<S: Storage + ?Sized>(self, storage: &S) -> Result<Campaign<Completed>> {
        storage
            .finish_campaign(self.data.id, CampaignStatus::Completed, None)
            .await?;
        Ok(Campaign {
            state: Completed {
                finished_at: Utc::now(),
                progress: self.state.progress,
            },
            data: self.data,
        })
    }

    /// Finish the run as failed, retaining the last error for display.
    pub async fn fail<S: Storage + ?Sized>(
        self,
        error: Option<String>,
        storage: &S,
    ) -> Result<Campaign<Failed>> {
        storage
            .finish_campaign(self.data.id, CampaignStatus::Failed, error.clone())
            .await?;
        Ok(Campaign {
            state: Failed {
                failed_at: Utc::now(),
                error,
                progress: self.state.progress,
            },
            data: self.data,
        })
    }
}
