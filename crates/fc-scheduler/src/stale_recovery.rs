//! Stale QUEUED recovery.
//!
//! A job flips to QUEUED when its publish is accepted, but the broker write
//! can be lost (crash between publish and redelivery, dedup of a dropped
//! message). Rows stuck in QUEUED past the threshold are reset to PENDING
//! so the pending poller picks them up again.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use fc_standby::LeaderElector;
use fc_store::{DispatchStatus, JobStore};

use crate::{Result, SchedulerConfig};

const RECOVERY_BATCH_LIMIT: u32 = 100;

pub struct StaleQueuedPoller {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    leader: Arc<dyn LeaderElector>,
}

impl StaleQueuedPoller {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        leader: Arc<dyn LeaderElector>,
    ) -> Self {
        Self {
            config,
            store,
            leader,
        }
    }

    pub async fn recover(&self) -> Result<usize> {
        if !self.leader.is_leader() {
            return Ok(0);
        }

        let threshold = Utc::now()
            - chrono::Duration::from_std(self.config.stale_threshold)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));

        let stale = self
            .store
            .find_stale_queued(threshold, RECOVERY_BATCH_LIMIT)
            .await?;

        if stale.is_empty() {
            debug!("No stale QUEUED jobs");
            return Ok(0);
        }

        let count = self
            .store
            .update_status_batch(&stale, DispatchStatus::Pending)
            .await? as usize;

        metrics::counter!("dispatch.scheduler.stale_jobs_recovered").increment(count as u64);
        info!(
            count,
            threshold_mins = self.config.stale_threshold.as_secs() / 60,
            "Recovered stale QUEUED jobs"
        );

        Ok(count)
    }
}
