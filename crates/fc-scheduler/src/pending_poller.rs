//! Pending job poll tick.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use fc_standby::LeaderElector;
use fc_store::{DispatchJob, DispatchMode, JobStore};

use crate::block_checker::BlockOnErrorChecker;
use crate::group_dispatcher::GroupDispatcher;
use crate::{Result, SchedulerConfig};

pub struct PendingPoller {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    block_checker: BlockOnErrorChecker,
    group_dispatcher: Arc<GroupDispatcher>,
    leader: Arc<dyn LeaderElector>,
    /// Held for the duration of a tick; a tick that finds it taken returns
    /// immediately instead of overlapping the previous one.
    tick_lock: Mutex<()>,
}

impl PendingPoller {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        group_dispatcher: Arc<GroupDispatcher>,
        leader: Arc<dyn LeaderElector>,
    ) -> Self {
        let block_checker = BlockOnErrorChecker::new(store.clone());
        Self {
            config,
            store,
            block_checker,
            group_dispatcher,
            leader,
            tick_lock: Mutex::new(()),
        }
    }

    pub async fn poll(&self) -> Result<()> {
        if !self.config.enabled || !self.leader.is_leader() {
            return Ok(());
        }

        let Ok(_tick) = self.tick_lock.try_lock() else {
            trace!("Previous poll tick still running, skipping");
            return Ok(());
        };

        let pending = self.store.find_pending(self.config.batch_size).await?;
        if pending.is_empty() {
            trace!("No pending jobs");
            self.group_dispatcher.cleanup_idle_groups();
            return Ok(());
        }

        debug!(count = pending.len(), "Found pending jobs");
        metrics::gauge!("dispatch.scheduler.pending_jobs").set(pending.len() as f64);

        let jobs_by_group = group_by_message_group(pending);
        let groups: HashSet<String> = jobs_by_group.keys().cloned().collect();
        let blocked = self.block_checker.blocked_groups(&groups).await?;

        metrics::gauge!("dispatch.scheduler.blocked_groups").set(blocked.len() as f64);

        for (group, jobs) in jobs_by_group {
            if blocked.contains(&group) {
                debug!(group = %group, count = jobs.len(), "Group blocked by ERROR jobs, skipping");
                metrics::counter!("dispatch.scheduler.jobs_blocked").increment(jobs.len() as u64);
                continue;
            }

            let dispatchable = filter_by_mode(jobs, &group, &blocked);
            if !dispatchable.is_empty() {
                self.group_dispatcher.submit_jobs(&group, dispatchable);
            }
        }

        self.group_dispatcher.cleanup_idle_groups();
        Ok(())
    }

    pub fn group_dispatcher(&self) -> &Arc<GroupDispatcher> {
        &self.group_dispatcher
    }
}

fn group_by_message_group(jobs: Vec<DispatchJob>) -> HashMap<String, Vec<DispatchJob>> {
    let mut grouped: HashMap<String, Vec<DispatchJob>> = HashMap::new();
    for job in jobs {
        grouped
            .entry(job.group_key().to_string())
            .or_default()
            .push(job);
    }
    grouped
}

/// IMMEDIATE always dispatches. NEXT_ON_ERROR and BLOCK_ON_ERROR both yield
/// to the blocked set; they are intentionally filtered identically here.
fn filter_by_mode(
    jobs: Vec<DispatchJob>,
    group: &str,
    blocked: &HashSet<String>,
) -> Vec<DispatchJob> {
    jobs.into_iter()
        .filter(|job| match job.mode {
            DispatchMode::Immediate => true,
            DispatchMode::NextOnError | DispatchMode::BlockOnError => !blocked.contains(group),
        })
        .collect()
}
