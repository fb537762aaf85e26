//! Per-group FIFO dispatch toward the broker.
//!
//! Each message group owns a queue and an in-flight flag: at most one job
//! per group is on its way to the broker at any moment, so publish order
//! within a group is strict FIFO. Across groups, a shared semaphore bounds
//! how many publishes run in parallel.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use fc_store::DispatchJob;

use crate::job_dispatcher::JobDispatcher;

struct GroupQueue {
    group: String,
    jobs: Mutex<VecDeque<DispatchJob>>,
    in_flight: AtomicBool,
}

impl GroupQueue {
    fn new(group: String) -> Self {
        Self {
            group,
            jobs: Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
        }
    }

    fn is_idle(&self) -> bool {
        !self.in_flight.load(Ordering::SeqCst) && self.jobs.lock().is_empty()
    }
}

/// Resets the group's in-flight flag even if the dispatch task panics, so a
/// dead group restarts on the next submit instead of wedging forever.
struct InFlightGuard {
    queue: Arc<GroupQueue>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.queue.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct GroupDispatcher {
    groups: DashMap<String, Arc<GroupQueue>>,
    semaphore: Arc<Semaphore>,
    dispatcher: Arc<JobDispatcher>,
}

impl GroupDispatcher {
    pub fn new(max_concurrent_groups: u32, dispatcher: Arc<JobDispatcher>) -> Self {
        Self {
            groups: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent_groups.max(1) as usize)),
            dispatcher,
        }
    }

    /// Enqueue jobs for a group in dispatch order and kick the group if it
    /// is not already draining.
    pub fn submit_jobs(self: &Arc<Self>, group: &str, mut jobs: Vec<DispatchJob>) {
        if jobs.is_empty() {
            return;
        }

        jobs.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let queue = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(GroupQueue::new(group.to_string())))
            .clone();

        {
            let mut pending = queue.jobs.lock();
            // Re-polled PENDING rows may still be queued from the previous
            // tick; drop repeats instead of double-publishing.
            for job in jobs {
                if pending.iter().any(|j| j.id == job.id) {
                    continue;
                }
                pending.push_back(job);
            }
        }

        debug!(group = %queue.group, "Jobs submitted to group queue");
        self.try_dispatch_next(queue);
    }

    /// Atomically claim the group and launch the head job. Re-invoked after
    /// every dispatch completion, so a group drains without gaps while
    /// staying single-file.
    fn try_dispatch_next(self: &Arc<Self>, queue: Arc<GroupQueue>) {
        if queue
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let job = queue.jobs.lock().pop_front();
        let Some(job) = job else {
            queue.in_flight.store(false, Ordering::SeqCst);
            return;
        };

        let this = self.clone();
        let semaphore = self.semaphore.clone();
        let dispatcher = self.dispatcher.clone();

        tokio::spawn(async move {
            let guard = InFlightGuard {
                queue: queue.clone(),
            };

            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed: shutdown in progress, job stays
                    // PENDING and the next poll cycle retries.
                    warn!(job_id = %job.id, "Group semaphore closed, abandoning dispatch");
                    return;
                }
            };

            let job_id = job.id.clone();
            match dispatcher.dispatch(&job).await {
                Ok(true) => debug!(job_id = %job_id, group = %queue.group, "Job published"),
                Ok(false) => {
                    debug!(job_id = %job_id, "Publish declined; job remains PENDING")
                }
                Err(e) => error!(job_id = %job_id, error = %e, "Dispatch failed"),
            }

            drop(permit);
            drop(guard);
            this.try_dispatch_next(queue);
        });
    }

    /// Drop groups with nothing queued and nothing in flight.
    pub fn cleanup_idle_groups(&self) {
        let idle: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| entry.value().is_idle())
            .map(|entry| entry.key().clone())
            .collect();

        for group in idle {
            // Re-check under the entry lock; a submit may have raced in.
            self.groups
                .remove_if(&group, |_, queue| queue.is_idle());
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn queued_jobs(&self, group: &str) -> usize {
        self.groups
            .get(group)
            .map(|q| q.jobs.lock().len())
            .unwrap_or(0)
    }

    /// True while any group still has queued or in-flight work.
    pub fn has_work(&self) -> bool {
        self.groups.iter().any(|entry| !entry.value().is_idle())
    }
}
