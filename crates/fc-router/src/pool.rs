//! Process pool: per-group FIFO fan-out under a pool-wide concurrency and
//! rate budget.
//!
//! Every message group gets its own queue and long-lived worker task, so at
//! most one mediator call is in flight per group. A pool-wide semaphore
//! bounds total in-flight mediations regardless of group count, and an
//! optional token bucket is checked before semaphore acquisition so rate
//! pressure never holds a permit hostage.
//!
//! Batch+group FIFO: when a message fails retriably, its `batchId|groupId`
//! key is marked failed and every later message under that key fast-fails
//! without touching the mediator, preserving order relative to the broker's
//! redelivery of the failed message.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use fc_common::visibility::clamp_delay;
use fc_common::{
    Disposition, MediationResult, MessagePointer, PoolConfig, PoolSnapshot, WarningCategory,
    WarningSeverity,
};

use crate::mediator::Mediator;
use crate::visibility;
use crate::warning::WarningService;

const QUEUE_CAPACITY_MULTIPLIER: u32 = 2;
const MIN_QUEUE_CAPACITY: u32 = 50;
const GROUP_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const GAUGE_INTERVAL: Duration = Duration::from_millis(500);
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const CONCURRENCY_DECREASE_TIMEOUT: Duration = Duration::from_secs(30);

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// `batchId|groupId` composite key for retry-ordering enforcement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchGroupKey {
    pub batch_id: Arc<str>,
    pub group_id: Arc<str>,
}

impl BatchGroupKey {
    pub fn new(batch_id: &str, group_id: &str) -> Self {
        Self {
            batch_id: Arc::from(batch_id),
            group_id: Arc::from(group_id),
        }
    }
}

impl std::fmt::Display for BatchGroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.batch_id, self.group_id)
    }
}

/// One message routed into the pool.
pub struct PoolTask {
    pub pointer: MessagePointer,
    pub broker_message_id: String,
}

impl PoolTask {
    fn batch_group_key(&self) -> Option<BatchGroupKey> {
        self.pointer
            .batch_id
            .as_deref()
            .map(|batch| BatchGroupKey::new(batch, self.pointer.group_key()))
    }
}

/// Terminal decision for one routed message, reported to the manager.
#[derive(Debug)]
pub struct PoolCompletion {
    pub broker_message_id: String,
    pub disposition: Disposition,
}

/// Result of handing a task to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitResult {
    /// The pool owns the message now; a completion will follow.
    Accepted,
    /// Queue full; the caller keeps ownership.
    RejectedCapacity,
    /// Pool is stopped or draining; the caller keeps ownership.
    RejectedStopped,
}

pub struct ProcessPool {
    code: String,
    concurrency: AtomicU32,
    queue_capacity: u32,
    semaphore: Arc<Semaphore>,

    group_txs: Arc<DashMap<Arc<str>, mpsc::Sender<PoolTask>>>,
    /// Liveness markers; a worker removes itself on exit so a dead group is
    /// restarted by the next submit.
    active_groups: Arc<DashSet<Arc<str>>>,

    failed_batch_groups: Arc<DashSet<BatchGroupKey>>,
    batch_group_counts: Arc<DashMap<BatchGroupKey, AtomicU32>>,

    rate_limiter: Arc<parking_lot::RwLock<Option<Arc<DirectLimiter>>>>,
    rate_limit_per_minute: parking_lot::RwLock<Option<u32>>,

    running: AtomicBool,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,

    mediator: Arc<dyn Mediator>,
    completions: mpsc::Sender<PoolCompletion>,
    shutdown_tx: broadcast::Sender<()>,
    warning_service: Option<Arc<WarningService>>,
}

impl ProcessPool {
    pub fn new(
        config: PoolConfig,
        mediator: Arc<dyn Mediator>,
        completions: mpsc::Sender<PoolCompletion>,
    ) -> Self {
        let limiter = config
            .rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        let queue_capacity = config.queue_capacity.unwrap_or_else(|| {
            std::cmp::max(config.concurrency * QUEUE_CAPACITY_MULTIPLIER, MIN_QUEUE_CAPACITY)
        });

        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            code: config.code.clone(),
            concurrency: AtomicU32::new(config.concurrency),
            queue_capacity,
            semaphore: Arc::new(Semaphore::new(config.concurrency as usize)),
            group_txs: Arc::new(DashMap::new()),
            active_groups: Arc::new(DashSet::new()),
            failed_batch_groups: Arc::new(DashSet::new()),
            batch_group_counts: Arc::new(DashMap::new()),
            rate_limiter: Arc::new(parking_lot::RwLock::new(limiter)),
            rate_limit_per_minute: parking_lot::RwLock::new(config.rate_limit_per_minute),
            running: AtomicBool::new(false),
            queue_size: Arc::new(AtomicU32::new(0)),
            active_workers: Arc::new(AtomicU32::new(0)),
            mediator,
            completions,
            shutdown_tx,
            warning_service: None,
        }
    }

    pub fn set_warning_service(&mut self, warning_service: Arc<WarningService>) {
        self.warning_service = Some(warning_service);
    }

    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            pool_code = %self.code,
            concurrency = self.concurrency.load(Ordering::SeqCst),
            queue_capacity = self.queue_capacity,
            rate_limit = ?*self.rate_limit_per_minute.read(),
            "Starting process pool"
        );

        self.spawn_gauge_updater();
    }

    /// Hand one message to the pool. On `Accepted`, exactly one
    /// [`PoolCompletion`] will eventually be emitted for it. Never blocks:
    /// the caller is the manager task.
    pub fn submit(&self, task: PoolTask) -> SubmitResult {
        if !self.running.load(Ordering::SeqCst) {
            return SubmitResult::RejectedStopped;
        }

        if self.queue_size.load(Ordering::SeqCst) >= self.queue_capacity {
            debug!(pool_code = %self.code, "Pool queue at capacity");
            return SubmitResult::RejectedCapacity;
        }

        self.queue_size.fetch_add(1, Ordering::SeqCst);

        let group_id: Arc<str> = Arc::from(task.pointer.group_key());
        let batch_group_key = task.batch_group_key();

        if let Some(ref key) = batch_group_key {
            self.batch_group_counts
                .entry(key.clone())
                .or_insert_with(|| AtomicU32::new(0))
                .fetch_add(1, Ordering::SeqCst);

            // Pre-queue check: a sibling already failed in this batch+group.
            if self.failed_batch_groups.contains(key) {
                self.queue_size.fetch_sub(1, Ordering::SeqCst);
                Self::decrement_batch_group(key, &self.batch_group_counts, &self.failed_batch_groups);
                self.emit_completion(task.broker_message_id, visibility::fast_fail());
                return SubmitResult::Accepted;
            }
        }

        let tx = self.group_channel(&group_id);
        match tx.try_send(task) {
            Ok(()) => SubmitResult::Accepted,
            Err(mpsc::error::TrySendError::Full(task)) => {
                self.rollback_submit(&task, &batch_group_key);
                SubmitResult::RejectedCapacity
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                // Idle worker exited between lookup and send; retry once on
                // a fresh channel.
                self.group_txs.remove(&group_id);
                let tx = self.group_channel(&group_id);
                match tx.try_send(task) {
                    Ok(()) => SubmitResult::Accepted,
                    Err(e) => {
                        let task = match e {
                            mpsc::error::TrySendError::Full(t)
                            | mpsc::error::TrySendError::Closed(t) => t,
                        };
                        error!(pool_code = %self.code, group = %group_id, "Group channel unavailable after restart");
                        self.rollback_submit(&task, &batch_group_key);
                        SubmitResult::RejectedCapacity
                    }
                }
            }
        }
    }

    fn rollback_submit(&self, _task: &PoolTask, batch_group_key: &Option<BatchGroupKey>) {
        self.queue_size.fetch_sub(1, Ordering::SeqCst);
        if let Some(key) = batch_group_key {
            Self::decrement_batch_group(key, &self.batch_group_counts, &self.failed_batch_groups);
        }
    }

    /// Emit a completion without blocking the caller. `submit` runs on the
    /// manager task, which is also the completion consumer, so a blocking
    /// send here could deadlock against a full channel.
    fn emit_completion(&self, broker_message_id: String, disposition: Disposition) {
        let completions = self.completions.clone();
        let pool_code = self.code.clone();
        tokio::spawn(async move {
            if completions
                .send(PoolCompletion {
                    broker_message_id,
                    disposition,
                })
                .await
                .is_err()
            {
                warn!(pool_code = %pool_code, "Completion channel closed");
            }
        });
    }

    /// Live sender for a group, restarting the worker if it died.
    fn group_channel(&self, group_id: &Arc<str>) -> mpsc::Sender<PoolTask> {
        let mut restarted = false;
        if let Some(tx) = self.group_txs.get(group_id) {
            if self.active_groups.contains(group_id) {
                return tx.clone();
            }
            restarted = true;
        }

        self.group_txs.remove(group_id);

        if restarted {
            warn!(
                pool_code = %self.code,
                group = %group_id,
                "Group worker died; restarting"
            );
            if let Some(ref ws) = self.warning_service {
                ws.add_warning(
                    WarningCategory::GroupWorkerRestart,
                    WarningSeverity::Warn,
                    format!("Worker for group [{group_id}] in pool [{}] restarted", self.code),
                    format!("ProcessPool:{}", self.code),
                );
            }
        }

        let (tx, rx) = mpsc::channel(self.queue_capacity.max(1) as usize);
        self.group_txs.insert(Arc::clone(group_id), tx.clone());
        self.spawn_group_worker(Arc::clone(group_id), rx);
        tx
    }

    fn spawn_group_worker(&self, group_id: Arc<str>, rx: mpsc::Receiver<PoolTask>) {
        // Mark alive before the task runs so a racing submit sees it.
        self.active_groups.insert(Arc::clone(&group_id));

        let ctx = WorkerContext {
            group_id,
            pool_code: Arc::from(self.code.as_str()),
            semaphore: self.semaphore.clone(),
            mediator: self.mediator.clone(),
            completions: self.completions.clone(),
            queue_size: self.queue_size.clone(),
            active_workers: self.active_workers.clone(),
            failed_batch_groups: self.failed_batch_groups.clone(),
            batch_group_counts: self.batch_group_counts.clone(),
            rate_limiter: self.rate_limiter.clone(),
            group_txs: self.group_txs.clone(),
            active_groups: self.active_groups.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
        };

        tokio::spawn(ctx.run(rx));
    }

    fn decrement_batch_group(
        key: &BatchGroupKey,
        counts: &DashMap<BatchGroupKey, AtomicU32>,
        failed: &DashSet<BatchGroupKey>,
    ) {
        // The Ref guard must drop before remove() or DashMap deadlocks.
        let exhausted = counts
            .get(key)
            .map(|counter| counter.fetch_sub(1, Ordering::SeqCst) <= 1)
            .unwrap_or(false);

        if exhausted {
            counts.remove(key);
            failed.remove(key);
            debug!(batch_group = %key, "Batch+group fully settled, cleaned up");
        }
    }

    fn spawn_gauge_updater(self: &Arc<Self>) {
        let pool = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GAUGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { break };
                        let code = pool.code.clone();
                        metrics::gauge!("dispatch.router.pool.active_workers", "pool" => code.clone())
                            .set(pool.active_workers.load(Ordering::SeqCst) as f64);
                        metrics::gauge!("dispatch.router.pool.available_permits", "pool" => code.clone())
                            .set(pool.semaphore.available_permits() as f64);
                        metrics::gauge!("dispatch.router.pool.queue_size", "pool" => code.clone())
                            .set(pool.queue_size.load(Ordering::SeqCst) as f64);
                        metrics::gauge!("dispatch.router.pool.group_count", "pool" => code)
                            .set(pool.group_txs.len() as f64);
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Stop accepting new submits; queued work keeps draining.
    pub fn drain(&self) {
        info!(pool_code = %self.code, "Draining pool");
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_fully_drained(&self) -> bool {
        self.queue_size.load(Ordering::SeqCst) == 0
            && self.active_workers.load(Ordering::SeqCst) == 0
    }

    /// Bounded shutdown: reject submits, stop the gauge ticker, cancel
    /// workers, then wait for in-flight mediations to settle.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        let deadline = tokio::time::Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while !self.is_fully_drained() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !self.is_fully_drained() {
            warn!(
                pool_code = %self.code,
                queue_size = self.queue_size.load(Ordering::SeqCst),
                active_workers = self.active_workers.load(Ordering::SeqCst),
                "Pool shutdown deadline reached with work outstanding"
            );
        }

        self.group_txs.clear();
        info!(pool_code = %self.code, "Pool shut down");
    }

    /// Live concurrency change. Increases release permits immediately;
    /// decreases acquire the delta within a timeout and roll back when the
    /// permits cannot be obtained.
    pub async fn update_concurrency(&self, new_concurrency: u32) -> bool {
        let old = self.concurrency.load(Ordering::SeqCst);
        if new_concurrency == old {
            return true;
        }
        if new_concurrency == 0 {
            warn!(pool_code = %self.code, "Rejecting concurrency of 0");
            return false;
        }

        if new_concurrency > old {
            self.semaphore.add_permits((new_concurrency - old) as usize);
            self.concurrency.store(new_concurrency, Ordering::SeqCst);
            info!(pool_code = %self.code, old, new = new_concurrency, "Increased pool concurrency");
            return true;
        }

        let delta = (old - new_concurrency) as usize;
        match tokio::time::timeout(CONCURRENCY_DECREASE_TIMEOUT, self.acquire_many(delta)).await {
            Ok(permits) => {
                // Holding the permits forever removes them from circulation.
                for permit in permits {
                    permit.forget();
                }
                self.concurrency.store(new_concurrency, Ordering::SeqCst);
                info!(pool_code = %self.code, old, new = new_concurrency, "Decreased pool concurrency");
                true
            }
            Err(_) => {
                warn!(
                    pool_code = %self.code,
                    old,
                    requested = new_concurrency,
                    "Concurrency decrease timed out; keeping current limit"
                );
                false
            }
        }
    }

    async fn acquire_many(&self, count: usize) -> Vec<tokio::sync::SemaphorePermit<'_>> {
        let mut permits = Vec::with_capacity(count);
        for _ in 0..count {
            match self.semaphore.acquire().await {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        permits
    }

    /// Replace the token bucket under a short write lock.
    pub fn update_rate_limit(&self, new_rate: Option<u32>) {
        let old = *self.rate_limit_per_minute.read();
        if old == new_rate {
            return;
        }

        let limiter = new_rate
            .and_then(NonZeroU32::new)
            .map(|rpm| Arc::new(RateLimiter::direct(Quota::per_minute(rpm))));

        *self.rate_limiter.write() = limiter;
        *self.rate_limit_per_minute.write() = new_rate;

        info!(pool_code = %self.code, old = ?old, new = ?new_rate, "Rate limit updated");
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::SeqCst)
    }

    pub fn rate_limit_per_minute(&self) -> Option<u32> {
        *self.rate_limit_per_minute.read()
    }

    pub fn queue_size(&self) -> u32 {
        self.queue_size.load(Ordering::SeqCst)
    }

    pub fn active_workers(&self) -> u32 {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limiter
            .read()
            .as_ref()
            .map(|rl| rl.check().is_err())
            .unwrap_or(false)
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            pool_code: self.code.clone(),
            concurrency: self.concurrency(),
            active_workers: self.active_workers(),
            queue_size: self.queue_size(),
            queue_capacity: self.queue_capacity,
            message_group_count: self.group_txs.len() as u32,
            rate_limit_per_minute: self.rate_limit_per_minute(),
            is_rate_limited: self.is_rate_limited(),
        }
    }
}

/// Everything a group worker needs, detached from the pool's lifetime.
struct WorkerContext {
    group_id: Arc<str>,
    pool_code: Arc<str>,
    semaphore: Arc<Semaphore>,
    mediator: Arc<dyn Mediator>,
    completions: mpsc::Sender<PoolCompletion>,
    queue_size: Arc<AtomicU32>,
    active_workers: Arc<AtomicU32>,
    failed_batch_groups: Arc<DashSet<BatchGroupKey>>,
    batch_group_counts: Arc<DashMap<BatchGroupKey, AtomicU32>>,
    rate_limiter: Arc<parking_lot::RwLock<Option<Arc<DirectLimiter>>>>,
    group_txs: Arc<DashMap<Arc<str>, mpsc::Sender<PoolTask>>>,
    active_groups: Arc<DashSet<Arc<str>>>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl WorkerContext {
    async fn run(mut self, mut rx: mpsc::Receiver<PoolTask>) {
        debug!(group = %self.group_id, pool_code = %self.pool_code, "Group worker started");

        loop {
            let task = tokio::select! {
                task = tokio::time::timeout(GROUP_IDLE_TIMEOUT, rx.recv()) => task,
                _ = self.shutdown_rx.recv() => {
                    debug!(group = %self.group_id, "Group worker cancelled");
                    self.release_leftovers(&mut rx).await;
                    break;
                }
            };

            let task = match task {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(_) => {
                    // Idle timeout: self-terminate when nothing is queued.
                    // Closing first makes racing submits fail over to a
                    // fresh worker instead of landing in a dying channel.
                    if rx.is_empty() {
                        rx.close();
                        self.release_leftovers(&mut rx).await;
                        self.group_txs
                            .remove_if(&self.group_id, |_, tx| tx.is_closed());
                        debug!(group = %self.group_id, "Group worker idle, exiting");
                        break;
                    }
                    continue;
                }
            };

            self.queue_size.fetch_sub(1, Ordering::SeqCst);

            let key = task.batch_group_key();

            // Post-queue check: a sibling failed while this message waited.
            if let Some(ref key) = key {
                if self.failed_batch_groups.contains(key) {
                    debug!(
                        message_id = %task.pointer.id,
                        batch_group = %key,
                        "Batch+group already failed; fast-failing to keep order"
                    );
                    self.complete(task.broker_message_id, visibility::fast_fail()).await;
                    ProcessPool::decrement_batch_group(
                        key,
                        &self.batch_group_counts,
                        &self.failed_batch_groups,
                    );
                    continue;
                }
            }

            // Rate check before the semaphore: a throttled message must not
            // hold a permit while tokens regenerate.
            let throttled = self
                .rate_limiter
                .read()
                .as_ref()
                .map(|rl| rl.check().is_err())
                .unwrap_or(false);
            if throttled {
                metrics::counter!("dispatch.router.pool.rate_limited", "pool" => self.pool_code.to_string())
                    .increment(1);
                debug!(message_id = %task.pointer.id, "Rate limited; fast-failing");
                self.complete(task.broker_message_id, visibility::fast_fail()).await;
                if let Some(ref key) = key {
                    ProcessPool::decrement_batch_group(
                        key,
                        &self.batch_group_counts,
                        &self.failed_batch_groups,
                    );
                }
                continue;
            }

            let permit = match self.semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.complete(task.broker_message_id, visibility::reset_to_default()).await;
                    if let Some(ref key) = key {
                        ProcessPool::decrement_batch_group(
                            key,
                            &self.batch_group_counts,
                            &self.failed_batch_groups,
                        );
                    }
                    break;
                }
            };

            self.active_workers.fetch_add(1, Ordering::SeqCst);
            let outcome = self.mediator.mediate(&task.pointer).await;
            self.active_workers.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            let disposition = match outcome.result {
                MediationResult::Success | MediationResult::ErrorConfig => Disposition::Ack,
                MediationResult::ErrorProcess | MediationResult::ErrorConnection => {
                    if let Some(ref key) = key {
                        if self.failed_batch_groups.insert(key.clone()) {
                            warn!(
                                batch_group = %key,
                                "Batch+group marked failed; siblings will fast-fail"
                            );
                        }
                    }
                    Disposition::Nack {
                        delay_seconds: Some(clamp_delay(
                            outcome
                                .delay_seconds
                                .unwrap_or(fc_common::visibility::DEFAULT_RETRY_DELAY_SECS),
                        )),
                    }
                }
            };

            self.complete(task.broker_message_id, disposition).await;

            if let Some(ref key) = key {
                ProcessPool::decrement_batch_group(
                    key,
                    &self.batch_group_counts,
                    &self.failed_batch_groups,
                );
            }
        }

        self.active_groups.remove(&self.group_id);
        debug!(group = %self.group_id, pool_code = %self.pool_code, "Group worker exited");
    }

    /// Return any tasks still queued at worker exit to the broker so they
    /// redeliver instead of vanishing with the channel.
    async fn release_leftovers(&self, rx: &mut mpsc::Receiver<PoolTask>) {
        rx.close();
        while let Ok(task) = rx.try_recv() {
            self.queue_size.fetch_sub(1, Ordering::SeqCst);
            if let Some(ref key) = task.batch_group_key() {
                ProcessPool::decrement_batch_group(
                    key,
                    &self.batch_group_counts,
                    &self.failed_batch_groups,
                );
            }
            self.complete(task.broker_message_id, visibility::fast_fail()).await;
        }
    }

    async fn complete(&self, broker_message_id: String, disposition: Disposition) {
        if self
            .completions
            .send(PoolCompletion {
                broker_message_id,
                disposition,
            })
            .await
            .is_err()
        {
            warn!(pool_code = %self.pool_code, "Completion channel closed");
        }
    }
}
