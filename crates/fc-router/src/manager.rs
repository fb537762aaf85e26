//! Queue manager: single owner of pipeline-wide state.
//!
//! One task owns the in-flight registry, the callback and submit-time maps,
//! and the pool sets. Every mutation arrives on a typed command channel;
//! consumers, pools, and timers never touch the maps directly. Broker calls
//! (ack/nack/extend) are spawned off the actor loop after the state change,
//! so a slow broker never stalls routing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use fc_common::visibility::EXTENSION_SECS;
use fc_common::{
    Disposition, InFlightRecord, MessagePointer, PoolConfig, PoolSnapshot, RouterTopology,
    WarningCategory, WarningSeverity,
};
use fc_queue::QueueConsumer;
use fc_standby::LeaderElector;

use crate::mediator::Mediator;
use crate::pool::{PoolCompletion, PoolTask, ProcessPool, SubmitResult};
use crate::visibility;
use crate::warning::WarningService;
use crate::{Result, RouterError};

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const COMPLETION_CHANNEL_CAPACITY: usize = 1024;
const STALE_IN_FLIGHT_SECS: u64 = 300;
const DEFAULT_POOL_CONCURRENCY: u32 = 10;

/// A parsed, deduplicated (within its batch) message from one consumer.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub pointer: MessagePointer,
    pub broker_message_id: String,
    pub receipt_handle: String,
}

#[derive(Debug, Clone)]
struct MessageCallback {
    queue_id: String,
    receipt_handle: String,
}

#[derive(Debug, Clone)]
pub struct ManagerSnapshot {
    pub pools: Vec<PoolSnapshot>,
    pub draining_pools: Vec<String>,
    pub in_flight: usize,
    pub is_leader: bool,
}

enum Command {
    RouteBatch {
        queue_id: String,
        messages: Vec<ConsumedMessage>,
    },
    RecordPendingAck {
        broker_message_id: String,
    },
    UpdateTopology(RouterTopology),
    SweepDraining,
    ExtendVisibility,
    LeakCheck,
    Snapshot {
        reply: oneshot::Sender<ManagerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable front for the manager actor.
#[derive(Clone)]
pub struct QueueManagerHandle {
    tx: mpsc::Sender<Command>,
}

impl QueueManagerHandle {
    pub async fn route_batch(&self, queue_id: String, messages: Vec<ConsumedMessage>) -> Result<()> {
        self.tx
            .send(Command::RouteBatch { queue_id, messages })
            .await
            .map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn update_topology(&self, topology: RouterTopology) -> Result<()> {
        self.tx
            .send(Command::UpdateTopology(topology))
            .await
            .map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn sweep_draining(&self) -> Result<()> {
        self.tx
            .send(Command::SweepDraining)
            .await
            .map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn extend_visibility(&self) -> Result<()> {
        self.tx
            .send(Command::ExtendVisibility)
            .await
            .map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn leak_check(&self) -> Result<()> {
        self.tx
            .send(Command::LeakCheck)
            .await
            .map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn snapshot(&self) -> Result<ManagerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| RouterError::ManagerStopped)?;
        rx.await.map_err(|_| RouterError::ManagerStopped)
    }

    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| RouterError::ManagerStopped)?;
        rx.await.map_err(|_| RouterError::ManagerStopped)
    }
}

pub struct QueueManager {
    cmd_rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    completion_rx: mpsc::Receiver<PoolCompletion>,
    completion_tx: mpsc::Sender<PoolCompletion>,

    consumers: HashMap<String, Arc<dyn QueueConsumer>>,

    in_pipeline: HashMap<String, InFlightRecord>,
    callbacks: HashMap<String, MessageCallback>,
    submit_times: HashMap<String, Instant>,

    pools: HashMap<String, Arc<ProcessPool>>,
    draining_pools: HashMap<String, Arc<ProcessPool>>,
    pool_configs: HashMap<String, PoolConfig>,

    /// Broker ids processed successfully whose ack failed; acked on sight
    /// at the next redelivery.
    pending_ack: HashSet<String>,

    default_pool_code: String,
    batch_counter: u64,

    mediator: Arc<dyn Mediator>,
    leader: Arc<dyn LeaderElector>,
    warning_service: Arc<WarningService>,
}

impl QueueManager {
    pub fn new(
        mediator: Arc<dyn Mediator>,
        leader: Arc<dyn LeaderElector>,
        default_pool_code: String,
        warning_service: Arc<WarningService>,
    ) -> (Self, QueueManagerHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);

        let manager = Self {
            cmd_rx,
            self_tx: cmd_tx.clone(),
            completion_rx,
            completion_tx,
            consumers: HashMap::new(),
            in_pipeline: HashMap::new(),
            callbacks: HashMap::new(),
            submit_times: HashMap::new(),
            pools: HashMap::new(),
            draining_pools: HashMap::new(),
            pool_configs: HashMap::new(),
            pending_ack: HashSet::new(),
            default_pool_code,
            batch_counter: 0,
            mediator,
            leader,
            warning_service,
        };

        (manager, QueueManagerHandle { tx: cmd_tx })
    }

    /// Register a consumer before the actor starts; the id is how
    /// completions find their way back to the right broker connection.
    pub fn register_consumer(&mut self, consumer: Arc<dyn QueueConsumer>) {
        self.consumers
            .insert(consumer.identifier().to_string(), consumer);
    }

    /// Create the initially configured pools before the actor starts.
    pub fn apply_topology(&mut self, topology: &RouterTopology) {
        for pool_config in &topology.pools {
            self.deploy_pool(pool_config.clone());
        }
    }

    /// Run the actor until shutdown. Consumes self; all further access goes
    /// through the handle.
    pub async fn run(mut self) {
        info!(pools = self.pools.len(), consumers = self.consumers.len(), "Queue manager running");

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            self.handle_shutdown().await;
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => break,
                    }
                }
                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }
            }
        }

        info!("Queue manager stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RouteBatch { queue_id, messages } => {
                self.handle_route_batch(queue_id, messages).await;
            }
            Command::RecordPendingAck { broker_message_id } => {
                self.pending_ack.insert(broker_message_id);
            }
            Command::UpdateTopology(topology) => self.handle_update_topology(topology),
            Command::SweepDraining => self.handle_sweep_draining(),
            Command::ExtendVisibility => self.handle_extend_visibility(),
            Command::LeakCheck => self.handle_leak_check(),
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { .. } => unreachable!("handled in run loop"),
        }
    }

    async fn handle_route_batch(&mut self, queue_id: String, messages: Vec<ConsumedMessage>) {
        let Some(consumer) = self.consumers.get(&queue_id).cloned() else {
            warn!(queue_id = %queue_id, "Batch from unregistered consumer, dropping");
            return;
        };

        // Standby instances release everything untouched so the active
        // instance can consume it.
        if !self.leader.is_leader() {
            debug!(count = messages.len(), "Not leader; releasing batch");
            for msg in messages {
                Self::spawn_nack(consumer.clone(), msg.receipt_handle, 0);
            }
            return;
        }

        self.batch_counter += 1;
        let batch_id = self.batch_counter.to_string();

        // (pool, group) keys that already bounced in this batch; later
        // messages under the same key fast-fail to preserve FIFO.
        let mut rejected_groups: HashSet<(String, String)> = HashSet::new();

        for mut msg in messages {
            let broker_id = msg.broker_message_id.clone();

            // Previously processed, ack lost: remove it now.
            if self.pending_ack.remove(&broker_id) {
                info!(broker_message_id = %broker_id, "Acking previously completed redelivery");
                let handle = msg.receipt_handle;
                let consumer = consumer.clone();
                tokio::spawn(async move {
                    let _ = consumer.ack(&handle).await;
                });
                continue;
            }

            // Broker redelivery of something still in flight: refresh the
            // stored receipt handle and return the duplicate immediately.
            if let Some(record) = self.in_pipeline.get_mut(&broker_id) {
                debug!(
                    broker_message_id = %broker_id,
                    message_id = %record.message_id,
                    "Redelivery of in-flight message; refreshing receipt handle"
                );
                record.receipt_handle = msg.receipt_handle.clone();
                if let Some(callback) = self.callbacks.get_mut(&broker_id) {
                    callback.receipt_handle = msg.receipt_handle.clone();
                }
                Self::spawn_nack(consumer.clone(), msg.receipt_handle, 0);
                continue;
            }

            let pool = self.resolve_pool(&msg.pointer.pool_code);
            let group = msg.pointer.group_key().to_string();
            let gate_key = (pool.code().to_string(), group);

            if rejected_groups.contains(&gate_key) {
                Self::spawn_disposition(consumer.clone(), msg.receipt_handle, visibility::fast_fail());
                continue;
            }

            // The router, not the scheduler, owns batch identity. Also pin
            // the effective pool code so draining checks see where the
            // message actually went.
            msg.pointer.batch_id = Some(batch_id.clone());
            msg.pointer.pool_code = pool.code().to_string();

            self.in_pipeline.insert(
                broker_id.clone(),
                InFlightRecord::new(&msg.pointer, queue_id.clone(), msg.receipt_handle.clone()),
            );
            self.callbacks.insert(
                broker_id.clone(),
                MessageCallback {
                    queue_id: queue_id.clone(),
                    receipt_handle: msg.receipt_handle.clone(),
                },
            );
            self.submit_times.insert(broker_id.clone(), Instant::now());

            let task = PoolTask {
                pointer: msg.pointer,
                broker_message_id: broker_id.clone(),
            };

            match pool.submit(task) {
                SubmitResult::Accepted => {}
                SubmitResult::RejectedCapacity | SubmitResult::RejectedStopped => {
                    debug!(
                        broker_message_id = %broker_id,
                        pool_code = %gate_key.0,
                        "Pool rejected submit; fast-failing message and gating its group"
                    );
                    self.remove_tracking(&broker_id);
                    Self::spawn_disposition(
                        consumer.clone(),
                        msg.receipt_handle,
                        visibility::fast_fail(),
                    );
                    rejected_groups.insert(gate_key);
                }
            }
        }
    }

    fn handle_completion(&mut self, completion: PoolCompletion) {
        let broker_id = completion.broker_message_id;

        // Remove from tracking FIRST so a slow broker call can never make
        // the message look stuck.
        let Some(callback) = self.remove_tracking(&broker_id) else {
            debug!(broker_message_id = %broker_id, "Completion for untracked message");
            return;
        };

        let Some(consumer) = self.consumers.get(&callback.queue_id).cloned() else {
            warn!(queue_id = %callback.queue_id, "No consumer for completion");
            return;
        };

        let handle = callback.receipt_handle;
        match completion.disposition {
            Disposition::Ack => {
                let self_tx = self.self_tx.clone();
                tokio::spawn(async move {
                    if let Err(e) = consumer.ack(&handle).await {
                        // Receipt handle likely expired; remember the broker
                        // id and delete the message when it reappears.
                        warn!(
                            broker_message_id = %broker_id,
                            error = %e,
                            "Ack failed; scheduling delete on redelivery"
                        );
                        let _ = self_tx
                            .send(Command::RecordPendingAck {
                                broker_message_id: broker_id,
                            })
                            .await;
                    }
                });
            }
            Disposition::Nack { delay_seconds } => {
                Self::spawn_nack(
                    consumer,
                    handle,
                    delay_seconds.unwrap_or(fc_common::visibility::DEFAULT_RETRY_DELAY_SECS),
                );
            }
            Disposition::Extend { seconds } => {
                tokio::spawn(async move {
                    let _ = consumer.extend_visibility(&handle, seconds).await;
                });
            }
        }
    }

    fn handle_update_topology(&mut self, topology: RouterTopology) {
        let configured: HashMap<String, PoolConfig> = topology
            .pools
            .iter()
            .map(|p| (p.code.clone(), p.clone()))
            .collect();

        let mut created = 0;
        let mut updated = 0;
        let mut removed = 0;

        // Existing pools: push updates or start draining.
        let existing: Vec<String> = self.pools.keys().cloned().collect();
        for code in existing {
            match configured.get(&code) {
                Some(new_config) => {
                    let pool = self.pools[&code].clone();
                    if pool.concurrency() != new_config.concurrency {
                        let target = new_config.concurrency;
                        // May wait on busy permits; never on the actor loop.
                        tokio::spawn(async move {
                            pool.update_concurrency(target).await;
                        });
                        updated += 1;
                    }
                    let pool = &self.pools[&code];
                    if pool.rate_limit_per_minute() != new_config.rate_limit_per_minute {
                        pool.update_rate_limit(new_config.rate_limit_per_minute);
                        updated += 1;
                    }
                    self.pool_configs.insert(code, new_config.clone());
                }
                None => {
                    // The lazily created default pool survives even when it
                    // is not in the configured topology.
                    if code == self.default_pool_code {
                        continue;
                    }
                    if let Some(pool) = self.pools.remove(&code) {
                        info!(pool_code = %code, "Pool removed from topology; draining");
                        pool.drain();
                        self.draining_pools.insert(code.clone(), pool);
                        self.pool_configs.remove(&code);
                        removed += 1;
                    }
                }
            }
        }

        // New pools.
        for (code, pool_config) in configured {
            if !self.pools.contains_key(&code) {
                self.deploy_pool(pool_config);
                created += 1;
            }
        }

        info!(
            created,
            updated,
            removed,
            active = self.pools.len(),
            draining = self.draining_pools.len(),
            "Topology sync applied"
        );
    }

    fn handle_sweep_draining(&mut self) {
        let ready: Vec<String> = self
            .draining_pools
            .iter()
            .filter(|(code, pool)| {
                let referenced = self
                    .in_pipeline
                    .values()
                    .any(|record| record.pool_code == **code);
                !referenced && pool.is_fully_drained()
            })
            .map(|(code, _)| code.clone())
            .collect();

        for code in ready {
            if let Some(pool) = self.draining_pools.remove(&code) {
                info!(pool_code = %code, "Draining pool finished; undeploying");
                tokio::spawn(async move {
                    pool.shutdown().await;
                });
            }
        }
    }

    fn handle_extend_visibility(&mut self) {
        if self.in_pipeline.is_empty() {
            return;
        }

        let mut extended = 0;
        for (broker_id, record) in &self.in_pipeline {
            let Some(callback) = self.callbacks.get(broker_id) else {
                continue;
            };
            let Some(consumer) = self.consumers.get(&callback.queue_id).cloned() else {
                continue;
            };

            let handle = callback.receipt_handle.clone();
            let message_id = record.message_id.clone();
            tokio::spawn(async move {
                if let Err(e) = consumer.extend_visibility(&handle, EXTENSION_SECS).await {
                    warn!(message_id = %message_id, error = %e, "Visibility extension failed");
                }
            });
            extended += 1;
        }

        debug!(extended, "Extended visibility for in-flight messages");
    }

    fn handle_leak_check(&mut self) {
        let pipeline = self.in_pipeline.len();
        let callbacks = self.callbacks.len();
        let times = self.submit_times.len();

        if pipeline != callbacks || pipeline != times {
            error!(
                in_pipeline = pipeline,
                callbacks,
                submit_times = times,
                "Tracking map sizes diverged"
            );
            self.warning_service.add_warning(
                WarningCategory::Resource,
                WarningSeverity::Error,
                format!(
                    "In-flight tracking diverged: pipeline={pipeline} callbacks={callbacks} times={times}"
                ),
                "QueueManager".to_string(),
            );
        }

        let stale = self
            .submit_times
            .values()
            .filter(|t| t.elapsed().as_secs() > STALE_IN_FLIGHT_SECS)
            .count();
        if stale > 0 {
            warn!(stale, "In-flight messages older than {STALE_IN_FLIGHT_SECS}s");
            self.warning_service.add_warning(
                WarningCategory::QueueHealth,
                WarningSeverity::Warn,
                format!("{stale} in-flight messages older than {STALE_IN_FLIGHT_SECS}s"),
                "QueueManager".to_string(),
            );
        }
    }

    async fn handle_shutdown(&mut self) {
        info!("Queue manager shutting down");

        let mut handles = Vec::new();
        for (_, pool) in self.pools.drain() {
            handles.push(tokio::spawn(async move { pool.shutdown().await }));
        }
        for (_, pool) in self.draining_pools.drain() {
            handles.push(tokio::spawn(async move { pool.shutdown().await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        let remaining = self.in_pipeline.len();
        if remaining > 0 {
            // Unacked messages become visible again after the broker's
            // timeout; nothing is lost, only delayed.
            warn!(remaining, "In-flight messages left to broker redelivery");
            self.in_pipeline.clear();
            self.callbacks.clear();
            self.submit_times.clear();
        }
    }

    fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            pools: self.pools.values().map(|p| p.snapshot()).collect(),
            draining_pools: self.draining_pools.keys().cloned().collect(),
            in_flight: self.in_pipeline.len(),
            is_leader: self.leader.is_leader(),
        }
    }

    fn resolve_pool(&mut self, pool_code: &str) -> Arc<ProcessPool> {
        let code = if pool_code.is_empty() {
            self.default_pool_code.clone()
        } else {
            pool_code.to_string()
        };

        if let Some(pool) = self.pools.get(&code) {
            return pool.clone();
        }

        if code != self.default_pool_code {
            metrics::counter!("dispatch.router.unknown_pool").increment(1);
            warn!(pool_code = %code, "Unknown pool code; routing to default pool");
            self.warning_service.add_warning(
                WarningCategory::Routing,
                WarningSeverity::Warn,
                format!("Unknown pool [{code}], routed to [{}]", self.default_pool_code),
                "QueueManager".to_string(),
            );
        }

        if let Some(pool) = self.pools.get(&self.default_pool_code) {
            return pool.clone();
        }

        self.deploy_pool(PoolConfig::new(
            self.default_pool_code.clone(),
            DEFAULT_POOL_CONCURRENCY,
        ))
    }

    fn deploy_pool(&mut self, config: PoolConfig) -> Arc<ProcessPool> {
        let code = config.code.clone();
        let mut pool = ProcessPool::new(config.clone(), self.mediator.clone(), self.completion_tx.clone());
        pool.set_warning_service(self.warning_service.clone());

        let pool = Arc::new(pool);
        pool.start();

        self.pool_configs.insert(code.clone(), config);
        self.pools.insert(code.clone(), pool.clone());
        info!(pool_code = %code, concurrency = pool.concurrency(), "Deployed process pool");
        pool
    }

    fn remove_tracking(&mut self, broker_id: &str) -> Option<MessageCallback> {
        self.in_pipeline.remove(broker_id);
        self.submit_times.remove(broker_id);
        self.callbacks.remove(broker_id)
    }

    fn spawn_nack(consumer: Arc<dyn QueueConsumer>, receipt_handle: String, delay_seconds: u32) {
        tokio::spawn(async move {
            if let Err(e) = consumer.nack_with_delay(&receipt_handle, delay_seconds).await {
                // Visibility timeout is the backstop.
                debug!(error = %e, "Nack failed; broker timeout will redeliver");
            }
        });
    }

    fn spawn_disposition(
        consumer: Arc<dyn QueueConsumer>,
        receipt_handle: String,
        disposition: Disposition,
    ) {
        match disposition {
            Disposition::Ack => {
                tokio::spawn(async move {
                    let _ = consumer.ack(&receipt_handle).await;
                });
            }
            Disposition::Nack { delay_seconds } => {
                Self::spawn_nack(consumer, receipt_handle, delay_seconds.unwrap_or(0));
            }
            Disposition::Extend { seconds } => {
                tokio::spawn(async move {
                    let _ = consumer.extend_visibility(&receipt_handle, seconds).await;
                });
            }
        }
    }
}
