//! Dispatch scheduler.
//!
//! Drains persisted PENDING jobs into the broker:
//! - [`PendingPoller`] loads batches, groups them, filters blocked groups;
//! - [`GroupDispatcher`] serializes publishes per message group with a
//!   shared concurrency budget across groups;
//! - [`JobDispatcher`] envelopes a job, publishes it, and flips the row to
//!   QUEUED;
//! - [`StaleQueuedPoller`] rescues QUEUED rows whose publish was lost.
//!
//! Everything is gated on leadership; tick failures are logged and the next
//! tick proceeds.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{error, info, warn};

use fc_standby::LeaderElector;

pub mod auth;
pub mod block_checker;
pub mod group_dispatcher;
pub mod job_dispatcher;
pub mod pending_poller;
pub mod stale_recovery;

pub use auth::DispatchAuth;
pub use block_checker::BlockOnErrorChecker;
pub use group_dispatcher::GroupDispatcher;
pub use job_dispatcher::JobDispatcher;
pub use pending_poller::PendingPoller;
pub use stale_recovery::StaleQueuedPoller;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] fc_store::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] fc_queue::QueueError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Runtime scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub max_concurrent_groups: u32,
    pub stale_threshold: Duration,
    pub stale_poll_interval: Duration,
    pub default_pool_code: String,
    pub processing_endpoint: String,
    pub app_key: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(5),
            batch_size: 20,
            max_concurrent_groups: 10,
            stale_threshold: Duration::from_secs(15 * 60),
            stale_poll_interval: Duration::from_secs(60),
            default_pool_code: "DISPATCH-POOL".to_string(),
            processing_endpoint: "http://localhost:8080/api/dispatch/process".to_string(),
            app_key: None,
        }
    }
}

/// Owns the scheduler's periodic loops.
pub struct DispatchScheduler {
    config: SchedulerConfig,
    poller: Arc<PendingPoller>,
    stale_poller: Arc<StaleQueuedPoller>,
    running: Arc<RwLock<bool>>,
}

impl DispatchScheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn fc_store::JobStore>,
        publisher: Arc<dyn fc_queue::QueuePublisher>,
        leader: Arc<dyn LeaderElector>,
    ) -> Self {
        let auth = DispatchAuth::new(config.app_key.clone());
        let job_dispatcher = Arc::new(JobDispatcher::new(
            config.clone(),
            store.clone(),
            publisher,
            auth,
        ));
        let group_dispatcher = Arc::new(GroupDispatcher::new(
            config.max_concurrent_groups,
            job_dispatcher,
        ));
        let poller = Arc::new(PendingPoller::new(
            config.clone(),
            store.clone(),
            group_dispatcher,
            leader.clone(),
        ));
        let stale_poller = Arc::new(StaleQueuedPoller::new(config.clone(), store, leader));

        Self {
            config,
            poller,
            stale_poller,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn start(&self) {
        if !self.config.enabled {
            info!("Dispatch scheduler is disabled");
            return;
        }

        {
            let mut running = self.running.write().await;
            if *running {
                warn!("Scheduler already running");
                return;
            }
            *running = true;
        }

        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            max_concurrent_groups = self.config.max_concurrent_groups,
            "Starting dispatch scheduler"
        );

        let poller = self.poller.clone();
        let poll_interval = self.config.poll_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(poll_interval);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = poller.poll().await {
                    error!(error = %e, "Pending poll tick failed");
                }
            }
        });

        let stale_poller = self.stale_poller.clone();
        let stale_interval = self.config.stale_poll_interval;
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut ticker = interval(stale_interval);
            loop {
                ticker.tick().await;
                if !*running.read().await {
                    break;
                }
                if let Err(e) = stale_poller.recover().await {
                    error!(error = %e, "Stale-queued recovery tick failed");
                }
            }
        });
    }

    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Dispatch scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Direct access for tests and manual drains.
    pub fn poller(&self) -> &Arc<PendingPoller> {
        &self.poller
    }

    pub fn stale_poller(&self) -> &Arc<StaleQueuedPoller> {
        &self.stale_poller
    }
}
