//! Router lifecycle timers.
//!
//! Background cadences around the manager actor: topology sync (5 min),
//! draining sweep (10 s), visibility extension (55 s), leak check (30 s),
//! and warning cleanup. All stop on one shutdown broadcast.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use fc_common::RouterTopology;

use crate::manager::QueueManagerHandle;
use crate::warning::WarningService;

/// Where the router learns which pools should exist.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch(&self) -> std::result::Result<RouterTopology, String>;
}

/// Fixed topology from local configuration.
pub struct StaticTopologySource {
    topology: RouterTopology,
}

impl StaticTopologySource {
    pub fn new(topology: RouterTopology) -> Self {
        Self { topology }
    }
}

#[async_trait]
impl TopologySource for StaticTopologySource {
    async fn fetch(&self) -> std::result::Result<RouterTopology, String> {
        Ok(self.topology.clone())
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub topology_sync_interval: Duration,
    pub draining_sweep_interval: Duration,
    pub visibility_extension_interval: Duration,
    pub leak_check_interval: Duration,
    pub warning_cleanup_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            topology_sync_interval: Duration::from_secs(300),
            draining_sweep_interval: Duration::from_secs(10),
            visibility_extension_interval: Duration::from_secs(55),
            leak_check_interval: Duration::from_secs(30),
            warning_cleanup_interval: Duration::from_secs(300),
        }
    }
}

pub struct LifecycleManager {
    shutdown_tx: broadcast::Sender<()>,
}

impl LifecycleManager {
    pub fn start(
        manager: QueueManagerHandle,
        topology_source: Arc<dyn TopologySource>,
        warning_service: Arc<WarningService>,
        config: LifecycleConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Topology sync
        {
            let manager = manager.clone();
            let warning_service = warning_service.clone();
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.topology_sync_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                // The initial topology was applied at wiring time.
                ticker.tick().await;

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            match topology_source.fetch().await {
                                Ok(topology) => {
                                    if manager.update_topology(topology).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "Topology fetch failed; keeping current pools");
                                    warning_service.add_warning(
                                        fc_common::WarningCategory::Configuration,
                                        fc_common::WarningSeverity::Error,
                                        format!("Topology sync failed: {e}"),
                                        "LifecycleManager".to_string(),
                                    );
                                }
                            }
                        }
                        _ = shutdown_rx.recv() => break,
                    }
                }
                debug!("Topology sync task stopped");
            });
        }

        // Draining sweep
        Self::spawn_manager_tick(
            manager.clone(),
            shutdown_tx.subscribe(),
            config.draining_sweep_interval,
            |m| async move { m.sweep_draining().await },
        );

        // Visibility extension
        Self::spawn_manager_tick(
            manager.clone(),
            shutdown_tx.subscribe(),
            config.visibility_extension_interval,
            |m| async move { m.extend_visibility().await },
        );

        // Leak check
        Self::spawn_manager_tick(
            manager,
            shutdown_tx.subscribe(),
            config.leak_check_interval,
            |m| async move { m.leak_check().await },
        );

        // Warning cleanup
        {
            let mut shutdown_rx = shutdown_tx.subscribe();
            let interval = config.warning_cleanup_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => warning_service.cleanup(),
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        info!("Lifecycle timers started");
        Self { shutdown_tx }
    }

    fn spawn_manager_tick<F, Fut>(
        manager: QueueManagerHandle,
        mut shutdown_rx: broadcast::Receiver<()>,
        interval: Duration,
        tick: F,
    ) where
        F: Fn(QueueManagerHandle) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = crate::Result<()>> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tick(manager.clone()).await.is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}
