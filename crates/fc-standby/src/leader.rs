//! Redis lease-based leader election.
//!
//! Acquisition is a single `SET key instance NX EX ttl`; extension and
//! release are Lua check-and-act scripts so a lease can only be touched by
//! the instance that owns it. The refresh interval must stay well under the
//! TTL or leadership flaps on every slow tick.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Result, StandbyError};

/// Single-writer gate checked at the start of every scheduled tick.
pub trait LeaderElector: Send + Sync {
    fn is_leader(&self) -> bool;

    fn instance_id(&self) -> &str;
}

/// Always-primary elector for single-instance deployments.
pub struct StaticLeader;

impl LeaderElector for StaticLeader {
    fn is_leader(&self) -> bool {
        true
    }

    fn instance_id(&self) -> &str {
        "standalone"
    }
}

#[derive(Debug, Clone)]
pub struct LeaderLeaseConfig {
    pub redis_url: String,
    pub lock_key: String,
    pub lease_ttl_seconds: u64,
    pub refresh_interval_seconds: u64,
    pub instance_id: String,
}

impl Default for LeaderLeaseConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            lock_key: "fc:dispatch:leader".to_string(),
            lease_ttl_seconds: 30,
            refresh_interval_seconds: 10,
            instance_id: Uuid::new_v4().to_string(),
        }
    }
}

pub struct RedisLeaderElection {
    config: LeaderLeaseConfig,
    conn: ConnectionManager,
    is_leader: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl RedisLeaderElection {
    pub async fn new(config: LeaderLeaseConfig) -> Result<Self> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| StandbyError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            conn,
            is_leader: AtomicBool::new(false),
            running: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(StandbyError::AlreadyRunning);
        }

        info!(
            instance_id = %self.config.instance_id,
            lock_key = %self.config.lock_key,
            ttl = self.config.lease_ttl_seconds,
            "Starting leader election"
        );

        let election = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                election.config.refresh_interval_seconds,
            ));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        election.election_tick().await;
                    }
                    _ = shutdown_rx.recv() => {
                        election.release_lease().await;
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn election_tick(&self) {
        let mut conn = self.conn.clone();

        if self.is_leader.load(Ordering::SeqCst) {
            match self.extend_lease(&mut conn).await {
                Ok(true) => {
                    debug!(instance_id = %self.config.instance_id, "Lease extended");
                }
                Ok(false) => {
                    warn!(instance_id = %self.config.instance_id, "Lost leadership");
                    self.is_leader.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    error!(error = %e, "Lease extension failed; stepping down");
                    self.is_leader.store(false, Ordering::SeqCst);
                }
            }
        } else {
            match self.try_acquire(&mut conn).await {
                Ok(true) => {
                    info!(instance_id = %self.config.instance_id, "Acquired leadership");
                    self.is_leader.store(true, Ordering::SeqCst);
                }
                Ok(false) => {
                    debug!(instance_id = %self.config.instance_id, "Lease held elsewhere");
                }
                Err(e) => {
                    error!(error = %e, "Leadership acquisition failed");
                }
            }
        }
    }

    async fn try_acquire(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let result: Option<String> = redis::cmd("SET")
            .arg(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.config.lease_ttl_seconds)
            .query_async(conn)
            .await?;

        Ok(result.is_some())
    }

    async fn extend_lease(&self, conn: &mut ConnectionManager) -> Result<bool> {
        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("EXPIRE", KEYS[1], ARGV[2])
                return 1
            else
                return 0
            end
        "#;

        let result: i32 = redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .arg(self.config.lease_ttl_seconds)
            .invoke_async(conn)
            .await?;

        Ok(result == 1)
    }

    async fn release_lease(&self) {
        if !self.is_leader.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut conn = self.conn.clone();
        let script = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                redis.call("DEL", KEYS[1])
                return 1
            else
                return 0
            end
        "#;

        match redis::Script::new(script)
            .key(&self.config.lock_key)
            .arg(&self.config.instance_id)
            .invoke_async::<i32>(&mut conn)
            .await
        {
            Ok(1) => info!(instance_id = %self.config.instance_id, "Released leadership"),
            Ok(_) => debug!("Lease was already gone"),
            Err(e) => error!(error = %e, "Failed to release lease"),
        }
    }

    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
    }
}

impl LeaderElector for RedisLeaderElection {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn instance_id(&self) -> &str {
        &self.config.instance_id
    }
}
