//! Queue manager actor tests: routing, redelivery dedup, pool fallback,
//! standby release, and pool draining.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use fc_common::{
    BrokerMessage, MediationOutcome, MediationType, MessagePointer, PoolConfig, RouterTopology,
};
use fc_queue::{QueueConsumer, QueueDepth, Result as QueueResult};
use fc_router::manager::{ConsumedMessage, QueueManager, QueueManagerHandle};
use fc_router::{Mediator, WarningService};
use fc_standby::{LeaderElector, StaticLeader};

/// Consumer that records broker operations.
struct RecordingConsumer {
    id: String,
    acked: parking_lot::Mutex<Vec<String>>,
    nacked: parking_lot::Mutex<Vec<(String, u32)>>,
    extended: parking_lot::Mutex<Vec<(String, u32)>>,
    fail_next_acks: AtomicU32,
    running: AtomicBool,
}

impl RecordingConsumer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            acked: parking_lot::Mutex::new(Vec::new()),
            nacked: parking_lot::Mutex::new(Vec::new()),
            extended: parking_lot::Mutex::new(Vec::new()),
            fail_next_acks: AtomicU32::new(0),
            running: AtomicBool::new(true),
        }
    }

    fn acked(&self) -> Vec<String> {
        self.acked.lock().clone()
    }

    fn nacked(&self) -> Vec<(String, u32)> {
        self.nacked.lock().clone()
    }
}

#[async_trait]
impl QueueConsumer for RecordingConsumer {
    fn identifier(&self) -> &str {
        &self.id
    }

    async fn fetch(&self, _max: u32, _timeout: Duration) -> QueueResult<Vec<BrokerMessage>> {
        Ok(Vec::new())
    }

    async fn ack(&self, receipt_handle: &str) -> QueueResult<()> {
        if self.fail_next_acks.load(Ordering::SeqCst) > 0 {
            self.fail_next_acks.fetch_sub(1, Ordering::SeqCst);
            return Err(fc_queue::QueueError::NotFound(receipt_handle.to_string()));
        }
        self.acked.lock().push(receipt_handle.to_string());
        Ok(())
    }

    async fn nack_with_delay(&self, receipt_handle: &str, delay_seconds: u32) -> QueueResult<()> {
        self.nacked.lock().push((receipt_handle.to_string(), delay_seconds));
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> QueueResult<()> {
        self.extended.lock().push((receipt_handle.to_string(), seconds));
        Ok(())
    }

    async fn query_metrics(&self) -> QueueResult<Option<QueueDepth>> {
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

struct BlockingMediator {
    delay_ms: u64,
    calls: parking_lot::Mutex<Vec<String>>,
}

impl BlockingMediator {
    fn new(delay_ms: u64) -> Self {
        Self {
            delay_ms,
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Mediator for BlockingMediator {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.calls.lock().push(pointer.id.clone());
        MediationOutcome::success(200)
    }
}

struct Follower;

impl LeaderElector for Follower {
    fn is_leader(&self) -> bool {
        false
    }

    fn instance_id(&self) -> &str {
        "follower"
    }
}

fn consumed(id: &str, pool: &str, group: Option<&str>, receipt: &str) -> ConsumedMessage {
    ConsumedMessage {
        pointer: MessagePointer {
            id: id.to_string(),
            pool_code: pool.to_string(),
            auth_token: None,
            mediation_type: MediationType::HTTP,
            mediation_target: "http://localhost/hook".to_string(),
            message_group_id: group.map(|s| s.to_string()),
            batch_id: None,
        },
        broker_message_id: format!("broker-{id}"),
        receipt_handle: receipt.to_string(),
    }
}

fn start_manager(
    mediator: Arc<dyn Mediator>,
    leader: Arc<dyn LeaderElector>,
    consumer: Arc<RecordingConsumer>,
    pools: Vec<PoolConfig>,
) -> QueueManagerHandle {
    let (mut manager, handle) = QueueManager::new(
        mediator,
        leader,
        "DISPATCH-POOL".to_string(),
        Arc::new(WarningService::new()),
    );
    manager.register_consumer(consumer);
    manager.apply_topology(&RouterTopology { pools });
    tokio::spawn(manager.run());
    handle
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn routed_message_is_mediated_and_acked() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(0)),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "DISPATCH-POOL", None, "r1")])
        .await
        .unwrap();

    assert!(wait_for(|| consumer.acked() == vec!["r1".to_string()], 2000).await);

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test]
async fn redelivery_refreshes_receipt_and_returns_duplicate() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(300)),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "DISPATCH-POOL", None, "r-old")])
        .await
        .unwrap();

    // Broker redelivers the same broker message id with a fresh handle
    // while the original is still mediating.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "DISPATCH-POOL", None, "r-new")])
        .await
        .unwrap();

    // The duplicate is returned with zero delay...
    assert!(wait_for(|| consumer.nacked().iter().any(|(h, d)| h == "r-new" && *d == 0), 1000).await);

    // ...and the eventual ack uses the refreshed handle, not the stale one.
    assert!(wait_for(|| consumer.acked() == vec!["r-new".to_string()], 2000).await);
}

#[tokio::test]
async fn unknown_pool_routes_to_default() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(0)),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "NO-SUCH-POOL", None, "r1")])
        .await
        .unwrap();

    assert!(wait_for(|| consumer.acked() == vec!["r1".to_string()], 2000).await);

    let snapshot = handle.snapshot().await.unwrap();
    let codes: Vec<_> = snapshot.pools.iter().map(|p| p.pool_code.clone()).collect();
    assert_eq!(codes, vec!["DISPATCH-POOL".to_string()]);
}

#[tokio::test]
async fn standby_instance_releases_batches_untouched() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let mediator = Arc::new(BlockingMediator::new(0));
    let handle = start_manager(
        mediator.clone(),
        Arc::new(Follower),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch(
            "q1".to_string(),
            vec![
                consumed("J1", "DISPATCH-POOL", None, "r1"),
                consumed("J2", "DISPATCH-POOL", None, "r2"),
            ],
        )
        .await
        .unwrap();

    assert!(wait_for(|| consumer.nacked().len() == 2, 2000).await);
    assert!(mediator.calls.lock().is_empty());
    assert!(consumer.acked().is_empty());
}

#[tokio::test]
async fn failed_ack_is_retried_on_redelivery() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    consumer.fail_next_acks.store(1, Ordering::SeqCst);

    let mediator = Arc::new(BlockingMediator::new(0));
    let handle = start_manager(
        mediator.clone(),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "DISPATCH-POOL", None, "r1")])
        .await
        .unwrap();

    // First ack fails (expired handle); the manager records the broker id.
    assert!(wait_for(|| mediator.calls.lock().len() == 1, 2000).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(consumer.acked().is_empty());

    // The broker redelivers; the manager deletes it without re-mediating.
    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "DISPATCH-POOL", None, "r2")])
        .await
        .unwrap();

    assert!(wait_for(|| consumer.acked() == vec!["r2".to_string()], 2000).await);
    assert_eq!(mediator.calls.lock().len(), 1);
}

#[tokio::test]
async fn removed_pool_drains_and_is_swept_after_inflight_completes() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(200)),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![
            PoolConfig::new("DISPATCH-POOL", 5),
            PoolConfig::new("EXTRA-POOL", 5),
        ],
    );

    handle
        .route_batch("q1".to_string(), vec![consumed("J1", "EXTRA-POOL", None, "r1")])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Drop EXTRA-POOL from the topology while its message is in flight.
    handle
        .update_topology(RouterTopology {
            pools: vec![PoolConfig::new("DISPATCH-POOL", 5)],
        })
        .await
        .unwrap();

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.draining_pools, vec!["EXTRA-POOL".to_string()]);

    // A draining pool with in-flight work survives a sweep.
    handle.sweep_draining().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.draining_pools, vec!["EXTRA-POOL".to_string()]);

    // Once the message completes, the sweep undeploys it.
    assert!(wait_for(|| consumer.acked() == vec!["r1".to_string()], 2000).await);
    handle.sweep_draining().await.unwrap();
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.draining_pools.is_empty());
}

#[tokio::test]
async fn live_topology_update_changes_pool_limits() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(0)),
        Arc::new(StaticLeader),
        consumer,
        vec![PoolConfig {
            code: "DISPATCH-POOL".to_string(),
            concurrency: 5,
            rate_limit_per_minute: None,
            queue_capacity: None,
        }],
    );

    handle
        .update_topology(RouterTopology {
            pools: vec![PoolConfig {
                code: "DISPATCH-POOL".to_string(),
                concurrency: 8,
                rate_limit_per_minute: Some(120),
                queue_capacity: None,
            }],
        })
        .await
        .unwrap();

    assert!(
        wait_for_snapshot(&handle, |s| {
            s.pools
                .iter()
                .any(|p| p.concurrency == 8 && p.rate_limit_per_minute == Some(120))
        })
        .await
    );
}

async fn wait_for_snapshot<F>(handle: &QueueManagerHandle, condition: F) -> bool
where
    F: Fn(&fc_router::ManagerSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if let Ok(snapshot) = handle.snapshot().await {
            if condition(&snapshot) {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn visibility_extension_touches_all_in_flight() {
    let consumer = Arc::new(RecordingConsumer::new("q1"));
    let handle = start_manager(
        Arc::new(BlockingMediator::new(300)),
        Arc::new(StaticLeader),
        consumer.clone(),
        vec![PoolConfig::new("DISPATCH-POOL", 5)],
    );

    handle
        .route_batch(
            "q1".to_string(),
            vec![
                consumed("J1", "DISPATCH-POOL", Some("g1"), "r1"),
                consumed("J2", "DISPATCH-POOL", Some("g2"), "r2"),
            ],
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    handle.extend_visibility().await.unwrap();

    assert!(
        wait_for(
            || {
                let extended = consumer.extended.lock();
                extended.iter().any(|(h, s)| h == "r1" && *s == 120)
                    && extended.iter().any(|(h, s)| h == "r2" && *s == 120)
            },
            1000
        )
        .await
    );
}
