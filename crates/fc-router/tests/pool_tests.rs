//! Process pool behavior: per-group FIFO, concurrency bounds, rate-limit
//! fast-fail, and batch+group retry ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use fc_common::{
    Disposition, MediationOutcome, MediationType, MessagePointer, PoolConfig,
};
use fc_router::pool::{PoolCompletion, PoolTask, ProcessPool, SubmitResult};
use fc_router::Mediator;

/// Mediator with programmable outcomes, recording invocation order.
struct ScriptedMediator {
    outcomes: parking_lot::Mutex<HashMap<String, MediationOutcome>>,
    calls: parking_lot::Mutex<Vec<String>>,
    delay_ms: u64,
    concurrent: AtomicU32,
    peak_concurrent: AtomicU32,
}

impl ScriptedMediator {
    fn new(delay_ms: u64) -> Self {
        Self {
            outcomes: parking_lot::Mutex::new(HashMap::new()),
            calls: parking_lot::Mutex::new(Vec::new()),
            delay_ms,
            concurrent: AtomicU32::new(0),
            peak_concurrent: AtomicU32::new(0),
        }
    }

    fn script(&self, message_id: &str, outcome: MediationOutcome) {
        self.outcomes.lock().insert(message_id.to_string(), outcome);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl Mediator for ScriptedMediator {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_concurrent.fetch_max(now, Ordering::SeqCst);

        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.calls.lock().push(pointer.id.clone());
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        self.outcomes
            .lock()
            .get(&pointer.id)
            .cloned()
            .unwrap_or_else(|| MediationOutcome::success(200))
    }
}

fn pointer(id: &str, group: Option<&str>, batch: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "TEST-POOL".to_string(),
        auth_token: None,
        mediation_type: MediationType::HTTP,
        mediation_target: "http://localhost/hook".to_string(),
        message_group_id: group.map(|s| s.to_string()),
        batch_id: batch.map(|s| s.to_string()),
    }
}

fn task(id: &str, group: Option<&str>, batch: Option<&str>) -> PoolTask {
    PoolTask {
        pointer: pointer(id, group, batch),
        broker_message_id: format!("broker-{id}"),
    }
}

fn make_pool(
    config: PoolConfig,
    mediator: Arc<ScriptedMediator>,
) -> (Arc<ProcessPool>, mpsc::Receiver<PoolCompletion>) {
    let (tx, rx) = mpsc::channel(256);
    let pool = Arc::new(ProcessPool::new(config, mediator, tx));
    pool.start();
    (pool, rx)
}

async fn collect_completions(
    rx: &mut mpsc::Receiver<PoolCompletion>,
    count: usize,
) -> HashMap<String, Disposition> {
    let mut completions = HashMap::new();
    for _ in 0..count {
        let completion = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("completion channel closed");
        completions.insert(completion.broker_message_id, completion.disposition);
    }
    completions
}

#[tokio::test]
async fn single_group_is_strict_fifo() {
    let mediator = Arc::new(ScriptedMediator::new(10));
    let (pool, mut rx) = make_pool(PoolConfig::new("TEST-POOL", 5), mediator.clone());

    for id in ["A", "B", "C", "D", "E"] {
        let result = pool.submit(task(id, Some("G"), Some("1")));
        assert_eq!(result, SubmitResult::Accepted);
    }

    let completions = collect_completions(&mut rx, 5).await;
    assert_eq!(mediator.calls(), vec!["A", "B", "C", "D", "E"]);
    assert!(completions.values().all(|d| *d == Disposition::Ack));
}

#[tokio::test]
async fn groups_run_in_parallel_up_to_concurrency() {
    let mediator = Arc::new(ScriptedMediator::new(50));
    let (pool, mut rx) = make_pool(PoolConfig::new("TEST-POOL", 3), mediator.clone());

    for i in 0..5 {
        let id = format!("M{i}");
        let group = format!("G{i}");
        assert_eq!(
            pool.submit(task(&id, Some(&group), Some("1"))),
            SubmitResult::Accepted
        );
    }

    let completions = collect_completions(&mut rx, 5).await;
    assert_eq!(completions.len(), 5);

    let peak = mediator.peak_concurrent.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak concurrency {peak} exceeded semaphore width");
    assert!(peak >= 2, "groups never overlapped; expected parallelism");
}

#[tokio::test]
async fn retriable_failure_fast_fails_batch_group_siblings() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    mediator.script(
        "M1",
        MediationOutcome::error_process(Some(500), None, "upstream down"),
    );
    let (pool, mut rx) = make_pool(PoolConfig::new("TEST-POOL", 5), mediator.clone());

    for id in ["M1", "M2", "M3"] {
        assert_eq!(
            pool.submit(task(id, Some("G"), Some("B"))),
            SubmitResult::Accepted
        );
    }

    let completions = collect_completions(&mut rx, 3).await;

    // Only the first message reached the mediator.
    assert_eq!(mediator.calls(), vec!["M1"]);

    assert_eq!(
        completions["broker-M1"],
        Disposition::Nack { delay_seconds: Some(120) }
    );
    assert_eq!(
        completions["broker-M2"],
        Disposition::Nack { delay_seconds: Some(10) }
    );
    assert_eq!(
        completions["broker-M3"],
        Disposition::Nack { delay_seconds: Some(10) }
    );

    // Redelivery arrives under a fresh batch id and the target recovered:
    // the cleared batch+group state lets everything through.
    mediator.script("M1", MediationOutcome::success(200));
    for id in ["M1", "M2", "M3"] {
        assert_eq!(
            pool.submit(task(id, Some("G"), Some("B2"))),
            SubmitResult::Accepted
        );
    }

    let completions = collect_completions(&mut rx, 3).await;
    assert!(completions.values().all(|d| *d == Disposition::Ack));
    assert_eq!(mediator.calls(), vec!["M1", "M1", "M2", "M3"]);
}

#[tokio::test]
async fn failure_in_one_batch_does_not_gate_other_groups_or_batches() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    mediator.script(
        "BAD",
        MediationOutcome::error_connection("connection refused"),
    );
    let (pool, mut rx) = make_pool(PoolConfig::new("TEST-POOL", 5), mediator.clone());

    pool.submit(task("BAD", Some("G1"), Some("B")));
    pool.submit(task("OTHER-GROUP", Some("G2"), Some("B")));
    pool.submit(task("OTHER-BATCH", Some("G1"), Some("B9")));

    let completions = collect_completions(&mut rx, 3).await;
    assert!(matches!(
        completions["broker-BAD"],
        Disposition::Nack { delay_seconds: Some(120) }
    ));
    assert_eq!(completions["broker-OTHER-GROUP"], Disposition::Ack);
    assert_eq!(completions["broker-OTHER-BATCH"], Disposition::Ack);
}

#[tokio::test]
async fn explicit_delay_from_outcome_is_clamped_and_used() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    mediator.script(
        "M1",
        MediationOutcome::error_process(Some(503), Some(100_000), "overloaded"),
    );
    let (pool, mut rx) = make_pool(PoolConfig::new("TEST-POOL", 2), mediator);

    pool.submit(task("M1", Some("G"), Some("B")));
    let completions = collect_completions(&mut rx, 1).await;
    assert_eq!(
        completions["broker-M1"],
        Disposition::Nack { delay_seconds: Some(43_200) }
    );
}

#[tokio::test]
async fn rate_limited_messages_fast_fail_without_mediation() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    let config = PoolConfig {
        code: "TEST-POOL".to_string(),
        concurrency: 5,
        rate_limit_per_minute: Some(1),
        queue_capacity: None,
    };
    let (pool, mut rx) = make_pool(config, mediator.clone());

    pool.submit(task("FIRST", Some("G1"), Some("B")));
    let first = collect_completions(&mut rx, 1).await;
    assert_eq!(first["broker-FIRST"], Disposition::Ack);

    // The single token for this minute is spent; the next message must not
    // reach the mediator or hold a permit.
    pool.submit(task("SECOND", Some("G2"), Some("B")));
    let second = collect_completions(&mut rx, 1).await;
    assert_eq!(
        second["broker-SECOND"],
        Disposition::Nack { delay_seconds: Some(10) }
    );
    assert_eq!(mediator.calls(), vec!["FIRST"]);
}

#[tokio::test]
async fn queue_capacity_rejects_excess_submits() {
    let mediator = Arc::new(ScriptedMediator::new(200));
    let config = PoolConfig {
        code: "TEST-POOL".to_string(),
        concurrency: 1,
        rate_limit_per_minute: None,
        queue_capacity: Some(2),
    };
    let (pool, mut rx) = make_pool(config, mediator);

    assert_eq!(
        pool.submit(task("A", Some("G"), None)),
        SubmitResult::Accepted
    );
    // Let the worker pick A up so it is mediating, not queued.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        pool.submit(task("B", Some("G"), None)),
        SubmitResult::Accepted
    );
    assert_eq!(
        pool.submit(task("C", Some("G"), None)),
        SubmitResult::Accepted
    );
    // Two messages queued behind the in-flight one: capacity reached.
    assert_eq!(
        pool.submit(task("D", Some("G"), None)),
        SubmitResult::RejectedCapacity
    );

    let completions = collect_completions(&mut rx, 3).await;
    assert!(completions.values().all(|d| *d == Disposition::Ack));
}

#[tokio::test]
async fn stopped_pool_rejects_submits() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    let (pool, _rx) = make_pool(PoolConfig::new("TEST-POOL", 2), mediator);

    pool.drain();
    assert_eq!(
        pool.submit(task("A", Some("G"), None)),
        SubmitResult::RejectedStopped
    );
}

#[tokio::test]
async fn concurrency_updates_apply_in_place() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    let (pool, _rx) = make_pool(PoolConfig::new("TEST-POOL", 4), mediator);

    assert!(pool.update_concurrency(8).await);
    assert_eq!(pool.concurrency(), 8);

    // Idle pool: permits are free, so a decrease succeeds immediately.
    assert!(pool.update_concurrency(2).await);
    assert_eq!(pool.concurrency(), 2);

    assert!(!pool.update_concurrency(0).await);
    assert_eq!(pool.concurrency(), 2);
}

#[tokio::test]
async fn rate_limit_can_be_replaced_live() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    let config = PoolConfig {
        code: "TEST-POOL".to_string(),
        concurrency: 2,
        rate_limit_per_minute: Some(1),
        queue_capacity: None,
    };
    let (pool, mut rx) = make_pool(config, mediator.clone());

    pool.submit(task("A", Some("G1"), None));
    collect_completions(&mut rx, 1).await;

    // Token spent; removing the limit lets traffic flow again.
    pool.update_rate_limit(None);
    assert_eq!(pool.rate_limit_per_minute(), None);

    pool.submit(task("B", Some("G2"), None));
    let completions = collect_completions(&mut rx, 1).await;
    assert_eq!(completions["broker-B"], Disposition::Ack);
}

#[tokio::test]
async fn snapshot_reflects_configuration() {
    let mediator = Arc::new(ScriptedMediator::new(0));
    let config = PoolConfig {
        code: "TEST-POOL".to_string(),
        concurrency: 7,
        rate_limit_per_minute: Some(600),
        queue_capacity: Some(40),
    };
    let (pool, _rx) = make_pool(config, mediator);

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.pool_code, "TEST-POOL");
    assert_eq!(snapshot.concurrency, 7);
    assert_eq!(snapshot.queue_capacity, 40);
    assert_eq!(snapshot.rate_limit_per_minute, Some(600));
    assert_eq!(snapshot.active_workers, 0);
}
