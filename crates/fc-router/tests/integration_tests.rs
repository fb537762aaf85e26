//! Full pipeline: scheduler drains jobs into the embedded queue, the
//! consumer loop feeds the manager, pools mediate against a local HTTP
//! target, and job statuses land in the store.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::broadcast;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use fc_common::{PoolConfig, QueueMessage, RouterTopology};
use fc_queue::sqlite::SqliteQueue;
use fc_queue::{EmbeddedQueue, QueuePublisher};
use fc_router::mediator::{HttpMediator, HttpMediatorConfig, ID_HEADER};
use fc_router::{
    ConsumerLoop, HeartbeatRegistry, JobProcessor, QueueManager, WarningService,
};
use fc_scheduler::{DispatchScheduler, SchedulerConfig};
use fc_standby::StaticLeader;
use fc_store::{DispatchJob, DispatchStatus, JobStore, SqliteJobStore};

struct Pipeline {
    store: Arc<SqliteJobStore>,
    queue: Arc<SqliteQueue>,
    scheduler: DispatchScheduler,
    shutdown_tx: broadcast::Sender<()>,
}

async fn start_pipeline() -> Pipeline {
    let store_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = Arc::new(SqliteJobStore::new(store_pool));
    store.init_schema().await.unwrap();

    let queue_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let queue = Arc::new(SqliteQueue::new(queue_pool, "dispatch-queue".to_string(), 120));
    queue.init_schema().await.unwrap();

    let scheduler_config = SchedulerConfig {
        poll_interval: Duration::from_millis(100),
        app_key: Some("integration-key".to_string()),
        ..Default::default()
    };
    let scheduler = DispatchScheduler::new(
        scheduler_config,
        store.clone(),
        queue.clone() as Arc<dyn QueuePublisher>,
        Arc::new(StaticLeader),
    );
    scheduler.start().await;

    let warning_service = Arc::new(WarningService::new());
    let mediator = HttpMediator::new(HttpMediatorConfig::default());
    let processor = Arc::new(JobProcessor::new(store.clone(), mediator));

    let (mut manager, handle) = QueueManager::new(
        processor,
        Arc::new(StaticLeader),
        "DISPATCH-POOL".to_string(),
        warning_service.clone(),
    );
    manager.register_consumer(queue.clone());
    manager.apply_topology(&RouterTopology {
        pools: vec![PoolConfig::new("DISPATCH-POOL", 5)],
    });
    tokio::spawn(manager.run());

    let (shutdown_tx, _) = broadcast::channel(1);
    let consumer_loop = ConsumerLoop::new(
        queue.clone(),
        handle,
        Arc::new(HeartbeatRegistry::new()),
        warning_service,
    );
    tokio::spawn(consumer_loop.run(shutdown_tx.subscribe()));

    Pipeline {
        store,
        queue,
        scheduler,
        shutdown_tx,
    }
}

impl Pipeline {
    async fn stop(&self) {
        self.scheduler.stop().await;
        let _ = self.shutdown_tx.send(());
    }

    async fn wait_for_status(&self, id: &str, status: DispatchStatus, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(job)) = self.store.get(id).await {
                if job.status == status {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }
}

fn job(id: &str, group: &str, target: &str, offset_ms: i64) -> DispatchJob {
    let mut job = DispatchJob::new(id, target, r#"{"event":"test"}"#);
    job.message_group = Some(group.to_string());
    job.data_only = true;
    job.created_at = chrono::Utc::now() + chrono::Duration::milliseconds(offset_ms);
    job
}

#[tokio::test]
async fn jobs_flow_end_to_end_in_group_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = start_pipeline().await;
    let target = format!("{}/hook", server.uri());

    for (i, id) in ["A", "B", "C", "D", "E"].iter().enumerate() {
        pipeline
            .store
            .insert(&job(id, "G", &target, i as i64))
            .await
            .unwrap();
    }

    for id in ["A", "B", "C", "D", "E"] {
        assert!(
            pipeline.wait_for_status(id, DispatchStatus::Completed, 10_000).await,
            "job {id} did not complete"
        );
    }

    // Strict FIFO at the webhook: delivery order matches insertion order.
    let requests = server.received_requests().await.unwrap();
    let delivered: Vec<String> = requests
        .iter()
        .map(|r| r.headers.get(ID_HEADER).unwrap().to_str().unwrap().to_string())
        .collect();
    assert_eq!(delivered, vec!["A", "B", "C", "D", "E"]);

    // Attempt history recorded for each job.
    let job = pipeline.store.get("A").await.unwrap().unwrap();
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.status_code, Some(200));

    pipeline.stop().await;
}

#[tokio::test]
async fn poison_target_lands_job_in_error_without_redelivery() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let pipeline = start_pipeline().await;
    let target = format!("{}/hook", server.uri());

    pipeline.store.insert(&job("P1", "G", &target, 0)).await.unwrap();

    assert!(pipeline.wait_for_status("P1", DispatchStatus::Error, 10_000).await);

    let stored = pipeline.store.get("P1").await.unwrap().unwrap();
    assert_eq!(stored.status_code, Some(404));
    assert_eq!(stored.attempt_count, 1);

    // The message was acked, not parked for retry.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let depth = fc_queue::QueueConsumer::query_metrics(pipeline.queue.as_ref())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(depth.pending + depth.invisible, 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn malformed_envelope_is_acked_and_never_routed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = start_pipeline().await;

    pipeline
        .queue
        .publish(QueueMessage {
            message_id: "garbage".to_string(),
            message_group_id: None,
            deduplication_id: "garbage".to_string(),
            body: "this is not an envelope".to_string(),
        })
        .await
        .unwrap();

    // The poison message is removed from the queue without a webhook call.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let depth = fc_queue::QueueConsumer::query_metrics(pipeline.queue.as_ref())
            .await
            .unwrap()
            .unwrap();
        if depth.pending + depth.invisible == 0 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "poison message was not drained"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert!(server.received_requests().await.unwrap().is_empty());
    pipeline.stop().await;
}

#[tokio::test]
async fn completed_jobs_survive_duplicate_deliveries() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let pipeline = start_pipeline().await;
    let target = format!("{}/hook", server.uri());

    pipeline.store.insert(&job("D1", "G", &target, 0)).await.unwrap();
    assert!(pipeline.wait_for_status("D1", DispatchStatus::Completed, 10_000).await);

    // A duplicate of the already-completed job arrives (e.g. operator
    // republish outside the dedup window); it is acked without another
    // webhook call.
    let calls_before = server.received_requests().await.unwrap().len();
    pipeline
        .queue
        .publish(QueueMessage {
            message_id: "D1".to_string(),
            message_group_id: Some("G".to_string()),
            deduplication_id: "D1-replay".to_string(),
            body: serde_json::to_string(&fc_common::MessagePointer {
                id: "D1".to_string(),
                pool_code: "DISPATCH-POOL".to_string(),
                auth_token: None,
                mediation_type: fc_common::MediationType::HTTP,
                mediation_target: target.clone(),
                message_group_id: Some("G".to_string()),
                batch_id: None,
            })
            .unwrap(),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(server.received_requests().await.unwrap().len(), calls_before);

    let stored = pipeline.store.get("D1").await.unwrap().unwrap();
    assert_eq!(stored.status, DispatchStatus::Completed);

    pipeline.stop().await;
}
