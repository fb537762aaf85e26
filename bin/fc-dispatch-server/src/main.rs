//! Dispatch pipeline server.
//!
//! Wires the scheduler and the router around one broker backend and one job
//! store. All dependencies are constructed here and passed down; there is
//! no global state.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

use fc_common::RouterTopology;
use fc_config::AppConfig;
use fc_queue::{EmbeddedQueue, QueueConsumer, QueuePublisher};
use fc_router::{
    ConsumerLoop, HeartbeatRegistry, JobProcessor, LifecycleConfig, LifecycleManager,
    QueueManager, StaticTopologySource, WarningService,
};
use fc_router::mediator::{HttpMediator, HttpMediatorConfig};
use fc_scheduler::{DispatchScheduler, SchedulerConfig};
use fc_standby::{LeaderElector, LeaderLeaseConfig, RedisLeaderElection, StaticLeader};
use fc_store::SqliteJobStore;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

struct Broker {
    publisher: Arc<dyn QueuePublisher>,
    consumer: Arc<dyn QueueConsumer>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fc_common::logging::init_logging("fc-dispatch-server");

    let config = AppConfig::load().context("failed to load configuration")?;
    info!(queue_kind = %config.queue.kind, "Starting dispatch pipeline");

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener((
            config.http.host.parse::<std::net::IpAddr>().unwrap_or([0, 0, 0, 0].into()),
            config.http.metrics_port,
        ))
        .install()
        .context("failed to install metrics exporter")?;

    // Job store
    let store_pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            SqliteConnectOptions::from_str(&format!("sqlite://{}", config.store.db_path))
                .context("invalid store db path")?
                .create_if_missing(true),
        )
        .await
        .context("failed to open job store")?;
    let store = Arc::new(SqliteJobStore::new(store_pool));
    store.init_schema().await.context("failed to init job store schema")?;

    // Broker backend
    let broker = build_broker(&config).await?;

    // Leader election
    let (leader, election): (Arc<dyn LeaderElector>, Option<Arc<RedisLeaderElection>>) =
        if config.standby.enabled {
            let mut lease = LeaderLeaseConfig {
                redis_url: config.standby.redis_url.clone(),
                lock_key: config.standby.lock_key.clone(),
                lease_ttl_seconds: config.standby.lease_ttl_seconds,
                refresh_interval_seconds: config.standby.refresh_interval_seconds,
                ..Default::default()
            };
            if !config.standby.instance_id.is_empty() {
                lease.instance_id = config.standby.instance_id.clone();
            }
            let election = Arc::new(
                RedisLeaderElection::new(lease)
                    .await
                    .context("failed to connect leader election")?,
            );
            election.clone().start().await.context("failed to start leader election")?;
            (election.clone(), Some(election))
        } else {
            (Arc::new(StaticLeader), None)
        };

    // Scheduler
    let scheduler_config = SchedulerConfig {
        enabled: config.scheduler.enabled,
        poll_interval: Duration::from_secs(config.scheduler.poll_interval_seconds),
        batch_size: config.scheduler.batch_size,
        max_concurrent_groups: config.scheduler.max_concurrent_groups,
        stale_threshold: Duration::from_secs(
            config.scheduler.stale_queued_threshold_minutes.max(0) as u64 * 60,
        ),
        stale_poll_interval: Duration::from_secs(config.scheduler.stale_queued_poll_interval_seconds),
        default_pool_code: config.scheduler.default_dispatch_pool_code.clone(),
        processing_endpoint: config.scheduler.processing_endpoint.clone(),
        app_key: Some(config.scheduler.app_key.clone()).filter(|k| !k.is_empty()),
    };
    let scheduler = DispatchScheduler::new(
        scheduler_config,
        store.clone(),
        broker.publisher.clone(),
        leader.clone(),
    );
    scheduler.start().await;

    // Router
    let warning_service = Arc::new(WarningService::new());
    let mediator = HttpMediator::new(HttpMediatorConfig {
        signing_secret: Some(config.router.signing_secret.clone()).filter(|s| !s.is_empty()),
        ..Default::default()
    })
    .with_warning_service(warning_service.clone());
    let processor = Arc::new(JobProcessor::new(store.clone(), mediator));

    let topology = RouterTopology {
        pools: config.router.pools.iter().map(Into::into).collect(),
    };

    let (mut manager, manager_handle) = QueueManager::new(
        processor,
        leader.clone(),
        config.scheduler.default_dispatch_pool_code.clone(),
        warning_service.clone(),
    );
    manager.register_consumer(broker.consumer.clone());
    manager.apply_topology(&topology);
    let manager_task = tokio::spawn(manager.run());

    let lifecycle = LifecycleManager::start(
        manager_handle.clone(),
        Arc::new(StaticTopologySource::new(topology)),
        warning_service.clone(),
        LifecycleConfig {
            topology_sync_interval: Duration::from_secs(config.router.topology_sync_interval_seconds),
            ..Default::default()
        },
    );

    // Consumer loops
    let heartbeats = Arc::new(HeartbeatRegistry::new());
    for _ in 0..config.queue.connections.max(1) {
        let consumer_loop = ConsumerLoop::new(
            broker.consumer.clone(),
            manager_handle.clone(),
            heartbeats.clone(),
            warning_service.clone(),
        );
        tokio::spawn(consumer_loop.run(lifecycle.shutdown_sender().subscribe()));
    }

    info!("Dispatch pipeline running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    // Topological shutdown: stop intake, drain pools, then release leases.
    info!("Shutting down");
    scheduler.stop().await;
    broker.consumer.stop().await;
    lifecycle.shutdown();

    if tokio::time::timeout(SHUTDOWN_DEADLINE, manager_handle.shutdown())
        .await
        .is_err()
    {
        warn!("Manager shutdown exceeded deadline; aborting");
    }
    manager_task.abort();

    if let Some(election) = election {
        election.shutdown().await;
    }

    info!("Shutdown complete");
    Ok(())
}

async fn build_broker(config: &AppConfig) -> anyhow::Result<Broker> {
    match config.queue.kind.to_uppercase().as_str() {
        "EMBEDDED" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(5)
                .connect_with(
                    SqliteConnectOptions::from_str(&format!(
                        "sqlite://{}",
                        config.queue.embedded_db_path
                    ))
                    .context("invalid embedded queue db path")?
                    .create_if_missing(true),
                )
                .await
                .context("failed to open embedded queue")?;

            let queue = Arc::new(fc_queue::sqlite::SqliteQueue::new(
                pool,
                "dispatch-queue".to_string(),
                config.queue.visibility_timeout_seconds,
            ));
            queue.init_schema().await.context("failed to init queue schema")?;

            Ok(Broker {
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        "SQS" => {
            let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
            let client = aws_sdk_sqs_client(&aws_config);
            let queue = Arc::new(fc_queue::sqs::SqsQueue::new(
                client,
                config.queue.queue_url.clone(),
                config.queue.visibility_timeout_seconds as i32,
            ));
            Ok(Broker {
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        "NATS" => {
            let queue = Arc::new(
                fc_queue::nats::NatsQueue::connect(
                    &config.queue.queue_url,
                    &config.queue.nats_stream,
                    &config.queue.nats_subject,
                    "fc-dispatch",
                )
                .await
                .context("failed to connect NATS")?,
            );
            Ok(Broker {
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        #[cfg(feature = "activemq")]
        "ACTIVEMQ" => {
            let queue = Arc::new(
                fc_queue::activemq::ActiveMqQueue::connect(fc_queue::activemq::ActiveMqConfig {
                    uri: config.queue.queue_url.clone(),
                    ..Default::default()
                })
                .await
                .context("failed to connect ActiveMQ")?,
            );
            Ok(Broker {
                publisher: queue.clone(),
                consumer: queue,
            })
        }
        other => anyhow::bail!("unsupported queue kind: {other}"),
    }
}

fn aws_sdk_sqs_client(config: &aws_config::SdkConfig) -> fc_queue::sqs::SqsClient {
    fc_queue::sqs::SqsClient::new(config)
}
