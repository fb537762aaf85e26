use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;

pub mod logging;
pub mod visibility;

/// Sentinel group used wherever a job or message carries no message group.
///
/// Applied uniformly at every boundary (scheduler grouping, broker publish,
/// pool routing) so the scheduler and router never disagree about which
/// queue a job belongs to.
pub const DEFAULT_MESSAGE_GROUP: &str = "default";

/// Resolve an optional message group to its effective key.
pub fn message_group_or_default(group: Option<&str>) -> &str {
    match group {
        Some(g) if !g.is_empty() => g,
        _ => DEFAULT_MESSAGE_GROUP,
    }
}

// ============================================================================
// Wire envelope
// ============================================================================

/// The envelope carried on the broker between scheduler and router.
///
/// Serialized as camelCase JSON; `batchId` is always null when published and
/// is assigned by the router when a consumed batch is routed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessagePointer {
    pub id: String,
    #[serde(default)]
    pub pool_code: String,
    pub auth_token: Option<String>,
    pub mediation_type: MediationType,
    pub mediation_target: String,
    #[serde(default)]
    pub message_group_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
}

impl MessagePointer {
    /// Effective group key for FIFO tracking.
    pub fn group_key(&self) -> &str {
        message_group_or_default(self.message_group_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MediationType {
    HTTP,
}

// ============================================================================
// Broker messages
// ============================================================================

/// A message handed to a queue backend for publishing.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub message_group_id: Option<String>,
    pub deduplication_id: String,
    pub body: String,
}

/// Result of a publish attempt.
///
/// Broker-side deduplication is reported through `error_message`; callers
/// treat a receipt whose message contains `"Deduplicated"` as success.
#[derive(Debug, Clone, Default)]
pub struct PublishReceipt {
    pub all_published: bool,
    pub error_message: Option<String>,
}

impl PublishReceipt {
    pub fn published() -> Self {
        Self { all_published: true, error_message: None }
    }

    pub fn deduplicated(detail: impl Into<String>) -> Self {
        Self {
            all_published: false,
            error_message: Some(format!("Deduplicated: {}", detail.into())),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { all_published: false, error_message: Some(message.into()) }
    }

    pub fn is_deduplicated(&self) -> bool {
        self.error_message
            .as_deref()
            .map(|m| m.contains("Deduplicated"))
            .unwrap_or(false)
    }

    /// The broker holds the message: either freshly published or deduplicated.
    pub fn accepted(&self) -> bool {
        self.all_published || self.is_deduplicated()
    }
}

/// A raw delivery pulled from a broker.
///
/// The body is opaque at this layer; envelope parsing (and poison-pill
/// handling) belongs to the consumer loop.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Unique per broker delivery (SQS MessageId, `stream:sequence` for
    /// JetStream, row id for the embedded queue).
    pub broker_message_id: String,
    pub receipt_handle: String,
    pub body: String,
    pub delivery_count: u32,
}

/// Disposition of a consumed message, decided by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { delay_seconds: Option<u32> },
    Extend { seconds: u32 },
}

// ============================================================================
// In-flight tracking
// ============================================================================

/// Router-side record of a message between consume and ack/nack.
#[derive(Debug, Clone)]
pub struct InFlightRecord {
    pub message_id: String,
    pub pool_code: String,
    pub message_group_id: Option<String>,
    pub batch_id: Option<String>,
    pub queue_id: String,
    /// Refreshed in place when the broker redelivers the same message.
    pub receipt_handle: String,
    pub submitted_at: Instant,
}

impl InFlightRecord {
    pub fn new(pointer: &MessagePointer, queue_id: String, receipt_handle: String) -> Self {
        Self {
            message_id: pointer.id.clone(),
            pool_code: pointer.pool_code.clone(),
            message_group_id: pointer.message_group_id.clone(),
            batch_id: pointer.batch_id.clone(),
            queue_id,
            receipt_handle,
            submitted_at: Instant::now(),
        }
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.submitted_at.elapsed().as_secs()
    }
}

// ============================================================================
// Topology
// ============================================================================

/// Resource envelope for one processing pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub code: String,
    pub concurrency: u32,
    pub rate_limit_per_minute: Option<u32>,
    /// Total queued messages across all groups; defaults per pool when unset.
    pub queue_capacity: Option<u32>,
}

impl PoolConfig {
    pub fn new(code: impl Into<String>, concurrency: u32) -> Self {
        Self {
            code: code.into(),
            concurrency,
            rate_limit_per_minute: None,
            queue_capacity: None,
        }
    }
}

/// The set of pools the router should be running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterTopology {
    pub pools: Vec<PoolConfig>,
}

/// Point-in-time statistics for one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub pool_code: String,
    pub concurrency: u32,
    pub active_workers: u32,
    pub queue_size: u32,
    pub queue_capacity: u32,
    pub message_group_count: u32,
    pub rate_limit_per_minute: Option<u32>,
    pub is_rate_limited: bool,
}

// ============================================================================
// Mediation outcomes
// ============================================================================

/// Classified result of one mediator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediationResult {
    /// Delivered and positively acknowledged.
    Success,
    /// 4xx poison configuration; acked to stop retries.
    ErrorConfig,
    /// 5xx or negative acknowledgement; retried after a delay.
    ErrorProcess,
    /// Network failure or timeout; retried after a delay.
    ErrorConnection,
}

#[derive(Debug, Clone)]
pub struct MediationOutcome {
    pub result: MediationResult,
    pub delay_seconds: Option<u32>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl MediationOutcome {
    pub fn success(status_code: u16) -> Self {
        Self {
            result: MediationResult::Success,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: None,
        }
    }

    pub fn error_config(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConfig,
            delay_seconds: None,
            status_code: Some(status_code),
            error_message: Some(message.into()),
        }
    }

    pub fn error_process(
        status_code: Option<u16>,
        delay_seconds: Option<u32>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            result: MediationResult::ErrorProcess,
            delay_seconds: Some(
                delay_seconds.unwrap_or(visibility::DEFAULT_RETRY_DELAY_SECS),
            ),
            status_code,
            error_message: Some(message.into()),
        }
    }

    pub fn error_connection(message: impl Into<String>) -> Self {
        Self {
            result: MediationResult::ErrorConnection,
            delay_seconds: Some(visibility::DEFAULT_RETRY_DELAY_SECS),
            status_code: None,
            error_message: Some(message.into()),
        }
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self.result,
            MediationResult::ErrorProcess | MediationResult::ErrorConnection
        )
    }
}

// ============================================================================
// Warnings
// ============================================================================

/// Operational warning categories emitted by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WarningCategory {
    Routing,
    Processing,
    Configuration,
    GroupWorkerRestart,
    RateLimiting,
    QueueHealth,
    ConsumerHealth,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WarningSeverity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Warning {
    pub id: String,
    pub category: WarningCategory,
    pub severity: WarningSeverity,
    pub message: String,
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl Warning {
    pub fn new(
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            severity,
            message,
            source,
            created_at: Utc::now(),
        }
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.created_at).num_minutes()
    }
}
