//! Persisted dispatch jobs.
//!
//! Jobs are written by producers (outbox ingestion, admin APIs — out of
//! scope here) and drained by the scheduler. The store owns every status
//! transition; in-memory components never mutate job state directly.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteJobStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Illegal status transition for {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: String,
        from: DispatchStatus,
        to: DispatchStatus,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Error,
    Cancelled,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Pending => "PENDING",
            DispatchStatus::Queued => "QUEUED",
            DispatchStatus::InProgress => "IN_PROGRESS",
            DispatchStatus::Completed => "COMPLETED",
            DispatchStatus::Error => "ERROR",
            DispatchStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "QUEUED" => DispatchStatus::Queued,
            "IN_PROGRESS" => DispatchStatus::InProgress,
            "COMPLETED" => DispatchStatus::Completed,
            "ERROR" => DispatchStatus::Error,
            "CANCELLED" => DispatchStatus::Cancelled,
            _ => DispatchStatus::Pending,
        }
    }

    /// Legal transitions: PENDING -> QUEUED -> IN_PROGRESS -> {COMPLETED,
    /// ERROR}; ERROR -> PENDING (retry); {QUEUED, IN_PROGRESS} -> PENDING
    /// (recovery); CANCELLED from any non-terminal state.
    pub fn can_transition_to(&self, next: DispatchStatus) -> bool {
        use DispatchStatus::*;
        match (self, next) {
            (Pending, Queued) => true,
            (Queued, InProgress) => true,
            (InProgress, Completed) | (InProgress, Error) => true,
            (Error, Pending) => true,
            (Queued, Pending) | (InProgress, Pending) => true,
            (Completed, _) | (Cancelled, _) => false,
            (_, Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchStatus::Completed | DispatchStatus::Cancelled)
    }
}

/// How a job interacts with its group's error state at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    #[default]
    Immediate,
    NextOnError,
    BlockOnError,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Immediate => "IMMEDIATE",
            DispatchMode::NextOnError => "NEXT_ON_ERROR",
            DispatchMode::BlockOnError => "BLOCK_ON_ERROR",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "NEXT_ON_ERROR" => DispatchMode::NextOnError,
            "BLOCK_ON_ERROR" => DispatchMode::BlockOnError,
            _ => DispatchMode::Immediate,
        }
    }
}

/// One delivery attempt, appended to the job's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub attempt_number: i32,
    pub attempted_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub duration_ms: i64,
    pub error: Option<String>,
}

/// A persisted dispatch job.
#[derive(Debug, Clone)]
pub struct DispatchJob {
    /// Sortable, timestamp-prefixed id. Case-insensitive: stored uppercase.
    pub id: String,
    pub message_group: Option<String>,
    /// Lower dispatches first; ties broken by created_at.
    pub sequence: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub queued_at: Option<DateTime<Utc>>,
    pub status: DispatchStatus,
    pub mode: DispatchMode,
    pub dispatch_pool_id: Option<String>,
    pub dispatch_pool_code: Option<String>,
    pub target_url: String,
    pub payload: String,
    pub payload_content_type: String,
    pub data_only: bool,
    pub timeout_seconds: u32,
    pub max_retries: u32,
    pub service_account_id: Option<String>,
    pub subscription_id: Option<String>,
    pub client_id: Option<String>,
    pub status_code: Option<u16>,
    pub last_error: Option<String>,
    pub attempt_count: i32,
}

impl DispatchJob {
    /// Minimal job for tests and producers; everything else defaulted.
    pub fn new(id: impl Into<String>, target_url: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            id: id.into().to_uppercase(),
            message_group: None,
            sequence: 99,
            created_at: Utc::now(),
            updated_at: None,
            queued_at: None,
            status: DispatchStatus::Pending,
            mode: DispatchMode::Immediate,
            dispatch_pool_id: None,
            dispatch_pool_code: None,
            target_url: target_url.into(),
            payload: payload.into(),
            payload_content_type: "application/json".to_string(),
            data_only: false,
            timeout_seconds: 30,
            max_retries: 3,
            service_account_id: None,
            subscription_id: None,
            client_id: None,
            status_code: None,
            last_error: None,
            attempt_count: 0,
        }
    }

    pub fn group_key(&self) -> &str {
        fc_common::message_group_or_default(self.message_group.as_deref())
    }
}

/// Store operations the pipeline needs. One implementation per database.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &DispatchJob) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<DispatchJob>>;

    /// PENDING jobs ordered by (sequence, created_at, id) for stable drains.
    async fn find_pending(&self, limit: u32) -> Result<Vec<DispatchJob>>;

    /// Ids of QUEUED jobs untouched since `older_than`.
    async fn find_stale_queued(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<String>>;

    async fn count_by_group_and_status(&self, group: &str, status: DispatchStatus) -> Result<i64>;

    /// Subset of `groups` holding at least one ERROR job. Jobs without a
    /// group count toward the "default" sentinel group.
    async fn blocked_groups(&self, groups: &HashSet<String>) -> Result<HashSet<String>>;

    async fn update_status(
        &self,
        id: &str,
        status: DispatchStatus,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()>;

    /// Single-statement batch transition (stale recovery).
    async fn update_status_batch(&self, ids: &[String], status: DispatchStatus) -> Result<u64>;

    /// PENDING -> QUEUED, stamping queued_at. No-op error when the job moved
    /// meanwhile.
    async fn mark_queued(&self, id: &str) -> Result<()>;

    /// QUEUED -> IN_PROGRESS at delivery time. Idempotent for jobs already
    /// IN_PROGRESS so broker redeliveries of retrying jobs pass through.
    async fn mark_in_progress(&self, id: &str) -> Result<()>;

    async fn append_attempt(&self, id: &str, attempt: &DispatchAttempt) -> Result<()>;
}
