//! Embedded durable queue on SQLite.
//!
//! Mimics SQS FIFO semantics for single-node deployments. Each fetch leases
//! one row at a time with a single `UPDATE .. RETURNING`: the candidate is
//! the smallest-id visible row within the message group of the overall
//! smallest-id visible row. Repeated application yields the oldest group
//! first and, inside it, strict arrival order, with an atomic lease.
//!
//! Deduplication is a unique index over `(queue_name, message_group_id,
//! deduplication_id)`; a conflicting publish reports a dedup receipt rather
//! than an error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, warn};

use fc_common::visibility::clamp_delay;
use fc_common::{message_group_or_default, BrokerMessage, PublishReceipt, QueueMessage};

use crate::{EmbeddedQueue, QueueConsumer, QueueDepth, QueuePublisher, Result};

pub struct SqliteQueue {
    pool: Pool<Sqlite>,
    queue_name: String,
    visibility_timeout_seconds: u32,
    running: AtomicBool,
}

impl SqliteQueue {
    pub fn new(pool: Pool<Sqlite>, queue_name: String, visibility_timeout_seconds: u32) -> Self {
        Self {
            pool,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
        }
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue_name TEXT NOT NULL,
                message_id TEXT NOT NULL,
                message_group_id TEXT NOT NULL,
                deduplication_id TEXT NOT NULL,
                receipt_handle TEXT,
                visible_at INTEGER NOT NULL,
                body TEXT NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_dedup
            ON queue_messages (queue_name, message_group_id, deduplication_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_visible
            ON queue_messages (queue_name, visible_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "Embedded queue schema initialized");
        Ok(())
    }

    /// Lease one message. Returns None when nothing is visible.
    async fn lease_next(&self, now: i64) -> Result<Option<BrokerMessage>> {
        let receipt_handle = uuid::Uuid::new_v4().to_string();
        let visible_at = now + self.visibility_timeout_seconds as i64;

        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET receipt_handle = ?1,
                visible_at = ?2,
                delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE queue_name = ?3 AND visible_at <= ?4
                  AND message_group_id = (
                      SELECT message_group_id FROM queue_messages
                      WHERE queue_name = ?3 AND visible_at <= ?4
                      ORDER BY id LIMIT 1
                  )
                ORDER BY id LIMIT 1
            )
            RETURNING id, body, delivery_count
            "#,
        )
        .bind(&receipt_handle)
        .bind(visible_at)
        .bind(&self.queue_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let id: i64 = row.get("id");
            BrokerMessage {
                broker_message_id: id.to_string(),
                receipt_handle,
                body: row.get("body"),
                delivery_count: row.get::<i64, _>("delivery_count") as u32,
            }
        }))
    }
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, message: QueueMessage) -> Result<PublishReceipt> {
        let now = Utc::now().timestamp();
        let group = message_group_or_default(message.message_group_id.as_deref()).to_string();

        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages
                (queue_name, message_id, message_group_id, deduplication_id,
                 visible_at, body, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?5)
            ON CONFLICT (queue_name, message_group_id, deduplication_id) DO NOTHING
            "#,
        )
        .bind(&self.queue_name)
        .bind(&message.message_id)
        .bind(&group)
        .bind(&message.deduplication_id)
        .bind(now)
        .bind(&message.body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                message_id = %message.message_id,
                queue = %self.queue_name,
                "Duplicate publish suppressed"
            );
            return Ok(PublishReceipt::deduplicated(message.deduplication_id));
        }

        debug!(
            message_id = %message.message_id,
            queue = %self.queue_name,
            group = %group,
            "Message published to embedded queue"
        );
        Ok(PublishReceipt::published())
    }
}

#[async_trait]
impl QueueConsumer for SqliteQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, max_messages: u32, poll_timeout: Duration) -> Result<Vec<BrokerMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(crate::QueueError::Stopped);
        }

        let deadline = tokio::time::Instant::now() + poll_timeout;
        loop {
            let now = Utc::now().timestamp();
            let mut messages = Vec::with_capacity(max_messages as usize);
            while messages.len() < max_messages as usize {
                match self.lease_next(now).await? {
                    Some(msg) => messages.push(msg),
                    None => break,
                }
            }

            if !messages.is_empty() {
                debug!(queue = %self.queue_name, count = messages.len(), "Leased messages");
                return Ok(messages);
            }

            // Nothing visible yet; emulate long polling until the deadline.
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE receipt_handle = ?1 AND queue_name = ?2",
        )
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(
                queue = %self.queue_name,
                "ACK did not match a leased message (handle expired or already removed)"
            );
            return Err(crate::QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn nack_with_delay(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + clamp_delay(delay_seconds) as i64;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?1, receipt_handle = NULL
            WHERE receipt_handle = ?2 AND queue_name = ?3
            "#,
        )
        .bind(visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            warn!(queue = %self.queue_name, "NACK did not match a leased message");
            return Err(crate::QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        let visible_at = Utc::now().timestamp() + seconds as i64;

        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?1 WHERE receipt_handle = ?2 AND queue_name = ?3",
        )
        .bind(visible_at)
        .bind(receipt_handle)
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(crate::QueueError::NotFound(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn query_metrics(&self) -> Result<Option<QueueDepth>> {
        let now = Utc::now().timestamp();

        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1 AND visible_at <= ?2",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let invisible: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1 AND visible_at > ?2",
        )
        .bind(&self.queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(Some(QueueDepth {
            pending: pending as u64,
            invisible: invisible as u64,
            queue_id: self.queue_name.clone(),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "Embedded queue consumer stopped");
    }
}

#[async_trait]
impl EmbeddedQueue for SqliteQueue {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema().await
    }
}
