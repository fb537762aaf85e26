//! SQLite job store via sqlx.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use fc_common::DEFAULT_MESSAGE_GROUP;

use crate::{
    DispatchAttempt, DispatchJob, DispatchMode, DispatchStatus, JobStore, Result, StoreError,
};

pub struct SqliteJobStore {
    pool: Pool<Sqlite>,
}

impl SqliteJobStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_jobs (
                id TEXT PRIMARY KEY,
                message_group TEXT,
                sequence INTEGER NOT NULL DEFAULT 99,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                queued_at INTEGER,
                status TEXT NOT NULL DEFAULT 'PENDING',
                mode TEXT NOT NULL DEFAULT 'IMMEDIATE',
                dispatch_pool_id TEXT,
                dispatch_pool_code TEXT,
                target_url TEXT NOT NULL,
                payload TEXT NOT NULL,
                payload_content_type TEXT NOT NULL DEFAULT 'application/json',
                data_only INTEGER NOT NULL DEFAULT 0,
                timeout_seconds INTEGER NOT NULL DEFAULT 30,
                max_retries INTEGER NOT NULL DEFAULT 3,
                service_account_id TEXT,
                subscription_id TEXT,
                client_id TEXT,
                status_code INTEGER,
                last_error TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_status
            ON dispatch_jobs (status, sequence, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_group_status
            ON dispatch_jobs (message_group, status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispatch_attempts (
                job_id TEXT NOT NULL,
                attempt_number INTEGER NOT NULL,
                attempted_at INTEGER NOT NULL,
                status_code INTEGER,
                duration_ms INTEGER NOT NULL,
                error TEXT,
                PRIMARY KEY (job_id, attempt_number)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Dispatch job schema initialized");
        Ok(())
    }

    fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> DispatchJob {
        DispatchJob {
            id: row.get("id"),
            message_group: row.get("message_group"),
            sequence: row.get::<i64, _>("sequence") as i32,
            created_at: ts_to_datetime(row.get("created_at")),
            updated_at: row.get::<Option<i64>, _>("updated_at").map(ts_to_datetime),
            queued_at: row.get::<Option<i64>, _>("queued_at").map(ts_to_datetime),
            status: DispatchStatus::parse(row.get("status")),
            mode: DispatchMode::parse(row.get("mode")),
            dispatch_pool_id: row.get("dispatch_pool_id"),
            dispatch_pool_code: row.get("dispatch_pool_code"),
            target_url: row.get("target_url"),
            payload: row.get("payload"),
            payload_content_type: row.get("payload_content_type"),
            data_only: row.get::<i64, _>("data_only") != 0,
            timeout_seconds: row.get::<i64, _>("timeout_seconds") as u32,
            max_retries: row.get::<i64, _>("max_retries") as u32,
            service_account_id: row.get("service_account_id"),
            subscription_id: row.get("subscription_id"),
            client_id: row.get("client_id"),
            status_code: row.get::<Option<i64>, _>("status_code").map(|c| c as u16),
            last_error: row.get("last_error"),
            attempt_count: row.get::<i64, _>("attempt_count") as i32,
        }
    }
}

fn ts_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &DispatchJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_jobs
                (id, message_group, sequence, created_at, updated_at, queued_at,
                 status, mode, dispatch_pool_id, dispatch_pool_code, target_url,
                 payload, payload_content_type, data_only, timeout_seconds,
                 max_retries, service_account_id, subscription_id, client_id,
                 status_code, last_error, attempt_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                    ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            "#,
        )
        .bind(job.id.to_uppercase())
        .bind(&job.message_group)
        .bind(job.sequence as i64)
        .bind(job.created_at.timestamp_millis())
        .bind(job.updated_at.map(|t| t.timestamp_millis()))
        .bind(job.queued_at.map(|t| t.timestamp_millis()))
        .bind(job.status.as_str())
        .bind(job.mode.as_str())
        .bind(&job.dispatch_pool_id)
        .bind(&job.dispatch_pool_code)
        .bind(&job.target_url)
        .bind(&job.payload)
        .bind(&job.payload_content_type)
        .bind(job.data_only as i64)
        .bind(job.timeout_seconds as i64)
        .bind(job.max_retries as i64)
        .bind(&job.service_account_id)
        .bind(&job.subscription_id)
        .bind(&job.client_id)
        .bind(job.status_code.map(|c| c as i64))
        .bind(&job.last_error)
        .bind(job.attempt_count as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<DispatchJob>> {
        let row = sqlx::query("SELECT * FROM dispatch_jobs WHERE id = UPPER(?1)")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| Self::row_to_job(&r)))
    }

    async fn find_pending(&self, limit: u32) -> Result<Vec<DispatchJob>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM dispatch_jobs
            WHERE status = 'PENDING'
            ORDER BY sequence, created_at, id
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::row_to_job).collect())
    }

    async fn find_stale_queued(&self, older_than: DateTime<Utc>, limit: u32) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM dispatch_jobs
            WHERE status = 'QUEUED'
              AND COALESCE(updated_at, queued_at, created_at) < ?1
            ORDER BY id
            LIMIT ?2
            "#,
        )
        .bind(older_than.timestamp_millis())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("id")).collect())
    }

    async fn count_by_group_and_status(&self, group: &str, status: DispatchStatus) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM dispatch_jobs
            WHERE COALESCE(message_group, ?1) = ?2 AND status = ?3
            "#,
        )
        .bind(DEFAULT_MESSAGE_GROUP)
        .bind(group)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn blocked_groups(&self, groups: &HashSet<String>) -> Result<HashSet<String>> {
        if groups.is_empty() {
            return Ok(HashSet::new());
        }

        let placeholders: Vec<String> = (0..groups.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            r#"
            SELECT DISTINCT COALESCE(message_group, ?1) AS grp
            FROM dispatch_jobs
            WHERE status = 'ERROR'
              AND COALESCE(message_group, ?1) IN ({})
            "#,
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql).bind(DEFAULT_MESSAGE_GROUP);
        for group in groups {
            query = query.bind(group);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| r.get::<String, _>("grp")).collect())
    }

    async fn update_status(
        &self,
        id: &str,
        status: DispatchStatus,
        status_code: Option<u16>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = ?1, status_code = ?2, last_error = ?3, updated_at = ?4
            WHERE id = UPPER(?5)
            "#,
        )
        .bind(status.as_str())
        .bind(status_code.map(|c| c as i64))
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_status_batch(&self, ids: &[String], status: DispatchStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let placeholders: Vec<String> = (0..ids.len()).map(|i| format!("?{}", i + 3)).collect();
        let sql = format!(
            "UPDATE dispatch_jobs SET status = ?1, updated_at = ?2, queued_at = NULL WHERE id IN ({})",
            placeholders.join(", ")
        );

        let mut query = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis());
        for id in ids {
            query = query.bind(id);
        }

        let result = query.execute(&self.pool).await?;
        debug!(count = result.rows_affected(), status = status.as_str(), "Batch status update");
        Ok(result.rows_affected())
    }

    async fn mark_queued(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'QUEUED', queued_at = ?1, updated_at = ?1
            WHERE id = UPPER(?2) AND status = 'PENDING'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn mark_in_progress(&self, id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE dispatch_jobs
            SET status = 'IN_PROGRESS', updated_at = ?1
            WHERE id = UPPER(?2) AND status IN ('QUEUED', 'IN_PROGRESS')
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn append_attempt(&self, id: &str, attempt: &DispatchAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dispatch_attempts
                (job_id, attempt_number, attempted_at, status_code, duration_ms, error)
            VALUES (UPPER(?1), ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id)
        .bind(attempt.attempt_number as i64)
        .bind(attempt.attempted_at.timestamp_millis())
        .bind(attempt.status_code.map(|c| c as i64))
        .bind(attempt.duration_ms)
        .bind(&attempt.error)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE dispatch_jobs SET attempt_count = attempt_count + 1 WHERE id = UPPER(?1)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_store() -> SqliteJobStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteJobStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    fn job(id: &str, group: Option<&str>, sequence: i32) -> DispatchJob {
        let mut job = DispatchJob::new(id, "https://example.com/hook", "{}");
        job.message_group = group.map(|s| s.to_string());
        job.sequence = sequence;
        job
    }

    #[tokio::test]
    async fn pending_jobs_ordered_by_sequence_then_creation() {
        let store = create_store().await;

        let mut late_but_urgent = job("B", Some("g"), 1);
        late_but_urgent.created_at = Utc::now();
        let mut early_default = job("A", Some("g"), 99);
        early_default.created_at = Utc::now() - chrono::Duration::seconds(60);

        store.insert(&early_default).await.unwrap();
        store.insert(&late_but_urgent).await.unwrap();

        let pending = store.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, "B");
        assert_eq!(pending[1].id, "A");
    }

    #[tokio::test]
    async fn blocked_groups_reflect_error_rows() {
        let store = create_store().await;

        store.insert(&job("E1", Some("orders"), 99)).await.unwrap();
        store
            .update_status("E1", DispatchStatus::Queued, None, None)
            .await
            .unwrap();
        store
            .update_status("E1", DispatchStatus::Error, Some(500), Some("boom"))
            .await
            .unwrap();
        store.insert(&job("P1", Some("payments"), 99)).await.unwrap();

        let groups: HashSet<String> =
            ["orders".to_string(), "payments".to_string()].into_iter().collect();
        let blocked = store.blocked_groups(&groups).await.unwrap();

        assert!(blocked.contains("orders"));
        assert!(!blocked.contains("payments"));

        // Resolving the error unblocks the group.
        store
            .update_status("E1", DispatchStatus::Pending, None, None)
            .await
            .unwrap();
        let blocked = store.blocked_groups(&groups).await.unwrap();
        assert!(blocked.is_empty());
    }

    #[tokio::test]
    async fn ungrouped_error_blocks_the_default_sentinel() {
        let store = create_store().await;

        store.insert(&job("E1", None, 99)).await.unwrap();
        store
            .update_status("E1", DispatchStatus::Error, Some(500), None)
            .await
            .unwrap();

        let groups: HashSet<String> = [DEFAULT_MESSAGE_GROUP.to_string()].into_iter().collect();
        let blocked = store.blocked_groups(&groups).await.unwrap();
        assert!(blocked.contains(DEFAULT_MESSAGE_GROUP));
    }

    #[tokio::test]
    async fn mark_queued_only_moves_pending_jobs() {
        let store = create_store().await;
        store.insert(&job("J1", None, 99)).await.unwrap();

        store.mark_queued("J1").await.unwrap();
        let stored = store.get("J1").await.unwrap().unwrap();
        assert_eq!(stored.status, DispatchStatus::Queued);
        assert!(stored.queued_at.is_some());

        // Second transition must not fire (already QUEUED).
        assert!(store.mark_queued("J1").await.is_err());
    }

    #[tokio::test]
    async fn stale_queued_recovery_round_trip() {
        let store = create_store().await;
        store.insert(&job("J1", None, 99)).await.unwrap();
        store.mark_queued("J1").await.unwrap();

        // Not stale yet.
        let cutoff = Utc::now() - chrono::Duration::minutes(15);
        let stale = store.find_stale_queued(cutoff, 100).await.unwrap();
        assert!(stale.is_empty());

        // Anything updated before a future cutoff is stale.
        let cutoff = Utc::now() + chrono::Duration::minutes(1);
        let stale = store.find_stale_queued(cutoff, 100).await.unwrap();
        assert_eq!(stale, vec!["J1".to_string()]);

        let reset = store
            .update_status_batch(&stale, DispatchStatus::Pending)
            .await
            .unwrap();
        assert_eq!(reset, 1);

        let stored = store.get("J1").await.unwrap().unwrap();
        assert_eq!(stored.status, DispatchStatus::Pending);
        assert!(stored.queued_at.is_none());
    }

    #[tokio::test]
    async fn attempts_append_and_count() {
        let store = create_store().await;
        store.insert(&job("J1", None, 99)).await.unwrap();

        store
            .append_attempt(
                "J1",
                &DispatchAttempt {
                    attempt_number: 1,
                    attempted_at: Utc::now(),
                    status_code: Some(503),
                    duration_ms: 120,
                    error: Some("upstream down".to_string()),
                },
            )
            .await
            .unwrap();

        let stored = store.get("J1").await.unwrap().unwrap();
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let store = create_store().await;
        store.insert(&job("0hzx4q5y8jy5z", None, 99)).await.unwrap();

        let stored = store.get("0HZX4Q5Y8JY5Z").await.unwrap();
        assert!(stored.is_some());
        let stored = store.get("0hzx4q5y8jy5z").await.unwrap();
        assert!(stored.is_some());
    }
}
