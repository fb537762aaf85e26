//! Store-aware delivery processing.
//!
//! [`JobProcessor`] is the production [`Mediator`]: it resolves the
//! persisted job behind an envelope, drives its status through
//! IN_PROGRESS, performs the webhook call, records the attempt, and
//! decides the terminal status. The outcome handed back to the pool then
//! controls ack/nack and batch+group failure marking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use fc_common::{MediationOutcome, MessagePointer};
use fc_store::{DispatchAttempt, DispatchJob, DispatchStatus, JobStore};

use crate::mediator::{DeliveryRequest, HttpMediator, Mediator};

pub struct JobProcessor {
    store: Arc<dyn JobStore>,
    http: HttpMediator,
}

impl JobProcessor {
    pub fn new(store: Arc<dyn JobStore>, http: HttpMediator) -> Self {
        Self { store, http }
    }

    /// Body for the webhook call: the raw payload when the job is
    /// data-only, otherwise the event envelope wrapping it.
    fn build_body(job: &DispatchJob) -> (String, String) {
        if job.data_only {
            return (job.payload.clone(), job.payload_content_type.clone());
        }

        let data: serde_json::Value =
            serde_json::from_str(&job.payload).unwrap_or(serde_json::Value::Null);

        let envelope = json!({
            "id": job.id,
            "kind": "DISPATCH",
            "code": job.subscription_id.clone().unwrap_or_default(),
            "subject": job.client_id.clone().unwrap_or_default(),
            "eventId": job.id,
            "timestamp": Utc::now().to_rfc3339(),
            "data": data,
        });

        (envelope.to_string(), "application/json".to_string())
    }

    async fn record_attempt(&self, job: &DispatchJob, outcome: &MediationOutcome, duration_ms: i64) {
        let attempt = DispatchAttempt {
            attempt_number: job.attempt_count + 1,
            attempted_at: Utc::now(),
            status_code: outcome.status_code,
            duration_ms,
            error: outcome.error_message.clone(),
        };

        if let Err(e) = self.store.append_attempt(&job.id, &attempt).await {
            warn!(job_id = %job.id, error = %e, "Failed to record dispatch attempt");
        }
    }

    async fn finalize(&self, job_id: &str, status: DispatchStatus, outcome: &MediationOutcome) {
        if let Err(e) = self
            .store
            .update_status(
                job_id,
                status,
                outcome.status_code,
                outcome.error_message.as_deref(),
            )
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to persist final job status");
        }
    }
}

#[async_trait]
impl Mediator for JobProcessor {
    async fn mediate(&self, pointer: &MessagePointer) -> MediationOutcome {
        let job = match self.store.get(&pointer.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                // Envelope for a job that no longer exists; drop it.
                warn!(job_id = %pointer.id, "No job behind envelope, dropping");
                return MediationOutcome::error_config(0, "Unknown dispatch job");
            }
            Err(e) => {
                // Store outage is transient; keep the message for retry.
                warn!(job_id = %pointer.id, error = %e, "Job lookup failed");
                return MediationOutcome::error_process(None, None, format!("Store error: {e}"));
            }
        };

        match job.status {
            DispatchStatus::Cancelled => {
                debug!(job_id = %job.id, "Job cancelled, dropping delivery");
                return MediationOutcome::error_config(0, "Job cancelled");
            }
            DispatchStatus::Completed => {
                // Redelivery of an already-delivered job; ack silently.
                debug!(job_id = %job.id, "Job already completed, acking redelivery");
                return MediationOutcome::success(job.status_code.unwrap_or(200));
            }
            DispatchStatus::Error => {
                // The terminal ack was lost after retries ran out; the row
                // waits on operator resolution, so drop the redelivery.
                debug!(job_id = %job.id, "Job in ERROR awaiting resolution, dropping redelivery");
                return MediationOutcome::error_config(
                    job.status_code.unwrap_or(0),
                    "Job in ERROR awaiting operator resolution",
                );
            }
            _ => {}
        }

        if let Err(e) = self.store.mark_in_progress(&job.id).await {
            // Concurrent transition (stale recovery or operator action);
            // the redelivered message will re-resolve the row.
            debug!(job_id = %job.id, error = %e, "Could not mark IN_PROGRESS, retrying later");
            return MediationOutcome::error_process(None, None, "Job is not deliverable yet");
        }

        let (body, content_type) = Self::build_body(&job);
        let request = DeliveryRequest {
            message_id: job.id.clone(),
            target: pointer.mediation_target.clone(),
            auth_token: pointer.auth_token.clone(),
            content_type,
            body,
            timeout: Duration::from_secs(job.timeout_seconds as u64),
        };

        let start = std::time::Instant::now();
        let outcome = self.http.deliver(&request).await;
        let duration_ms = start.elapsed().as_millis() as i64;

        self.record_attempt(&job, &outcome, duration_ms).await;

        use fc_common::MediationResult::*;
        match outcome.result {
            Success => {
                self.finalize(&job.id, DispatchStatus::Completed, &outcome).await;
                outcome
            }
            ErrorConfig => {
                self.finalize(&job.id, DispatchStatus::Error, &outcome).await;
                outcome
            }
            ErrorProcess | ErrorConnection => {
                let attempts_done = job.attempt_count + 1;
                if attempts_done >= job.max_retries as i32 {
                    // Retries exhausted: stop redelivering. The row lands in
                    // ERROR for operator resolution, which also arms the
                    // group's BLOCK_ON_ERROR gate at the scheduler.
                    warn!(
                        job_id = %job.id,
                        attempts = attempts_done,
                        max_retries = job.max_retries,
                        "Retries exhausted, dropping from queue"
                    );
                    self.finalize(&job.id, DispatchStatus::Error, &outcome).await;
                    MediationOutcome::error_config(
                        outcome.status_code.unwrap_or(0),
                        format!(
                            "Retries exhausted after {attempts_done} attempts: {}",
                            outcome.error_message.as_deref().unwrap_or("unknown error")
                        ),
                    )
                } else {
                    // Retries remain: the job stays IN_PROGRESS with the
                    // failure recorded, and the broker redelivery drives the
                    // next attempt.
                    self.finalize(&job.id, DispatchStatus::InProgress, &outcome).await;
                    outcome
                }
            }
        }
    }
}
