//! Envelope construction and broker publish for one job.

use std::sync::Arc;

use tracing::{debug, warn};

use fc_common::{MediationType, MessagePointer, QueueMessage};
use fc_queue::QueuePublisher;
use fc_store::{DispatchJob, JobStore};

use crate::auth::DispatchAuth;
use crate::{Result, SchedulerConfig};

pub struct JobDispatcher {
    config: SchedulerConfig,
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn QueuePublisher>,
    auth: DispatchAuth,
}

impl JobDispatcher {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        publisher: Arc<dyn QueuePublisher>,
        auth: DispatchAuth,
    ) -> Self {
        Self {
            config,
            store,
            publisher,
            auth,
        }
    }

    /// Publish one job and flip it to QUEUED.
    ///
    /// Returns false when the publish did not land; the job stays PENDING
    /// and the next poll cycle retries it. A broker-side dedup outcome
    /// counts as landed: the earlier publish is already queued.
    pub async fn dispatch(&self, job: &DispatchJob) -> Result<bool> {
        let auth_token = match self.auth.generate_token(&job.id) {
            Ok(token) => token,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Auth token generation failed, using dev fallback");
                format!("dev_{}", job.id)
            }
        };

        let group = job.group_key().to_string();
        let pool_code = job
            .dispatch_pool_code
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.config.default_pool_code.clone());
        let target = if job.target_url.is_empty() {
            self.config.processing_endpoint.clone()
        } else {
            job.target_url.clone()
        };

        let pointer = MessagePointer {
            id: job.id.clone(),
            pool_code,
            auth_token: Some(auth_token),
            mediation_type: MediationType::HTTP,
            mediation_target: target,
            message_group_id: Some(group.clone()),
            batch_id: None,
        };

        let message = QueueMessage {
            message_id: job.id.clone(),
            message_group_id: Some(group),
            deduplication_id: job.id.clone(),
            body: serde_json::to_string(&pointer)?,
        };

        metrics::counter!("dispatch.scheduler.jobs_dispatched").increment(1);

        let receipt = match self.publisher.publish(message).await {
            Ok(receipt) => receipt,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Publish failed; job remains PENDING");
                metrics::counter!("dispatch.scheduler.dispatch_errors").increment(1);
                return Ok(false);
            }
        };

        if !receipt.accepted() {
            warn!(
                job_id = %job.id,
                error = ?receipt.error_message,
                "Broker rejected publish; job remains PENDING"
            );
            metrics::counter!("dispatch.scheduler.dispatch_errors").increment(1);
            return Ok(false);
        }

        if receipt.is_deduplicated() {
            debug!(job_id = %job.id, "Publish deduplicated by broker");
        }

        match self.store.mark_queued(&job.id).await {
            Ok(()) => {
                metrics::counter!("dispatch.scheduler.jobs_queued").increment(1);
                Ok(true)
            }
            Err(fc_store::StoreError::NotFound(_)) => {
                // Raced with a concurrent transition (another tick already
                // queued it, or an operator cancelled). The broker dedups on
                // job id either way.
                debug!(job_id = %job.id, "Job no longer PENDING after publish");
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_auth_configured(&self) -> bool {
        self.auth.is_configured()
    }
}
