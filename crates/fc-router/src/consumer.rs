//! Broker consumer loops.
//!
//! One long-lived loop per configured connection: long-poll, parse
//! envelopes, drop poison bodies, collapse in-batch duplicates, hand the
//! rest to the manager. Each loop heartbeats into a shared registry; a
//! consumer that has not polled for 60 seconds is reported unhealthy.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use fc_common::{MessagePointer, WarningCategory, WarningSeverity};
use fc_queue::QueueConsumer;

use crate::manager::{ConsumedMessage, QueueManagerHandle};
use crate::warning::WarningService;

const FETCH_BATCH_SIZE: u32 = 10;
const POLL_TIMEOUT: Duration = Duration::from_secs(20);
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(100);
const ERROR_BACKOFF: Duration = Duration::from_secs(1);
const MAX_POLL_SILENCE: Duration = Duration::from_secs(60);

/// Last-poll timestamps per consumer loop.
#[derive(Default)]
pub struct HeartbeatRegistry {
    last_poll: DashMap<String, Instant>,
}

impl HeartbeatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, queue_id: &str) {
        self.last_poll.insert(queue_id.to_string(), Instant::now());
    }

    pub fn is_healthy(&self, queue_id: &str) -> bool {
        self.last_poll
            .get(queue_id)
            .map(|t| t.elapsed() < MAX_POLL_SILENCE)
            .unwrap_or(false)
    }

    pub fn stalled(&self) -> Vec<String> {
        self.last_poll
            .iter()
            .filter(|entry| entry.value().elapsed() >= MAX_POLL_SILENCE)
            .map(|entry| entry.key().clone())
            .collect()
    }
}

pub struct ConsumerLoop {
    consumer: Arc<dyn QueueConsumer>,
    manager: QueueManagerHandle,
    heartbeats: Arc<HeartbeatRegistry>,
    warning_service: Arc<WarningService>,
}

impl ConsumerLoop {
    pub fn new(
        consumer: Arc<dyn QueueConsumer>,
        manager: QueueManagerHandle,
        heartbeats: Arc<HeartbeatRegistry>,
        warning_service: Arc<WarningService>,
    ) -> Self {
        Self {
            consumer,
            manager,
            heartbeats,
            warning_service,
        }
    }

    /// Run until shutdown fires or the consumer stops.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let queue_id = self.consumer.identifier().to_string();
        info!(queue_id = %queue_id, "Consumer loop started");

        loop {
            self.heartbeats.record(&queue_id);

            let batch = tokio::select! {
                result = self.consumer.fetch(FETCH_BATCH_SIZE, POLL_TIMEOUT) => result,
                _ = shutdown_rx.recv() => {
                    info!(queue_id = %queue_id, "Consumer loop shutting down");
                    break;
                }
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(fc_queue::QueueError::Stopped) => {
                    info!(queue_id = %queue_id, "Consumer stopped");
                    break;
                }
                Err(e) => {
                    error!(queue_id = %queue_id, error = %e, "Poll failed");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    continue;
                }
            };

            if batch.is_empty() {
                tokio::time::sleep(EMPTY_POLL_BACKOFF).await;
                continue;
            }

            let mut seen_ids: HashSet<String> = HashSet::with_capacity(batch.len());
            let mut parsed = Vec::with_capacity(batch.len());

            for raw in batch {
                let pointer: MessagePointer = match serde_json::from_str(&raw.body) {
                    Ok(pointer) => pointer,
                    Err(e) => {
                        // Poison pill: remove it so it cannot loop forever.
                        warn!(
                            queue_id = %queue_id,
                            broker_message_id = %raw.broker_message_id,
                            error = %e,
                            "Malformed envelope; acking poison message"
                        );
                        self.warning_service.add_warning(
                            WarningCategory::Routing,
                            WarningSeverity::Warn,
                            format!("Malformed envelope on [{queue_id}]: {e}"),
                            "ConsumerLoop".to_string(),
                        );
                        let _ = self.consumer.ack(&raw.receipt_handle).await;
                        continue;
                    }
                };

                // Same envelope twice in one batch: keep the first delivery.
                if !seen_ids.insert(pointer.id.clone()) {
                    debug!(
                        queue_id = %queue_id,
                        message_id = %pointer.id,
                        "Duplicate envelope within batch; acking"
                    );
                    let _ = self.consumer.ack(&raw.receipt_handle).await;
                    continue;
                }

                parsed.push(ConsumedMessage {
                    pointer,
                    broker_message_id: raw.broker_message_id,
                    receipt_handle: raw.receipt_handle,
                });
            }

            if parsed.is_empty() {
                continue;
            }

            if let Err(e) = self.manager.route_batch(queue_id.clone(), parsed).await {
                error!(queue_id = %queue_id, error = %e, "Routing failed; stopping consumer loop");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_health_window() {
        let registry = HeartbeatRegistry::new();
        assert!(!registry.is_healthy("q1"));

        registry.record("q1");
        assert!(registry.is_healthy("q1"));
        assert!(registry.stalled().is_empty());
    }
}
