//! AWS SQS FIFO backend.
//!
//! `message_group_id` carries ordering, `message_deduplication_id` gives the
//! broker-side 5-minute dedup window, and long polling is capped at the SQS
//! maximum of 20 seconds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::types::QueueAttributeName;
use aws_sdk_sqs::Client;
use tracing::{debug, info};

pub use aws_sdk_sqs::Client as SqsClient;

use fc_common::visibility::clamp_delay;
use fc_common::{message_group_or_default, BrokerMessage, PublishReceipt, QueueMessage};

use crate::{QueueConsumer, QueueDepth, QueueError, QueuePublisher, Result};

const SQS_MAX_WAIT_SECONDS: u64 = 20;
const SQS_MAX_BATCH: u32 = 10;

pub struct SqsQueue {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: String, visibility_timeout_seconds: i32) -> Self {
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();

        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl QueuePublisher for SqsQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn publish(&self, message: QueueMessage) -> Result<PublishReceipt> {
        let group = message_group_or_default(message.message_group_id.as_deref()).to_string();

        let result = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(&message.body)
            .message_group_id(&group)
            .message_deduplication_id(&message.deduplication_id)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(
                    message_id = %message.message_id,
                    queue = %self.queue_name,
                    group = %group,
                    "Message published to SQS"
                );
                Ok(PublishReceipt::published())
            }
            Err(e) => {
                let detail = e.to_string();
                // The FIFO dedup window rejects repeats with a recognizable
                // message; report those as dedup receipts, not failures.
                if detail.contains("Deduplicated") || detail.contains("duplicate") {
                    Ok(PublishReceipt::deduplicated(message.deduplication_id))
                } else {
                    Ok(PublishReceipt::failed(detail))
                }
            }
        }
    }
}

#[async_trait]
impl QueueConsumer for SqsQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, max_messages: u32, poll_timeout: Duration) -> Result<Vec<BrokerMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let wait = poll_timeout.as_secs().min(SQS_MAX_WAIT_SECONDS) as i32;

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(SQS_MAX_BATCH) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(wait)
            .message_system_attribute_names(
                aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount,
            )
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(sqs_messages.len());

        for msg in sqs_messages {
            let (Some(body), Some(receipt), Some(id)) =
                (msg.body(), msg.receipt_handle(), msg.message_id())
            else {
                continue;
            };

            let delivery_count = msg
                .attributes()
                .and_then(|a| {
                    a.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
                })
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(1);

            messages.push(BrokerMessage {
                broker_message_id: id.to_string(),
                receipt_handle: receipt.to_string(),
                body: body.to_string(),
                delivery_count,
            });
        }

        if !messages.is_empty() {
            self.total_polled
                .fetch_add(messages.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = messages.len(), "Polled messages from SQS");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn nack_with_delay(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(clamp_delay(delay_seconds) as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;
        Ok(())
    }

    async fn query_metrics(&self) -> Result<Option<QueueDepth>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let attributes = result.attributes();

        let pending = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let invisible = attributes
            .and_then(|a| a.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(QueueDepth {
            pending,
            invisible,
            queue_id: self.queue_name.clone(),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS consumer stopped");
    }
}
