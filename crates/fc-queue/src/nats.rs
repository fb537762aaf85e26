//! NATS JetStream backend.
//!
//! WorkQueue retention with a durable pull consumer. Broker message ids are
//! `stream:streamSequence`; publish dedup rides on the `Nats-Msg-Id` header.
//! Sequences that were acked but reappear after an ack timeout are re-acked
//! via a pending-ack set instead of being routed twice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use dashmap::{DashMap, DashSet};
use futures::StreamExt;
use tracing::{debug, info, warn};

use fc_common::visibility::clamp_delay;
use fc_common::{BrokerMessage, PublishReceipt, QueueMessage};

use crate::{QueueConsumer, QueueDepth, QueueError, QueuePublisher, Result};

pub struct NatsQueue {
    context: jetstream::Context,
    consumer: PullConsumer,
    stream_name: String,
    subject: String,
    running: AtomicBool,
    /// receipt handle -> leased message (needed to ack via its reply subject)
    leased: DashMap<String, jetstream::Message>,
    /// Sequences acked here but redelivered by the server after an ack
    /// timeout; re-acked on sight.
    pending_ack_sequences: DashSet<u64>,
}

impl NatsQueue {
    pub async fn connect(
        url: &str,
        stream_name: &str,
        subject: &str,
        durable_name: &str,
    ) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| QueueError::Broker(format!("NATS connect failed: {e}")))?;
        let context = jetstream::new(client);

        let stream = context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects: vec![subject.to_string()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Broker(format!("Stream setup failed: {e}")))?;

        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(durable_name.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::Broker(format!("Consumer setup failed: {e}")))?;

        info!(stream = %stream_name, subject = %subject, "JetStream queue ready");

        Ok(Self {
            context,
            consumer,
            stream_name: stream_name.to_string(),
            subject: subject.to_string(),
            running: AtomicBool::new(true),
            leased: DashMap::new(),
            pending_ack_sequences: DashSet::new(),
        })
    }

    fn sequence_of(message: &jetstream::Message) -> Option<u64> {
        message.info().ok().map(|i| i.stream_sequence)
    }
}

#[async_trait]
impl QueuePublisher for NatsQueue {
    fn identifier(&self) -> &str {
        &self.stream_name
    }

    async fn publish(&self, message: QueueMessage) -> Result<PublishReceipt> {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.deduplication_id.as_str());

        let ack = self
            .context
            .publish_with_headers(self.subject.clone(), headers, message.body.clone().into())
            .await
            .map_err(|e| QueueError::Broker(format!("Publish failed: {e}")))?
            .await
            .map_err(|e| QueueError::Broker(format!("Publish ack failed: {e}")))?;

        if ack.duplicate {
            debug!(message_id = %message.message_id, "JetStream deduplicated publish");
            return Ok(PublishReceipt::deduplicated(message.deduplication_id));
        }

        debug!(
            message_id = %message.message_id,
            sequence = ack.sequence,
            "Message published to JetStream"
        );
        Ok(PublishReceipt::published())
    }
}

#[async_trait]
impl QueueConsumer for NatsQueue {
    fn identifier(&self) -> &str {
        &self.stream_name
    }

    async fn fetch(&self, max_messages: u32, poll_timeout: Duration) -> Result<Vec<BrokerMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let mut batch = self
            .consumer
            .fetch()
            .max_messages(max_messages as usize)
            .expires(poll_timeout)
            .messages()
            .await
            .map_err(|e| QueueError::Broker(format!("Fetch failed: {e}")))?;

        let mut messages = Vec::new();

        while let Some(message) = batch.next().await {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "JetStream delivery error");
                    continue;
                }
            };

            let Some(sequence) = Self::sequence_of(&message) else {
                continue;
            };

            // Ack-timeout redelivery of something we already completed:
            // re-ack and drop.
            if self.pending_ack_sequences.remove(&sequence).is_some() {
                debug!(sequence, "Re-acking previously completed message");
                let _ = message.double_ack().await;
                continue;
            }

            let delivery_count = message
                .info()
                .map(|i| i.delivered as u32)
                .unwrap_or(1);

            let body = String::from_utf8_lossy(&message.payload).to_string();
            let receipt_handle = uuid::Uuid::new_v4().to_string();
            let broker_message_id = format!("{}:{}", self.stream_name, sequence);

            self.leased.insert(receipt_handle.clone(), message);
            messages.push(BrokerMessage {
                broker_message_id,
                receipt_handle,
                body,
                delivery_count,
            });
        }

        if !messages.is_empty() {
            debug!(stream = %self.stream_name, count = messages.len(), "Fetched from JetStream");
        }

        Ok(messages)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let Some((_, message)) = self.leased.remove(receipt_handle) else {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        };

        if let Err(e) = message.double_ack().await {
            // The server will redeliver; remember the sequence so the next
            // sighting is re-acked instead of routed.
            if let Some(sequence) = Self::sequence_of(&message) {
                self.pending_ack_sequences.insert(sequence);
            }
            return Err(QueueError::Broker(format!("Ack failed: {e}")));
        }
        Ok(())
    }

    async fn nack_with_delay(&self, receipt_handle: &str, delay_seconds: u32) -> Result<()> {
        let Some((_, message)) = self.leased.remove(receipt_handle) else {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        };

        let delay = Duration::from_secs(clamp_delay(delay_seconds) as u64);
        message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| QueueError::Broker(format!("Nak failed: {e}")))?;
        Ok(())
    }

    async fn extend_visibility(&self, receipt_handle: &str, _seconds: u32) -> Result<()> {
        // JetStream extends the ack wait by a working indicator rather than
        // an absolute timeout.
        let Some(message) = self.leased.get(receipt_handle) else {
            return Err(QueueError::NotFound(receipt_handle.to_string()));
        };

        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| QueueError::Broker(format!("Progress ack failed: {e}")))?;
        Ok(())
    }

    async fn query_metrics(&self) -> Result<Option<QueueDepth>> {
        let mut consumer = self.consumer.clone();
        let info = consumer
            .info()
            .await
            .map_err(|e| QueueError::Broker(format!("Consumer info failed: {e}")))?;

        Ok(Some(QueueDepth {
            pending: info.num_pending,
            invisible: info.num_ack_pending as u64,
            queue_id: self.stream_name.clone(),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.leased.clear();
        info!(stream = %self.stream_name, "JetStream consumer stopped");
    }
}
