use futures::StreamExt;
use log::{debug, error, info, warn};
use once_cell::sync::Lazy;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Offset;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::alerts::AlertSink;
use crate::config::Config;
use crate::engine::DetectionEngine;
use crate::errors::{DetectError, Result};
use crate::models::decode_event;

// Pipeline counters for the /stats surface.
pub static RECEIVED: AtomicU64 = AtomicU64::new(0);
pub static ALERTS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
pub static DEAD_LETTERED: AtomicU64 = AtomicU64::new(0);
pub static ERRORS: AtomicU64 = AtomicU64::new(0);
pub static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

/// Envelope written to the dead-letter topic for undecodable payloads,
/// preserving enough provenance to replay or inspect the original message.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub error_message: String,
    pub failed_at: u32,
    pub payload: String,
}

struct DeadLetterQueue {
    producer: FutureProducer,
    topic: String,
}

impl DeadLetterQueue {
    fn new(brokers: &str, topic: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| DetectError::Config(format!("failed to create DLQ producer: {}", e)))?;

        Ok(DeadLetterQueue {
            producer,
            topic: topic.to_string(),
        })
    }

    async fn send(&self, msg: &BorrowedMessage<'_>, error_message: &str) -> Result<()> {
        let payload = msg
            .payload()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default();
        let dead_letter = DeadLetterMessage {
            original_topic: msg.topic().to_string(),
            original_partition: msg.partition(),
            original_offset: msg.offset(),
            error_message: error_message.to_string(),
            failed_at: chrono::Utc::now().timestamp() as u32,
            payload,
        };

        let body = serde_json::to_string(&dead_letter)?;
        let key = format!("{}:{}:{}", msg.topic(), msg.partition(), msg.offset());
        let record = FutureRecord::to(&self.topic).payload(&body).key(&key);

        match self.producer.send(record, Duration::from_secs(5)).await {
            Ok(_) => {
                info!(
                    "sent message to dead-letter topic: topic={} partition={} offset={}",
                    msg.topic(),
                    msg.partition(),
                    msg.offset()
                );
                Ok(())
            }
            Err((e, _)) => Err(DetectError::Kafka(e)),
        }
    }
}

/// Pulls normalized events off the durable stream, drives the detection
/// engine, and publishes the resulting alerts.
///
/// One message is in flight at a time. A message is acknowledged (its offset
/// committed) only after every alert it produced has been handed to the
/// sink; failures before that point leave the offset uncommitted so the
/// transport redelivers. Stop is cooperative and takes effect at the next
/// loop iteration, letting the in-flight message finish.
pub struct EventConsumer {
    config: Arc<Config>,
    engine: Arc<DetectionEngine>,
    sink: Arc<dyn AlertSink>,
    dlq: DeadLetterQueue,
    running: AtomicBool,
    connected: AtomicBool,
}

impl EventConsumer {
    pub fn new(
        config: Arc<Config>,
        engine: Arc<DetectionEngine>,
        sink: Arc<dyn AlertSink>,
    ) -> Result<Self> {
        let dlq = DeadLetterQueue::new(&config.kafka_brokers, &config.kafka_dlq_topic)?;
        Ok(EventConsumer {
            config,
            engine,
            sink,
            dlq,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
        })
    }

    /// Last known transport connectivity; readiness probes read this without
    /// a round trip.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Ask the receive loop to stop at its next iteration boundary.
    pub fn stop(&self) {
        info!("consumer stop requested");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Connect, ensure topics, subscribe with the durable group identity,
    /// and run the receive loop until stopped.
    pub async fn start(&self) -> Result<()> {
        self.ensure_topics().await;

        let consumer = self.create_consumer()?;
        info!(
            "subscribed to normalized events: pattern={} group={}",
            self.config.kafka_topic_pattern, self.config.kafka_group_id
        );

        self.running.store(true, Ordering::SeqCst);
        self.receive_loop(&consumer).await;

        self.connected.store(false, Ordering::SeqCst);
        info!("transport connection closed");
        Ok(())
    }

    fn create_consumer(&self) -> Result<StreamConsumer> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.kafka_brokers)
            .set("group.id", &self.config.kafka_group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| DetectError::Config(format!("failed to create consumer: {}", e)))?;

        consumer
            .subscribe(&[&self.config.kafka_topic_pattern])
            .map_err(|e| DetectError::Config(format!("failed to subscribe: {}", e)))?;

        Ok(consumer)
    }

    /// Create the bootstrap and dead-letter topics if they are missing.
    /// "Already exists" is success; in locked-down clusters where creation
    /// is denied this logs and moves on, matching broker-managed setups.
    async fn ensure_topics(&self) {
        let admin: std::result::Result<AdminClient<DefaultClientContext>, _> = ClientConfig::new()
            .set("bootstrap.servers", &self.config.kafka_brokers)
            .create();
        let admin = match admin {
            Ok(admin) => admin,
            Err(e) => {
                warn!("topic setup skipped, admin client unavailable: {}", e);
                return;
            }
        };

        let topics = [
            NewTopic::new(&self.config.kafka_bootstrap_topic, 1, TopicReplication::Fixed(1)),
            NewTopic::new(&self.config.kafka_dlq_topic, 1, TopicReplication::Fixed(1)),
        ];

        match admin.create_topics(&topics, &AdminOptions::new()).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(topic) => info!("created topic: {}", topic),
                        Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                            debug!("topic already exists: {}", topic)
                        }
                        Err((topic, code)) => {
                            warn!("topic creation failed: topic={} error={}", topic, code)
                        }
                    }
                }
            }
            Err(e) => warn!("topic setup failed: {}", e),
        }
    }

    async fn receive_loop(&self, consumer: &StreamConsumer) {
        let mut stream = consumer.stream();
        info!("consumer started, waiting for messages");

        while self.running.load(Ordering::SeqCst) {
            match tokio::time::timeout(self.config.poll_timeout, stream.next()).await {
                // Poll timeout: empty iteration, re-check the stop flag.
                Err(_) => continue,
                Ok(None) => {
                    warn!("consumer stream ended");
                    self.connected.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(Some(Err(e))) => {
                    error!("transport error: {}", e);
                    self.connected.store(false, Ordering::SeqCst);
                    ERRORS.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Some(Ok(msg))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    RECEIVED.fetch_add(1, Ordering::Relaxed);
                    self.handle_message(consumer, &msg).await;
                }
            }
        }
    }

    async fn handle_message(&self, consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
        let payload = msg.payload().unwrap_or_default();

        let event = match decode_event(payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    "undecodable event payload: topic={} offset={} error={}",
                    msg.topic(),
                    msg.offset(),
                    e
                );
                ERRORS.fetch_add(1, Ordering::Relaxed);
                self.nack_dead_letter(consumer, msg, &e.to_string()).await;
                return;
            }
        };

        debug!(
            "received event: tenant_id={:?} event_id={:?} category={:?}",
            event.tenant_id, event.event_id, event.category
        );

        let alerts = self.engine.process_event(&event).await;

        for alert in &alerts {
            if let Err(e) = self.sink.publish(alert).await {
                error!(
                    "failed to publish alert, leaving message for redelivery: \
                     tenant_id={} alert_id={} error={}",
                    alert.tenant_id, alert.alert_id, e
                );
                ERRORS.fetch_add(1, Ordering::Relaxed);
                self.nack_redeliver(consumer, msg);
                return;
            }
            ALERTS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
        }

        self.ack(consumer, msg);
    }

    /// Acknowledge: commit the offset so the message is never redelivered.
    fn ack(&self, consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
        if let Err(e) = consumer.commit_message(msg, CommitMode::Async) {
            error!("failed to commit offset: {}", e);
        }
    }

    /// Negative-acknowledge with redelivery: rewind to the message offset
    /// without committing, so the next poll picks it up again.
    fn nack_redeliver(&self, consumer: &StreamConsumer, msg: &BorrowedMessage<'_>) {
        if let Err(e) = consumer.seek(
            msg.topic(),
            msg.partition(),
            Offset::Offset(msg.offset()),
            Duration::from_secs(5),
        ) {
            error!("failed to rewind for redelivery: {}", e);
        }
    }

    /// Negative-acknowledge with dead-lettering: park the message on the
    /// dead-letter topic and commit past it so a poison payload cannot wedge
    /// the partition. If parking fails the offset stays uncommitted and the
    /// message comes back.
    async fn nack_dead_letter(
        &self,
        consumer: &StreamConsumer,
        msg: &BorrowedMessage<'_>,
        error_message: &str,
    ) {
        match self.dlq.send(msg, error_message).await {
            Ok(()) => {
                DEAD_LETTERED.fetch_add(1, Ordering::Relaxed);
                self.ack(consumer, msg);
            }
            Err(e) => {
                error!("failed to dead-letter message, it will be redelivered: {}", e);
            }
        }
    }
}
