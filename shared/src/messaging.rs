//! Publish/subscribe plumbing shared by the services.
//!
//! Delivery is at-least-once. Records are keyed, so messages sharing a
//! partition key reach a consumer group in send order. Handlers must tolerate
//! duplicates.

use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication, TopicResult};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::{Message, Offset};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode message for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to deliver message to {topic}: {reason}")]
    Delivery { topic: String, reason: String },
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &str) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, topic: &str, partition_key: &str, payload: &str) -> Result<(), PublishError> {
        (**self).publish(topic, partition_key, payload).await
    }
}

pub async fn publish_json<P, T>(
    publisher: &P,
    topic: &str,
    partition_key: &str,
    message: &T,
) -> Result<(), PublishError>
where
    P: EventPublisher + ?Sized,
    T: Serialize + Sync,
{
    let json = serde_json::to_string(message).map_err(|source| PublishError::Encode {
        topic: topic.to_string(),
        source,
    })?;
    publisher.publish(topic, partition_key, &json).await
}

pub struct KafkaPublisher {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            timeout: Duration::from_secs(5),
        }
    }

    pub fn connect(brokers: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self::new(producer))
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &str) -> Result<(), PublishError> {
        let record = FutureRecord::to(topic).payload(payload).key(partition_key);

        self.producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| PublishError::Delivery {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        debug!("Published message to {} with key {}", topic, partition_key);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub key: String,
    pub payload: String,
}

/// In-process channel that records every message in send order. Used by
/// tests and local wiring; can be switched into a failing mode.
#[derive(Debug, Default)]
pub struct MemoryChannel {
    messages: Mutex<Vec<Envelope>>,
    failing: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn messages(&self, topic: &str) -> Vec<Envelope> {
        self.messages
            .lock()
            .map(|messages| messages.iter().filter(|m| m.topic == topic).cloned().collect())
            .unwrap_or_default()
    }

    pub fn decoded<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.messages(topic)
            .iter()
            .filter_map(|m| serde_json::from_str(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryChannel {
    async fn publish(&self, topic: &str, partition_key: &str, payload: &str) -> Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Delivery {
                topic: topic.to_string(),
                reason: "channel unavailable".to_string(),
            });
        }

        let mut messages = self.messages.lock().map_err(|_| PublishError::Delivery {
            topic: topic.to_string(),
            reason: "channel lock poisoned".to_string(),
        })?;
        messages.push(Envelope {
            topic: topic.to_string(),
            key: partition_key.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

/// What the consumer loop does with a message once its handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit the offset; the message is done.
    Ack,
    /// Leave the offset uncommitted and seek back so the message is redelivered.
    Retry,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, payload: &str) -> Disposition;
}

/// Decodes a JSON payload, logging and acking undecodable messages so a
/// poison message cannot block its partition.
pub fn decode<T: DeserializeOwned>(payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(message) => Some(message),
        Err(e) => {
            error!("Discarding undecodable message: {}", e);
            None
        }
    }
}

/// A topic the services expect the broker to carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
}

impl TopicSpec {
    pub fn new(name: &str, partitions: i32, replication: i32) -> Self {
        Self {
            name: name.to_string(),
            partitions: partitions.max(1),
            replication: replication.max(1),
        }
    }

    /// Order events are keyed by order id and spread over three partitions.
    pub fn order_created() -> Self {
        Self::new(crate::ORDER_CREATED_TOPIC, 3, 1)
    }

    fn as_new_topic(&self) -> NewTopic<'_> {
        NewTopic::new(&self.name, self.partitions, TopicReplication::Fixed(self.replication))
    }
}

fn provisioned(result: &TopicResult) -> bool {
    matches!(result, Ok(_) | Err((_, RDKafkaErrorCode::TopicAlreadyExists)))
}

/// Creates any missing topics. Existing topics are left as they are, even if
/// their partition count differs.
pub async fn ensure_topics(brokers: &str, topics: &[TopicSpec]) -> anyhow::Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .create()?;

    let new_topics: Vec<NewTopic<'_>> = topics.iter().map(TopicSpec::as_new_topic).collect();
    let options = AdminOptions::new().operation_timeout(Some(Duration::from_secs(10)));

    for result in admin.create_topics(&new_topics, &options).await? {
        match &result {
            Ok(name) => info!("Created topic {}", name),
            Err((name, _)) if provisioned(&result) => debug!("Topic {} already exists", name),
            Err((name, code)) => anyhow::bail!("failed to create topic {}: {}", name, code),
        }
    }
    Ok(())
}

pub fn consumer_config(brokers: &str, group_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest");
    config
}

pub fn subscribe(brokers: &str, group_id: &str, topic: &str) -> anyhow::Result<StreamConsumer> {
    let consumer: StreamConsumer = consumer_config(brokers, group_id).create()?;
    consumer.subscribe(&[topic])?;
    Ok(consumer)
}

/// Runs one worker: messages are handled one at a time, in partition order.
/// Offsets are committed only after the handler acks.
pub async fn consume<H>(consumer: StreamConsumer, handler: &H, retry_delay: Duration)
where
    H: MessageHandler + ?Sized,
{
    let mut message_stream = consumer.stream();

    while let Some(message) = message_stream.next().await {
        match message {
            Ok(m) => {
                let disposition = match m.payload_view::<str>() {
                    Some(Ok(json_str)) => handler.handle(json_str).await,
                    Some(Err(e)) => {
                        error!("Error parsing payload: {}", e);
                        Disposition::Ack
                    }
                    None => {
                        warn!("Skipping empty message at {}:{}", m.topic(), m.offset());
                        Disposition::Ack
                    }
                };

                match disposition {
                    Disposition::Ack => {
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            error!("Error committing message: {}", e);
                        }
                    }
                    Disposition::Retry => {
                        time::sleep(retry_delay).await;
                        if let Err(e) = consumer.seek(
                            m.topic(),
                            m.partition(),
                            Offset::Offset(m.offset()),
                            Duration::from_secs(5),
                        ) {
                            error!("Error rewinding to offset {}: {}", m.offset(), e);
                        }
                    }
                }
            }
            Err(e) => error!("Error receiving message: {}", e),
        }
    }
}
