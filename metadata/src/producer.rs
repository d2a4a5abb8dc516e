use std::time::Duration;

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::health::HealthHandle;
use crate::record::{DeadLetterMessage, TaskMessage};

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);
const TOPIC_CREATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Enumeration of errors related to publishing collection tasks.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The producer's in-memory queue is full. Callers on the read path may
    /// drop the enqueue; the pending record re-drives it on the next read.
    #[error("producer buffer is full")]
    BufferFull,
    #[error("failed to serialize task payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to publish to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("publish cancelled before broker acknowledgement")]
    Canceled,
}

/// Emits tasks onto the main topic and dead letters onto the DLQ topic.
#[async_trait]
pub trait TaskSink: Send + Sync {
    /// Publish a freshly scheduled URL (retry count implicitly zero).
    async fn enqueue(&self, url: &str) -> Result<(), QueueError>;

    /// Re-publish a transiently failed URL with its incremented retry count.
    async fn publish_retry(&self, url: &str, retry_count: u32) -> Result<(), QueueError>;

    /// Route a terminally failed task to the dead letter topic.
    async fn publish_dlq(&self, url: &str, retry_count: u32, error: &str)
        -> Result<(), QueueError>;
}

/// Create the main and dead letter topics if absent. Already-existing topics
/// are not an error, so startup stays idempotent across replicas.
pub async fn ensure_topics(config: &KafkaConfig) -> Result<(), KafkaError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .create()?;

    let topics = [
        NewTopic::new(&config.topic, 3, TopicReplication::Fixed(1)),
        NewTopic::new(&config.dlq_topic, 1, TopicReplication::Fixed(1)),
    ];
    let options = AdminOptions::new().operation_timeout(Some(TOPIC_CREATE_TIMEOUT));

    for result in admin.create_topics(&topics, &options).await? {
        match result {
            Ok(topic) => info!(topic, "created kafka topic"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic, "kafka topic already exists");
            }
            Err((topic, code)) => {
                error!(topic, code = %code, "failed to create kafka topic");
                return Err(KafkaError::AdminOp(code));
            }
        }
    }

    Ok(())
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us.
        self.liveness.report_healthy();
    }
}

pub struct KafkaTaskSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
    dlq_topic: String,
}

impl KafkaTaskSink {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("client.id", "metadata-api-producer")
            .set("statistics.interval.ms", "10000")
            .set("acks", "all")
            .set("message.send.max.retries", "3")
            .set("retry.backoff.ms", "200")
            .set("linger.ms", "10")
            .set("compression.codec", "snappy");

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;
        info!(
            bootstrap = %config.bootstrap_servers,
            "kafka producer initialized"
        );

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            dlq_topic: config.dlq_topic.clone(),
        })
    }

    /// Flush buffered messages before shutdown, with a bounded timeout.
    pub fn close(&self) {
        if let Err(error) = self.producer.flush(FLUSH_TIMEOUT) {
            warn!(
                %error,
                in_flight = self.producer.in_flight_count(),
                "kafka producer shut down with unflushed messages"
            );
        } else {
            info!("kafka producer closed");
        }
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), QueueError> {
        let delivery = match self.producer.send_result(FutureRecord {
            topic,
            payload: Some(payload),
            partition: None,
            key: None::<&str>,
            timestamp: None,
            headers: None,
        }) {
            Ok(delivery) => delivery,
            Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {
                return Err(QueueError::BufferFull);
            }
            Err((error, _)) => return Err(QueueError::Kafka(error)),
        };

        // Wait for the acknowledgement from all replicas.
        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(QueueError::Kafka(error)),
            Err(_) => Err(QueueError::Canceled),
        }
    }
}

#[async_trait]
impl TaskSink for KafkaTaskSink {
    async fn enqueue(&self, url: &str) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&TaskMessage {
            url: url.to_owned(),
            retry_count: 0,
        })?;
        self.publish(&self.topic, &payload).await?;
        info!(url, topic = %self.topic, "enqueued collection task");
        Ok(())
    }

    async fn publish_retry(&self, url: &str, retry_count: u32) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&TaskMessage {
            url: url.to_owned(),
            retry_count,
        })?;
        self.publish(&self.topic, &payload).await?;
        info!(url, retry_count, topic = %self.topic, "re-enqueued collection task");
        Ok(())
    }

    async fn publish_dlq(
        &self,
        url: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&DeadLetterMessage {
            url: url.to_owned(),
            retry_count,
            error: error.to_owned(),
        })?;
        self.publish(&self.dlq_topic, &payload).await?;
        warn!(
            url,
            retry_count,
            topic = %self.dlq_topic,
            error,
            "routed task to dead letter topic"
        );
        Ok(())
    }
}
