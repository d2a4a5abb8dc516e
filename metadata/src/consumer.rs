use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::fetcher::{CollectError, Fetcher};
use crate::health::HealthHandle;
use crate::producer::TaskSink;
use crate::record::TaskMessage;
use crate::store::{MetadataStore, StoreError};

/// Terminal outcome of one task; the loop commits the offset after any of
/// these, and only after one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retried(u32),
    DeadLettered,
}

/// Classified failure of one processing attempt.
enum TaskError {
    Permanent(String),
    Transient(String),
}

impl From<CollectError> for TaskError {
    fn from(error: CollectError) -> Self {
        let message = error.to_string();
        if error.is_permanent() {
            TaskError::Permanent(message)
        } else {
            TaskError::Transient(message)
        }
    }
}

impl From<StoreError> for TaskError {
    // A store failure is worth another delivery.
    fn from(error: StoreError) -> Self {
        TaskError::Transient(error.to_string())
    }
}

/// Processes dequeued tasks: fetch, persist, and on failure decide between
/// re-enqueue and the dead letter topic.
pub struct Worker {
    store: Arc<dyn MetadataStore>,
    sink: Arc<dyn TaskSink>,
    fetcher: Arc<dyn Fetcher>,
    max_retries: u32,
}

impl Worker {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn TaskSink>,
        fetcher: Arc<dyn Fetcher>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            sink,
            fetcher,
            max_retries,
        }
    }

    /// Fetch the URL and persist the collected data as a completed record.
    async fn process(&self, url: &str) -> Result<(), TaskError> {
        let collected = self.fetcher.fetch(url).await?;
        let id = self.store.upsert(url, &collected).await?;
        info!(
            url,
            id,
            bytes = collected.page_source.len(),
            "collected and stored metadata"
        );
        Ok(())
    }

    /// Drive one dequeued task to a terminal decision. Failures to publish a
    /// retry or dead letter are logged and swallowed so the caller commits
    /// the offset either way; the pending record re-drives on the next read.
    pub async fn handle(&self, task: &TaskMessage) -> Disposition {
        counter!("metadata_worker_tasks_total").increment(1);

        match self.process(&task.url).await {
            Ok(()) => {
                counter!("metadata_worker_tasks_completed").increment(1);
                Disposition::Completed
            }
            Err(TaskError::Permanent(reason)) => {
                error!(
                    url = %task.url,
                    reason,
                    "permanent failure, routing to dead letter"
                );
                self.dead_letter(&task.url, task.retry_count, &reason).await;
                Disposition::DeadLettered
            }
            Err(TaskError::Transient(reason)) => {
                let attempt = task.retry_count + 1;
                if attempt >= self.max_retries {
                    error!(
                        url = %task.url,
                        attempt,
                        reason,
                        "transient failure exhausted retries, routing to dead letter"
                    );
                    self.dead_letter(&task.url, attempt, &reason).await;
                    Disposition::DeadLettered
                } else {
                    warn!(
                        url = %task.url,
                        attempt,
                        max_retries = self.max_retries,
                        reason,
                        "transient failure, re-enqueueing"
                    );
                    if let Err(error) = self.sink.publish_retry(&task.url, attempt).await {
                        error!(url = %task.url, %error, "failed to re-enqueue task");
                    }
                    counter!("metadata_worker_tasks_retried").increment(1);
                    Disposition::Retried(attempt)
                }
            }
        }
    }

    async fn dead_letter(&self, url: &str, retry_count: u32, reason: &str) {
        counter!("metadata_worker_tasks_dead_lettered").increment(1);
        match self.sink.publish_dlq(url, retry_count, reason).await {
            Ok(()) => {
                if let Err(error) = self.store.mark_failed(url, reason).await {
                    error!(url, %error, "failed to mark record as failed");
                }
            }
            Err(error) => error!(url, %error, "failed to publish to dead letter topic"),
        }
    }
}

/// Build the manually committed consumer for the main topic.
pub fn create_consumer(config: &KafkaConfig) -> Result<StreamConsumer, KafkaError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("group.id", &config.consumer_group)
        .set("auto.offset.reset", "earliest")
        .set("enable.auto.commit", "false")
        .set("session.timeout.ms", "30000")
        .set("max.poll.interval.ms", "300000")
        .create()?;

    consumer.subscribe(&[config.topic.as_str()])?;
    info!(
        topic = %config.topic,
        group = %config.consumer_group,
        "kafka consumer created"
    );
    Ok(consumer)
}

/// How long one poll may block. Every iteration reports liveness and checks
/// the shutdown token, so both stay responsive on an idle topic.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Long-lived consumer loop: poll with a bounded timeout, decode, dispatch,
/// commit. Offsets are committed only after a terminal disposition, which
/// gives at-least-once delivery; duplicate deliveries converge through the
/// idempotent upsert.
pub async fn run_consumer(
    consumer: StreamConsumer,
    worker: Worker,
    liveness: HealthHandle,
    shutdown: CancellationToken,
) {
    info!("kafka consumer started");
    loop {
        liveness.report_healthy();

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("kafka consumer shutting down");
                break;
            }
            result = tokio::time::timeout(POLL_TIMEOUT, consumer.recv()) => match result {
                // Poll window elapsed with no message.
                Err(_) => {}
                Ok(Err(KafkaError::PartitionEOF(partition))) => {
                    debug!(partition, "reached end of partition");
                }
                Ok(Err(error)) => {
                    error!(%error, "kafka consumer error");
                }
                Ok(Ok(message)) => {
                    // Malformed payloads are skipped without a commit: no
                    // work happened for them.
                    let Some(task) = decode_task(&message) else {
                        continue;
                    };
                    info!(
                        url = %task.url,
                        partition = message.partition(),
                        offset = message.offset(),
                        "received collection task"
                    );

                    let disposition = worker.handle(&task).await;
                    debug!(url = %task.url, ?disposition, "task reached a terminal state");

                    if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
                        error!(%error, offset = message.offset(), "failed to commit offset");
                    }
                }
            }
        }
    }
    info!("kafka consumer closed");
}

fn decode_task(message: &BorrowedMessage<'_>) -> Option<TaskMessage> {
    let Some(payload) = message.payload() else {
        warn!(offset = message.offset(), "received message with empty payload");
        return None;
    };

    let task: TaskMessage = match serde_json::from_slice(payload) {
        Ok(task) => task,
        Err(error) => {
            error!(offset = message.offset(), %error, "failed to decode task message");
            return None;
        }
    };

    if task.url.is_empty() {
        warn!(offset = message.offset(), "received task message without a url");
        return None;
    }

    Some(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::CollectError;
    use crate::record::RecordStatus;
    use crate::test_support::{collected, MemorySink, MemoryStore, ScriptedFetcher};

    const URL: &str = "https://example.com/";

    fn worker(
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        fetcher: ScriptedFetcher,
    ) -> Worker {
        Worker::new(store, sink, Arc::new(fetcher), 3)
    }

    fn task(retry_count: u32) -> TaskMessage {
        TaskMessage {
            url: URL.to_owned(),
            retry_count,
        }
    }

    #[tokio::test]
    async fn success_completes_the_record() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Ok(collected("<html>Hello</html>"))]),
        );

        let disposition = worker.handle(&task(0)).await;

        assert_eq!(disposition, Disposition::Completed);
        let record = store.record(URL).unwrap();
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.page_source, "<html>Hello</html>");
        assert_eq!(record.status_code, 200);
        assert!(sink.dead_lettered.lock().unwrap().is_empty());
        assert!(sink.retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn permanent_failure_goes_straight_to_the_dlq() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Err(CollectError::permanent(
                URL,
                "HTTP 404: permanent failure",
            ))]),
        );
        // The read path created a pending record before enqueueing.
        store.insert_pending(URL);

        let disposition = worker.handle(&task(0)).await;

        assert_eq!(disposition, Disposition::DeadLettered);
        let dead_lettered = sink.dead_lettered.lock().unwrap();
        assert_eq!(dead_lettered.len(), 1);
        assert_eq!(dead_lettered[0].retry_count, 0);
        assert!(dead_lettered[0].error.contains("HTTP 404"));
        drop(dead_lettered);

        let record = store.record(URL).unwrap();
        assert_eq!(record.status, RecordStatus::Failed);
        assert!(record.error.unwrap().contains("HTTP 404"));
        assert!(sink.retried.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_republishes_with_incremented_count() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Err(CollectError::transient(URL, "request timed out"))]),
        );

        let disposition = worker.handle(&task(0)).await;

        assert_eq!(disposition, Disposition::Retried(1));
        assert_eq!(
            sink.retried.lock().unwrap().as_slice(),
            &[(URL.to_owned(), 1)]
        );
        assert!(sink.dead_lettered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_route_to_the_dlq() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Err(CollectError::transient(
                URL,
                "HTTP 503: server error, retryable",
            ))]),
        );
        store.insert_pending(URL);

        // Third delivery of a task that failed twice before.
        let disposition = worker.handle(&task(2)).await;

        assert_eq!(disposition, Disposition::DeadLettered);
        let dead_lettered = sink.dead_lettered.lock().unwrap();
        assert_eq!(dead_lettered.len(), 1);
        assert_eq!(dead_lettered[0].retry_count, 3);
        drop(dead_lettered);
        assert!(sink.retried.lock().unwrap().is_empty());
        assert_eq!(store.record(URL).unwrap().status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn retries_then_dead_letters_a_persistently_failing_url() {
        // Drive the full accounting: with a maximum of three attempts, the
        // task is re-published with counts 1 and 2, then dead lettered.
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([
                Err(CollectError::transient(URL, "HTTP 503: server error, retryable")),
                Err(CollectError::transient(URL, "HTTP 503: server error, retryable")),
                Err(CollectError::transient(URL, "HTTP 503: server error, retryable")),
            ]),
        );
        store.insert_pending(URL);

        assert_eq!(worker.handle(&task(0)).await, Disposition::Retried(1));
        assert_eq!(worker.handle(&task(1)).await, Disposition::Retried(2));
        assert_eq!(worker.handle(&task(2)).await, Disposition::DeadLettered);

        assert_eq!(
            sink.retried.lock().unwrap().as_slice(),
            &[(URL.to_owned(), 1), (URL.to_owned(), 2)]
        );
        assert_eq!(sink.dead_lettered.lock().unwrap().len(), 1);
        assert_eq!(store.record(URL).unwrap().status, RecordStatus::Failed);
    }

    #[tokio::test]
    async fn transient_failure_then_success_converges_to_completed() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([
                Err(CollectError::transient(URL, "request timed out")),
                Ok(collected("<html>Hello</html>")),
            ]),
        );

        assert_eq!(worker.handle(&task(0)).await, Disposition::Retried(1));
        assert_eq!(worker.handle(&task(1)).await, Disposition::Completed);

        assert_eq!(store.record(URL).unwrap().status, RecordStatus::Completed);
        assert!(sink.dead_lettered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_failures_still_reach_a_terminal_disposition() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::failing());

        let retry_worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Err(CollectError::transient(URL, "request timed out"))]),
        );
        // The re-enqueue is lost, but the offset still gets committed; the
        // pending record re-drives collection on the next read.
        assert_eq!(retry_worker.handle(&task(0)).await, Disposition::Retried(1));

        store.insert_pending(URL);
        let dlq_worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Err(CollectError::permanent(
                URL,
                "HTTP 404: permanent failure",
            ))]),
        );
        assert_eq!(dlq_worker.handle(&task(0)).await, Disposition::DeadLettered);
        // The DLQ publish failed, so the record was not marked failed.
        assert_eq!(store.record(URL).unwrap().status, RecordStatus::Pending);
    }

    #[tokio::test]
    async fn store_failures_are_treated_as_transient() {
        let store = Arc::new(MemoryStore::default());
        store.fail_upserts();
        let sink = Arc::new(MemorySink::default());
        let worker = worker(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Ok(collected("<html>Hello</html>"))]),
        );

        let disposition = worker.handle(&task(0)).await;

        assert_eq!(disposition, Disposition::Retried(1));
        assert_eq!(
            sink.retried.lock().unwrap().as_slice(),
            &[(URL.to_owned(), 1)]
        );
    }
}
