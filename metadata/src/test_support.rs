//! In-memory fakes for the trait seams, behaving like the real collaborators
//! just enough for the pipeline tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::fetcher::{CollectError, CollectedData, Fetcher};
use crate::producer::{QueueError, TaskSink};
use crate::record::{DeadLetterMessage, MetadataRecord, RecordStatus};
use crate::store::{MetadataStore, StoreError};

pub(crate) fn collected(body: &str) -> CollectedData {
    CollectedData {
        headers: HashMap::from([("content-type".to_owned(), "text/html".to_owned())]),
        cookies: HashMap::new(),
        page_source: body.to_owned(),
        status_code: 200,
    }
}

pub(crate) fn completed_record(url: &str) -> MetadataRecord {
    let now = Utc::now();
    MetadataRecord {
        id: "65f000000000000000000001".to_owned(),
        url: url.to_owned(),
        status: RecordStatus::Completed,
        headers: HashMap::from([("content-type".to_owned(), "text/html".to_owned())]),
        cookies: HashMap::new(),
        page_source: "<html>cached</html>".to_owned(),
        status_code: 200,
        error: None,
        created_at: Some(now),
        updated_at: Some(now),
    }
}

fn empty_record(id: String, url: &str, status: RecordStatus) -> MetadataRecord {
    let now = Utc::now();
    MetadataRecord {
        id,
        url: url.to_owned(),
        status,
        headers: HashMap::new(),
        cookies: HashMap::new(),
        page_source: String::new(),
        status_code: 0,
        error: None,
        created_at: Some(now),
        updated_at: Some(now),
    }
}

/// Store fake following the same state machine as the Mongo adapter.
#[derive(Default)]
pub(crate) struct MemoryStore {
    records: Mutex<HashMap<String, MetadataRecord>>,
    fail_upserts: AtomicBool,
}

impl MemoryStore {
    pub fn with_record(record: MetadataRecord) -> Self {
        let store = Self::default();
        store
            .records
            .lock()
            .unwrap()
            .insert(record.url.clone(), record);
        store
    }

    pub fn record(&self, url: &str) -> Option<MetadataRecord> {
        self.records.lock().unwrap().get(url).cloned()
    }

    pub fn insert_pending(&self, url: &str) {
        let mut records = self.records.lock().unwrap();
        let id = format!("{:024x}", records.len() + 1);
        records.insert(url.to_owned(), empty_record(id, url, RecordStatus::Pending));
    }

    pub fn insert_failed(&self, url: &str, reason: &str) {
        let mut records = self.records.lock().unwrap();
        let id = format!("{:024x}", records.len() + 1);
        let mut record = empty_record(id, url, RecordStatus::Failed);
        record.error = Some(reason.to_owned());
        records.insert(url.to_owned(), record);
    }

    /// Make every subsequent upsert fail, to exercise store error paths.
    pub fn fail_upserts(&self) {
        self.fail_upserts.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError> {
        Ok(self.record(url))
    }

    async fn upsert(&self, url: &str, data: &CollectedData) -> Result<String, StoreError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(StoreError {
                operation: "upsert",
                message: "injected failure".to_owned(),
            });
        }

        let mut records = self.records.lock().unwrap();
        let now = Utc::now();
        let id = format!("{:024x}", records.len() + 1);
        let entry = records
            .entry(url.to_owned())
            .or_insert_with(|| empty_record(id, url, RecordStatus::Pending));

        entry.status = RecordStatus::Completed;
        entry.headers = data.headers.clone();
        entry.cookies = data.cookies.clone();
        entry.page_source = data.page_source.clone();
        entry.status_code = data.status_code;
        entry.updated_at = Some(now);
        Ok(entry.id.clone())
    }

    async fn mark_pending(&self, url: &str) -> Result<bool, StoreError> {
        let mut records = self.records.lock().unwrap();
        let now = Utc::now();
        if let Some(record) = records.get_mut(url) {
            if record.status == RecordStatus::Failed {
                record.status = RecordStatus::Pending;
                record.updated_at = Some(now);
                return Ok(true);
            }
            return Ok(false);
        }

        let id = format!("{:024x}", records.len() + 1);
        records.insert(url.to_owned(), empty_record(id, url, RecordStatus::Pending));
        Ok(true)
    }

    async fn mark_failed(&self, url: &str, reason: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        if let Some(record) = records.get_mut(url) {
            record.status = RecordStatus::Failed;
            record.error = Some(reason.to_owned());
            record.updated_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Recording sink; optionally fails every publish with a full buffer.
#[derive(Default)]
pub(crate) struct MemorySink {
    pub enqueued: Mutex<Vec<String>>,
    pub retried: Mutex<Vec<(String, u32)>>,
    pub dead_lettered: Mutex<Vec<DeadLetterMessage>>,
    failing: bool,
}

impl MemorySink {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl TaskSink for MemorySink {
    async fn enqueue(&self, url: &str) -> Result<(), QueueError> {
        if self.failing {
            return Err(QueueError::BufferFull);
        }
        self.enqueued.lock().unwrap().push(url.to_owned());
        Ok(())
    }

    async fn publish_retry(&self, url: &str, retry_count: u32) -> Result<(), QueueError> {
        if self.failing {
            return Err(QueueError::BufferFull);
        }
        self.retried
            .lock()
            .unwrap()
            .push((url.to_owned(), retry_count));
        Ok(())
    }

    async fn publish_dlq(
        &self,
        url: &str,
        retry_count: u32,
        error: &str,
    ) -> Result<(), QueueError> {
        if self.failing {
            return Err(QueueError::BufferFull);
        }
        self.dead_lettered.lock().unwrap().push(DeadLetterMessage {
            url: url.to_owned(),
            retry_count,
            error: error.to_owned(),
        });
        Ok(())
    }
}

/// Fetcher fake playing back a queue of scripted outcomes.
pub(crate) struct ScriptedFetcher {
    outcomes: Mutex<VecDeque<Result<CollectedData, CollectError>>>,
}

impl ScriptedFetcher {
    pub fn new(outcomes: impl IntoIterator<Item = Result<CollectedData, CollectError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<CollectedData, CollectError> {
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted fetch outcome left for {url}"))
    }
}
