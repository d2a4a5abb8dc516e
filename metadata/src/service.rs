use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::canonical::{canonicalize, CanonicalizeError};
use crate::fetcher::{CollectError, Fetcher};
use crate::producer::TaskSink;
use crate::record::{MetadataRecord, RecordStatus};
use crate::store::{MetadataStore, StoreError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    InvalidUrl(#[from] CanonicalizeError),
    #[error(transparent)]
    Collection(#[from] CollectError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("record for '{0}' missing after upsert")]
    RecordVanished(String),
}

/// Orchestrates the synchronous create path and the cache-miss scheduling of
/// the read path over the canonicalizer, store, fetcher and producer. All
/// handles are injected at construction; nothing reaches for a global.
pub struct MetadataService {
    store: Arc<dyn MetadataStore>,
    sink: Arc<dyn TaskSink>,
    fetcher: Arc<dyn Fetcher>,
}

impl MetadataService {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        sink: Arc<dyn TaskSink>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            store,
            sink,
            fetcher,
        }
    }

    /// Collect and store metadata for a URL synchronously, returning the
    /// persisted record. Fetcher errors propagate unchanged.
    pub async fn create_metadata(&self, raw_url: &str) -> Result<MetadataRecord, ServiceError> {
        let url = canonicalize(raw_url)?;
        info!(url, raw_url, "creating metadata");

        let collected = self.fetcher.fetch(&url).await?;
        self.store.upsert(&url, &collected).await?;

        self.store
            .find_by_url(&url)
            .await?
            .ok_or(ServiceError::RecordVanished(url))
    }

    /// Look up metadata for a URL. `None` means the record is not completed
    /// and a background collection is scheduled or already in flight.
    pub async fn get_metadata(
        &self,
        raw_url: &str,
    ) -> Result<Option<MetadataRecord>, ServiceError> {
        let url = canonicalize(raw_url)?;

        if let Some(record) = self.store.find_by_url(&url).await? {
            if record.status == RecordStatus::Completed {
                info!(url, "cache hit");
                return Ok(Some(record));
            }
        }

        info!(url, "cache miss, scheduling background collection");
        if self.store.mark_pending(&url).await? {
            if let Err(err) = self.sink.enqueue(&url).await {
                // The pending record persists, so the next read retries the
                // enqueue.
                error!(url, error = %err, "failed to enqueue url");
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{collected, completed_record, MemorySink, MemoryStore, ScriptedFetcher};

    fn service(
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        fetcher: ScriptedFetcher,
    ) -> MetadataService {
        MetadataService::new(store, sink, Arc::new(fetcher))
    }

    #[tokio::test]
    async fn create_metadata_fetches_and_stores_under_the_canonical_key() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let service = service(
            store.clone(),
            sink.clone(),
            ScriptedFetcher::new([Ok(collected("<html>Test</html>"))]),
        );

        let record = service.create_metadata("https://example.com").await.unwrap();

        assert_eq!(record.url, "https://example.com/");
        assert_eq!(record.status, RecordStatus::Completed);
        assert_eq!(record.page_source, "<html>Test</html>");
        assert_eq!(record.status_code, 200);
        assert!(store.record("https://example.com/").is_some());
    }

    #[tokio::test]
    async fn create_metadata_propagates_fetch_failures() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let service = service(
            store.clone(),
            sink,
            ScriptedFetcher::new([Err(CollectError::transient(
                "https://bad.example/",
                "connection failed: connection refused",
            ))]),
        );

        let result = service.create_metadata("https://bad.example/").await;

        assert!(matches!(result, Err(ServiceError::Collection(_))));
        assert!(store.record("https://bad.example/").is_none());
    }

    #[tokio::test]
    async fn create_metadata_rejects_unparseable_input() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let service = service(store, sink, ScriptedFetcher::new([]));

        let result = service.create_metadata("http://[invalid").await;

        assert!(matches!(result, Err(ServiceError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn get_metadata_returns_completed_records_without_enqueueing() {
        let store = Arc::new(MemoryStore::with_record(completed_record(
            "https://example.com/",
        )));
        let sink = Arc::new(MemorySink::default());
        let service = service(store, sink.clone(), ScriptedFetcher::new([]));

        let record = service.get_metadata("https://example.com").await.unwrap();

        assert_eq!(record.unwrap().status, RecordStatus::Completed);
        assert!(sink.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_metadata_schedules_collection_on_miss() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let service = service(store.clone(), sink.clone(), ScriptedFetcher::new([]));

        let record = service.get_metadata("https://unknown.example").await.unwrap();

        assert!(record.is_none());
        assert_eq!(
            sink.enqueued.lock().unwrap().as_slice(),
            &["https://unknown.example/".to_owned()]
        );
        assert_eq!(
            store.record("https://unknown.example/").unwrap().status,
            RecordStatus::Pending
        );
    }

    #[tokio::test]
    async fn get_metadata_does_not_re_enqueue_a_pending_url() {
        let store = Arc::new(MemoryStore::default());
        store.insert_pending("https://pending.example/");
        let sink = Arc::new(MemorySink::default());
        let service = service(store, sink.clone(), ScriptedFetcher::new([]));

        let record = service.get_metadata("https://pending.example/").await.unwrap();

        assert!(record.is_none());
        assert!(sink.enqueued.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_metadata_reschedules_a_failed_url() {
        let store = Arc::new(MemoryStore::default());
        store.insert_failed("https://flaky.example/", "HTTP 503: server error, retryable");
        let sink = Arc::new(MemorySink::default());
        let service = service(store.clone(), sink.clone(), ScriptedFetcher::new([]));

        let record = service.get_metadata("https://flaky.example/").await.unwrap();

        assert!(record.is_none());
        assert_eq!(sink.enqueued.lock().unwrap().len(), 1);
        assert_eq!(
            store.record("https://flaky.example/").unwrap().status,
            RecordStatus::Pending
        );
    }

    #[tokio::test]
    async fn get_metadata_swallows_enqueue_failures() {
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::failing());
        let service = service(store.clone(), sink, ScriptedFetcher::new([]));

        let record = service.get_metadata("https://unknown.example").await.unwrap();

        // The read still answers "pending"; the record persists so a later
        // read can retry the enqueue.
        assert!(record.is_none());
        assert_eq!(
            store.record("https://unknown.example/").unwrap().status,
            RecordStatus::Pending
        );
    }
}
