use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{self, doc, oid::ObjectId, Bson};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, UpdateOptions};
use mongodb::{Client, Collection, IndexModel};
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::fetcher::CollectedData;
use crate::record::{MetadataRecord, RecordStatus};

const COLLECTION_NAME: &str = "metadata";
const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// A failed store operation, labelled with the operation that produced it.
/// Synchronous callers translate this to a 500; the worker treats it as a
/// transient failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("database error during '{operation}': {message}")]
pub struct StoreError {
    pub operation: &'static str,
    pub message: String,
}

impl StoreError {
    fn new(operation: &'static str, error: &mongodb::error::Error) -> Self {
        Self {
            operation,
            message: error.to_string(),
        }
    }

    fn message(operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// The four operations the pipeline needs from the document store. Every
/// operation is a single round trip built on the store's native conditional
/// writes; the store is the serialization point for record transitions, so
/// no caller may read-modify-write around it.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Plain lookup by canonical URL.
    async fn find_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError>;

    /// Insert or overwrite the record for `url` with freshly collected data,
    /// transitioning it to completed. `created_at` is only set on insert.
    /// Returns the record id.
    async fn upsert(&self, url: &str, data: &CollectedData) -> Result<String, StoreError>;

    /// Atomically claim `url` for background collection. Returns true only
    /// when the record was newly created or transitioned out of failed;
    /// completed and already-pending records are left alone.
    async fn mark_pending(&self, url: &str) -> Result<bool, StoreError>;

    /// Record a terminal failure reason. Silent if the record is absent:
    /// workers never create records through this path.
    async fn mark_failed(&self, url: &str, reason: &str) -> Result<(), StoreError>;
}

/// Wire shape of a metadata document. Pending and failed records carry no
/// HTTP-derived fields, so everything except the key deserializes from a
/// default.
#[derive(Debug, Deserialize)]
struct MetadataDocument {
    #[serde(rename = "_id")]
    id: ObjectId,
    url: String,
    #[serde(default)]
    status: RecordStatus,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default)]
    cookies: HashMap<String, String>,
    #[serde(default)]
    page_source: String,
    #[serde(default)]
    status_code: i32,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    created_at: Option<bson::DateTime>,
    #[serde(default)]
    updated_at: Option<bson::DateTime>,
}

impl From<MetadataDocument> for MetadataRecord {
    fn from(document: MetadataDocument) -> Self {
        Self {
            id: document.id.to_hex(),
            url: document.url,
            status: document.status,
            headers: document.headers,
            cookies: document.cookies,
            page_source: document.page_source,
            status_code: u16::try_from(document.status_code).unwrap_or(0),
            error: document.error,
            created_at: document.created_at.and_then(to_utc),
            updated_at: document.updated_at.and_then(to_utc),
        }
    }
}

fn to_utc(timestamp: bson::DateTime) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(timestamp.timestamp_millis())
}

#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    collection: Collection<MetadataDocument>,
}

impl MongoStore {
    /// Establish the connection pool with exponential backoff, verifying the
    /// deployment with a ping before handing the handle out.
    pub async fn connect(uri: &str, db_name: &str) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri)
            .await
            .map_err(|e| StoreError::new("connect", &e))?;
        options.server_selection_timeout = Some(Duration::from_secs(5));
        options.max_pool_size = Some(50);
        options.min_pool_size = Some(5);

        let mut delay = CONNECT_BASE_DELAY;
        for attempt in 1..=CONNECT_ATTEMPTS {
            info!(attempt, max_attempts = CONNECT_ATTEMPTS, "connecting to mongodb");
            let client = Client::with_options(options.clone())
                .map_err(|e| StoreError::new("connect", &e))?;

            match client.database("admin").run_command(doc! { "ping": 1 }).await {
                Ok(_) => {
                    info!("mongodb connection established");
                    let collection = client.database(db_name).collection(COLLECTION_NAME);
                    return Ok(Self { client, collection });
                }
                Err(e) if attempt < CONNECT_ATTEMPTS => {
                    warn!(
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs(),
                        "mongodb connection attempt failed, retrying"
                    );
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(
                        "failed to connect to mongodb after {} attempts",
                        CONNECT_ATTEMPTS
                    );
                    return Err(StoreError::new("connect", &e));
                }
            }
        }

        unreachable!("connection loop always returns")
    }

    /// Unique index on `url` for lookups and deduplication, secondary index
    /// on `status`.
    pub async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let url_index = IndexModel::builder()
            .keys(doc! { "url": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .name("idx_url_unique".to_owned())
                    .build(),
            )
            .build();
        let status_index = IndexModel::builder()
            .keys(doc! { "status": 1 })
            .options(IndexOptions::builder().name("idx_status".to_owned()).build())
            .build();

        self.collection
            .create_index(url_index)
            .await
            .map_err(|e| StoreError::new("ensure_indexes", &e))?;
        self.collection
            .create_index(status_index)
            .await
            .map_err(|e| StoreError::new("ensure_indexes", &e))?;

        info!("indexes ensured on '{}' collection", COLLECTION_NAME);
        Ok(())
    }

    /// Deterministic teardown of the connection pool at shutdown.
    pub async fn close(&self) {
        self.client.clone().shutdown().await;
        info!("mongodb connection closed");
    }

    async fn existing_id(&self, url: &str) -> Result<String, StoreError> {
        let document = self
            .collection
            .find_one(doc! { "url": url })
            .await
            .map_err(|e| StoreError::new("upsert", &e))?;
        match document {
            Some(document) => Ok(document.id.to_hex()),
            None => Err(StoreError::message(
                "upsert",
                format!("duplicate key conflict for {url}"),
            )),
        }
    }
}

#[async_trait]
impl MetadataStore for MongoStore {
    async fn find_by_url(&self, url: &str) -> Result<Option<MetadataRecord>, StoreError> {
        let document = self
            .collection
            .find_one(doc! { "url": url })
            .await
            .map_err(|e| {
                error!(url, error = %e, "database lookup failed");
                StoreError::new("find_by_url", &e)
            })?;
        Ok(document.map(MetadataRecord::from))
    }

    async fn upsert(&self, url: &str, data: &CollectedData) -> Result<String, StoreError> {
        let now = bson::DateTime::now();
        let headers = bson::to_document(&data.headers)
            .map_err(|e| StoreError::message("upsert", e.to_string()))?;
        let cookies = bson::to_document(&data.cookies)
            .map_err(|e| StoreError::message("upsert", e.to_string()))?;

        let update = doc! {
            "$set": {
                "url": url,
                "status": "completed",
                "headers": headers,
                "cookies": cookies,
                "page_source": &data.page_source,
                "status_code": i32::from(data.status_code),
                "updated_at": now,
            },
            "$setOnInsert": { "created_at": now },
        };

        let result = self
            .collection
            .update_one(doc! { "url": url }, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await;

        match result {
            Ok(outcome) => {
                let id = match outcome.upserted_id.as_ref().and_then(Bson::as_object_id) {
                    Some(id) => id.to_hex(),
                    // Updated in place, read the existing id back.
                    None => self.existing_id(url).await?,
                };
                info!(url, id, "upserted metadata record");
                Ok(id)
            }
            // Lost a concurrent insert race: the record exists now, so the
            // one-shot retry is a plain read.
            Err(e) if is_duplicate_key(&e) => self.existing_id(url).await,
            Err(e) => {
                error!(url, error = %e, "database upsert failed");
                Err(StoreError::new("upsert", &e))
            }
        }
    }

    async fn mark_pending(&self, url: &str) -> Result<bool, StoreError> {
        let now = bson::DateTime::now();
        let filter = doc! {
            "url": url,
            "status": { "$nin": ["completed", "pending"] },
        };
        let update = doc! {
            "$set": { "url": url, "status": "pending", "updated_at": now },
            "$setOnInsert": { "created_at": now },
        };

        let result = self
            .collection
            .update_one(filter, update)
            .with_options(UpdateOptions::builder().upsert(true).build())
            .await;

        match result {
            Ok(outcome) => {
                let newly_marked = outcome.upserted_id.is_some() || outcome.modified_count > 0;
                if newly_marked {
                    info!(url, "marked url as pending");
                } else {
                    debug!(url, "url already pending or completed, skipping");
                }
                Ok(newly_marked)
            }
            // Another request created the record first: treat as already
            // scheduled.
            Err(e) if is_duplicate_key(&e) => {
                debug!(url, "lost mark_pending race, skipping");
                Ok(false)
            }
            Err(e) => {
                error!(url, error = %e, "mark_pending failed");
                Err(StoreError::new("mark_pending", &e))
            }
        }
    }

    async fn mark_failed(&self, url: &str, reason: &str) -> Result<(), StoreError> {
        let update = doc! {
            "$set": {
                "status": "failed",
                "error": reason,
                "updated_at": bson::DateTime::now(),
            },
        };

        self.collection
            .update_one(doc! { "url": url }, update)
            .await
            .map_err(|e| {
                error!(url, error = %e, "mark_failed failed");
                StoreError::new("mark_failed", &e)
            })?;

        warn!(url, reason, "marked url as failed");
        Ok(())
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    match &*error.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        ErrorKind::Command(command_error) => command_error.code == 11000,
        _ => false,
    }
}
