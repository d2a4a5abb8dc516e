use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a metadata record. `Pending` means a collection is enqueued
/// or in flight; `Completed` means the HTTP-derived fields are valid for the
/// most recent successful fetch; `Failed` is recorded after dead letter
/// routing and is eligible for re-scheduling on a later read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    #[default]
    Pending,
    Completed,
    Failed,
}

/// A collected metadata document, keyed uniquely by canonical URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub id: String,
    pub url: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    #[serde(default)]
    pub page_source: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Payload carried on the main task topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    pub url: String,
    #[serde(default)]
    pub retry_count: u32,
}

/// Payload carried on the dead letter topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    pub url: String,
    pub retry_count: u32,
    pub error: String,
}
