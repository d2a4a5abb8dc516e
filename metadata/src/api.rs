use std::collections::HashMap;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::{MetadataRecord, RecordStatus};
use crate::service::ServiceError;

/// Request body for POST /api/v1/metadata.
#[derive(Debug, Deserialize)]
pub struct CreateMetadataRequest {
    pub url: String,
}

/// Full metadata payload returned on creation and on cache hit.
#[derive(Debug, Serialize)]
pub struct MetadataResponse {
    pub id: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub page_source: String,
    pub status_code: u16,
    pub status: RecordStatus,
    pub collected_at: Option<DateTime<Utc>>,
}

impl From<MetadataRecord> for MetadataResponse {
    fn from(record: MetadataRecord) -> Self {
        Self {
            id: record.id,
            url: record.url,
            headers: record.headers,
            cookies: record.cookies,
            page_source: record.page_source,
            status_code: record.status_code,
            status: record.status,
            collected_at: record.updated_at,
        }
    }
}

/// Body returned with 202 when the record is not collected yet.
#[derive(Debug, Serialize)]
pub struct PendingResponse {
    pub url: String,
    pub status: RecordStatus,
    pub message: &'static str,
}

impl PendingResponse {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            status: RecordStatus::Pending,
            message: "Metadata collection has been scheduled. Please retry shortly.",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

/// Errors crossing the HTTP boundary. Internals stay hidden behind a uniform
/// `{"detail": ...}` body.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("url query parameter is required")]
    MissingUrl,
    #[error("{0}")]
    InvalidUrl(String),
    #[error("{0}")]
    CollectionFailed(String),
    #[error("an internal server error occurred")]
    Internal,
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        match error {
            ServiceError::InvalidUrl(e) => ApiError::InvalidUrl(e.to_string()),
            ServiceError::Collection(e) => ApiError::CollectionFailed(e.to_string()),
            ServiceError::Store(_) | ServiceError::RecordVanished(_) => ApiError::Internal,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingUrl | ApiError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            ApiError::CollectionFailed(_) | ApiError::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (
            status,
            Json(ErrorBody {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}
