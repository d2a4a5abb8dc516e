use std::collections::HashMap;
use std::error::Error as _;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

/// HTTP status codes that indicate permanent failure (never retried).
const PERMANENT_STATUS_CODES: &[u16] = &[400, 401, 403, 404, 405, 406, 410, 414, 451];

/// HTTP status codes that indicate transient failure (worth retrying).
const TRANSIENT_STATUS_CODES: &[u16] = &[408, 429, 500, 502, 503, 504];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 10;

/// Substrings that mark a DNS resolution failure for a domain that does not
/// exist. Matched against the lowercased error chain; resolver wording
/// differs across platforms and libraries.
const DNS_FAILURE_MARKERS: &[&str] = &[
    "name or service not known",
    "no address associated",
    "getaddrinfo failed",
    "nodename nor servname",
    "failed to lookup address",
];

/// Substrings that mark a TLS verification failure.
const TLS_FAILURE_MARKERS: &[&str] = &["certificate", "tls handshake"];

/// A failed collection attempt, classified at the source so the create path
/// and the worker act on identical decisions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    /// The URL will never succeed: 4xx in the permanent set, dead DNS,
    /// broken TLS, redirect loops.
    #[error("failed to collect metadata for '{url}': {reason}")]
    Permanent { url: String, reason: String },
    /// The URL might succeed on a later attempt: 5xx, timeouts, resets.
    #[error("failed to collect metadata for '{url}': {reason}")]
    Transient { url: String, reason: String },
}

impl CollectError {
    pub fn permanent(url: &str, reason: impl Into<String>) -> Self {
        Self::Permanent {
            url: url.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn transient(url: &str, reason: impl Into<String>) -> Self {
        Self::Transient {
            url: url.to_owned(),
            reason: reason.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// Structured result of a URL metadata collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedData {
    /// Response headers of the final response, lowercase names.
    pub headers: HashMap<String, String>,
    /// Cookies set by the final response; same-name cookies collapse, last
    /// write wins.
    pub cookies: HashMap<String, String>,
    /// Response body as text.
    pub page_source: String,
    /// Status code of the final response, after redirects.
    pub status_code: u16,
}

/// Performs one HTTP GET with bounded redirects and timeouts.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<CollectedData, CollectError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<CollectedData, CollectError> {
        info!(url, "fetching url");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| classify_request_error(url, &error))?;

        let status_code = response.status().as_u16();
        if let Some(error) = classify_status(url, status_code) {
            warn!(url, status = status_code, "fetch returned a failure status");
            return Err(error);
        }

        // Header names come back from reqwest already lowercased, which is
        // the canonical casing stored documents use.
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            headers.insert(
                name.as_str().to_owned(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        let cookies: HashMap<String, String> = response
            .cookies()
            .map(|cookie| (cookie.name().to_owned(), cookie.value().to_owned()))
            .collect();

        let page_source = response.text().await.map_err(|error| {
            CollectError::transient(url, format!("failed to read response body: {error}"))
        })?;

        info!(
            url,
            status = status_code,
            bytes = page_source.len(),
            "successfully fetched url"
        );

        Ok(CollectedData {
            headers,
            cookies,
            page_source,
            status_code,
        })
    }
}

/// Classify a final response status. `None` means success.
fn classify_status(url: &str, status: u16) -> Option<CollectError> {
    if PERMANENT_STATUS_CODES.contains(&status) {
        return Some(CollectError::permanent(
            url,
            format!("HTTP {status}: permanent failure"),
        ));
    }
    if TRANSIENT_STATUS_CODES.contains(&status) {
        return Some(CollectError::transient(
            url,
            format!("HTTP {status}: server error, retryable"),
        ));
    }
    None
}

/// Classify a transport-level error from the HTTP client.
fn classify_request_error(url: &str, error: &reqwest::Error) -> CollectError {
    if error.is_timeout() {
        warn!(url, %error, "timeout fetching url");
        return CollectError::transient(url, "request timed out");
    }
    if error.is_redirect() {
        warn!(url, %error, "too many redirects");
        return CollectError::permanent(url, "too many redirects");
    }

    let chain = error_chain(error);
    if matches_any(&chain, DNS_FAILURE_MARKERS) {
        warn!(url, %error, "dns resolution failed");
        return CollectError::permanent(
            url,
            format!("dns resolution failed, domain does not exist: {error}"),
        );
    }
    if matches_any(&chain, TLS_FAILURE_MARKERS) {
        warn!(url, %error, "tls verification failed");
        return CollectError::permanent(url, format!("tls verification failed: {error}"));
    }
    if error.is_connect() {
        warn!(url, %error, "connection failed");
        return CollectError::transient(url, format!("connection failed: {error}"));
    }

    // Anything unclassified is worth another delivery.
    CollectError::transient(url, error.to_string())
}

/// Flatten an error and its sources into one lowercased string, so marker
/// matching sees the wording of the underlying resolver or TLS stack.
fn error_chain(error: &reqwest::Error) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain.to_lowercase()
}

fn matches_any(chain: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| chain.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_statuses_are_not_classified() {
        for status in [200, 201, 204, 301, 302, 418] {
            assert_eq!(classify_status("https://example.com/", status), None);
        }
    }

    #[test]
    fn permanent_statuses_are_classified() {
        for status in [400, 401, 403, 404, 405, 406, 410, 414, 451] {
            let error = classify_status("https://example.com/", status).unwrap();
            assert!(error.is_permanent(), "status {status}");
        }
    }

    #[test]
    fn transient_statuses_are_classified() {
        for status in [408, 429, 500, 502, 503, 504] {
            let error = classify_status("https://example.com/", status).unwrap();
            assert!(!error.is_permanent(), "status {status}");
        }
    }

    #[test]
    fn status_error_carries_the_url_and_code() {
        let error = classify_status("https://example.com/", 404).unwrap();
        assert_eq!(
            error.to_string(),
            "failed to collect metadata for 'https://example.com/': HTTP 404: permanent failure"
        );
    }

    #[test]
    fn dns_markers_match_resolver_wording() {
        for chain in [
            "error sending request: failed to lookup address information",
            "connect error: name or service not known",
            "dns error: no address associated with hostname",
            "getaddrinfo failed somewhere deep",
            "nodename nor servname provided, or not known",
        ] {
            assert!(matches_any(chain, DNS_FAILURE_MARKERS), "chain: {chain}");
        }
        assert!(!matches_any("connection refused", DNS_FAILURE_MARKERS));
    }

    #[test]
    fn tls_markers_match_verification_failures() {
        assert!(matches_any(
            "invalid peer certificate: unknownissuer",
            TLS_FAILURE_MARKERS
        ));
        assert!(matches_any(
            "certificate verify failed: self signed certificate",
            TLS_FAILURE_MARKERS
        ));
        assert!(!matches_any("connection reset by peer", TLS_FAILURE_MARKERS));
    }
}
