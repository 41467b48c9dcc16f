//! HTTP plumbing shared by the network providers: status classification,
//! retries for transient failures and freshness validators.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use url::Url;

use super::RawContent;
use crate::document::FreshnessTag;
use crate::error::{DocsError, Result};
use crate::retry::{MAX_RETRY_AFTER, RetryPolicy};

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Failure of one HTTP attempt, tagged with whether retrying can help.
#[derive(Debug)]
struct AttemptError {
    error: DocsError,
    retryable: bool,
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

pub(crate) struct HttpFetcher {
    tool: String,
    client: Client,
    retry: RetryPolicy,
}

impl HttpFetcher {
    pub(crate) fn new(tool: &str, client: Client, retry: RetryPolicy) -> Self {
        Self {
            tool: tool.to_string(),
            client,
            retry,
        }
    }

    /// GET with retries on connection errors and 5xx responses.
    /// 404/410 map to `NotFound`, 429 to `RateLimited`.
    pub(crate) async fn get(&self, url: &Url) -> Result<RawContent> {
        self.retry
            .run(move || self.get_once(url), |e: &AttemptError| e.retryable)
            .await
            .map_err(|e| e.error)
    }

    /// HEAD request returning the validators the server sent, if any.
    pub(crate) async fn head(&self, url: &Url) -> Result<Option<FreshnessTag>> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| DocsError::source_unavailable(&self.tool, request_failure(&e)))?;
        if !response.status().is_success() {
            return Err(self.status_error(response.status(), response.headers(), url).error);
        }
        let tag = freshness_from_headers(response.headers());
        Ok((!tag.is_empty()).then_some(tag))
    }

    async fn get_once(&self, url: &Url) -> std::result::Result<RawContent, AttemptError> {
        let response = self.client.get(url.clone()).send().await.map_err(|e| AttemptError {
            error: DocsError::source_unavailable(&self.tool, request_failure(&e)),
            retryable: true,
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, response.headers(), url));
        }
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| AttemptError {
            error: DocsError::source_unavailable(&self.tool, request_failure(&e)),
            retryable: true,
        })?;
        Ok(RawContent {
            location: url.to_string(),
            body,
            content_type: header_string(&headers, CONTENT_TYPE.as_str()),
            freshness: Some(freshness_from_headers(&headers)),
            fetched_at: Utc::now(),
        })
    }

    fn status_error(&self, status: StatusCode, headers: &HeaderMap, url: &Url) -> AttemptError {
        match status {
            StatusCode::NOT_FOUND | StatusCode::GONE => AttemptError {
                error: DocsError::not_found(&self.tool, url),
                retryable: false,
            },
            StatusCode::TOO_MANY_REQUESTS => AttemptError {
                error: DocsError::RateLimited {
                    tool: self.tool.clone(),
                    retry_after: retry_after(headers),
                },
                retryable: false,
            },
            status => AttemptError {
                error: DocsError::source_unavailable(&self.tool, format!("{url} returned {status}")),
                retryable: status.is_server_error(),
            },
        }
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn freshness_from_headers(headers: &HeaderMap) -> FreshnessTag {
    FreshnessTag {
        etag: header_string(headers, ETAG.as_str()),
        last_modified: header_string(headers, LAST_MODIFIED.as_str()),
        content_length: header_string(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok()),
    }
}

fn retry_after(headers: &HeaderMap) -> Duration {
    header_string(headers, RETRY_AFTER.as_str())
        .and_then(|v| v.parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

fn request_failure(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("request timed out: {err}")
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        err.to_string()
    }
}
