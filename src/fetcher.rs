use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use reqwest::{Client, StatusCode, Url};
use tokio::time::{sleep, timeout};

use crate::config::FetchConfig;

/// Ceiling on any single retry backoff.
pub const MAX_BACKOFF_SECONDS: f64 = 60.0;
/// Jitter is uniform in [0, JITTER_MAX_FACTOR * base_backoff].
pub const JITTER_MAX_FACTOR: f64 = 0.1;

/// Result of fetching one ICS source. A 304 is a success with `content: None`;
/// the caller reuses its cached parse.
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub success: bool,
    pub status_code: Option<u16>,
    pub content: Option<Bytes>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub error_message: Option<String>,
}

impl FetchResponse {
    fn failure(status_code: Option<u16>, message: impl Into<String>) -> Self {
        FetchResponse {
            success: false,
            status_code,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

enum AttemptOutcome {
    Done(FetchResponse),
    Retry { corruption: bool, message: String },
}

/// HTTP fetcher for ICS sources: SSRF validation, conditional requests,
/// bounded retries with jittered exponential backoff.
pub struct IcsFetcher {
    client: Client,
    max_retries: u32,
    backoff_factor: f64,
    request_timeout: Duration,
}

impl IcsFetcher {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_seconds);
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(IcsFetcher {
            client,
            max_retries: config.max_retries,
            backoff_factor: config.retry_backoff_factor,
            request_timeout,
        })
    }

    /// Only http/https URLs with a present host may be fetched.
    pub fn validate_url_for_ssrf(url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => {
                matches!(parsed.scheme(), "http" | "https")
                    && parsed.host_str().is_some_and(|h| !h.is_empty())
            }
            Err(_) => false,
        }
    }

    /// Conditional headers for a revalidation request.
    pub fn conditional_headers(etag: Option<&str>, last_modified: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(value) = etag.and_then(|e| HeaderValue::from_str(e).ok()) {
            headers.insert(IF_NONE_MATCH, value);
        }
        if let Some(value) = last_modified.and_then(|lm| HeaderValue::from_str(lm).ok()) {
            headers.insert(IF_MODIFIED_SINCE, value);
        }
        headers
    }

    /// Backoff in seconds before the next attempt. Corruption responses jump
    /// straight to the cap so a poisoned feed is not hammered.
    fn calculate_backoff(&self, attempt: u32, corruption_detected: bool) -> f64 {
        let base = if corruption_detected {
            MAX_BACKOFF_SECONDS
        } else {
            (2f64.powi(attempt as i32) * self.backoff_factor).min(MAX_BACKOFF_SECONDS)
        };
        let jitter = rand::thread_rng().gen_range(0.0..=(JITTER_MAX_FACTOR * base));
        base + jitter
    }

    /// Fetch one source, honoring prior etag/last-modified.
    pub async fn fetch(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> FetchResponse {
        if !Self::validate_url_for_ssrf(url) {
            warn!("Rejected ICS source URL failing SSRF validation: {}", url);
            return FetchResponse::failure(None, format!("URL rejected by SSRF guard: {url}"));
        }

        let mut last_message = String::from("Unknown error");
        for attempt in 0..=self.max_retries {
            match self.attempt(url, etag, last_modified).await {
                AttemptOutcome::Done(response) => return response,
                AttemptOutcome::Retry {
                    corruption,
                    message,
                } => {
                    last_message = message;
                    if attempt < self.max_retries {
                        let backoff = self.calculate_backoff(attempt, corruption);
                        debug!(
                            "Fetch attempt {}/{} for {} failed ({}), retrying in {:.1}s",
                            attempt + 1,
                            self.max_retries + 1,
                            url,
                            last_message,
                            backoff
                        );
                        sleep(Duration::from_secs_f64(backoff)).await;
                    }
                }
            }
        }

        warn!("All fetch retries exhausted for {}: {}", url, last_message);
        FetchResponse::failure(None, last_message)
    }

    async fn attempt(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> AttemptOutcome {
        let request = self
            .client
            .get(url)
            .headers(Self::conditional_headers(etag, last_modified));

        let response = match timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                return AttemptOutcome::Retry {
                    corruption: false,
                    message: format!("Request failed: {e}"),
                }
            }
            Err(_) => {
                return AttemptOutcome::Retry {
                    corruption: false,
                    message: "Request timed out".to_string(),
                }
            }
        };

        let status = response.status();
        let new_etag = header_string(response.headers(), "etag");
        let new_last_modified = header_string(response.headers(), "last-modified");

        if status == StatusCode::NOT_MODIFIED {
            return AttemptOutcome::Done(FetchResponse {
                success: true,
                status_code: Some(status.as_u16()),
                content: None,
                etag: new_etag.or_else(|| etag.map(str::to_string)),
                last_modified: new_last_modified.or_else(|| last_modified.map(str::to_string)),
                error_message: None,
            });
        }

        if status.is_success() {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return AttemptOutcome::Retry {
                        corruption: false,
                        message: format!("Failed to read response body: {e}"),
                    }
                }
            };
            if is_corrupt_calendar_body(&body) {
                return AttemptOutcome::Retry {
                    corruption: true,
                    message: "Response body is empty or not an ICS calendar".to_string(),
                };
            }
            return AttemptOutcome::Done(FetchResponse {
                success: true,
                status_code: Some(status.as_u16()),
                content: Some(body),
                etag: new_etag,
                last_modified: new_last_modified,
                error_message: None,
            });
        }

        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            return AttemptOutcome::Retry {
                corruption: false,
                message: format!("HTTP {status}"),
            };
        }

        // Remaining 4xx are not retryable.
        AttemptOutcome::Done(FetchResponse::failure(
            Some(status.as_u16()),
            format!("HTTP {status}"),
        ))
    }
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Empty bodies and bodies missing the calendar marker are treated as
/// corruption rather than parsed.
fn is_corrupt_calendar_body(body: &[u8]) -> bool {
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    trimmed.is_empty() || !trimmed.starts_with("BEGIN:VCALENDAR")
}
