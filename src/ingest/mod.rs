use crate::batching::Batch;
use crate::diagnostics::DiagnosticCounters;
use crate::event::StateChangeEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tracing::{debug, error, info, warn};

mod retry;

pub use retry::RetryPolicy;

const USER_AGENT: &str = "hydrolix-history/0.1";

/// Longest slice of a response body kept in error messages
const ERROR_BODY_LIMIT: usize = 200;

/// Accounting for one delivered batch. `sent + dropped` equals the batch length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub sent: usize,
    pub dropped: usize,
}

/// Destination for flushed batches.
///
/// The batching worker calls `deliver` for one batch at a time and waits for
/// it; implementations own their retry budget and must account every event
/// in the returned `Outcome`.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: Batch) -> Outcome;
}

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Timeout, connection failure, 429 or 5xx; worth retrying
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    /// Authentication, validation or encoding failure; retrying cannot help
    Fatal { reason: String },
}

impl DeliveryError {
    pub fn reason(&self) -> &str {
        match self {
            DeliveryError::Transient { reason, .. } => reason,
            DeliveryError::Fatal { reason } => reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient { .. })
    }

    fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_builder() {
            return DeliveryError::Fatal {
                reason: format!("invalid ingest request: {}", err),
            };
        }
        let reason = if err.is_timeout() {
            format!("request timed out: {}", err)
        } else {
            format!("request failed: {}", err)
        };
        DeliveryError::Transient {
            reason,
            retry_after: None,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Transient { reason, .. } => write!(f, "transient: {}", reason),
            DeliveryError::Fatal { reason } => write!(f, "fatal: {}", reason),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Remote table coordinates for the ingest endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestTarget {
    pub project: String,
    pub table: String,
    pub transform: String,
}

impl IngestTarget {
    /// `project.table`, the form the ingest endpoint expects.
    pub fn table_ref(&self) -> String {
        format!("{}.{}", self.project, self.table)
    }
}

/// Transport knobs for the ingest client
#[derive(Debug, Clone, PartialEq)]
pub struct IngestOptions {
    pub request_timeout: Duration,
    /// Gzip request bodies
    pub compress: bool,
    pub retry: RetryPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            compress: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// HTTP client for the streaming ingest endpoint.
///
/// Delivers one batch per request as newline-delimited JSON records in the
/// `ha_state_history` shape. Its only side effects are on the diagnostic
/// counters.
pub struct IngestClient {
    http_client: Client,
    base_url: String,
    token: String,
    target: IngestTarget,
    options: IngestOptions,
    counters: DiagnosticCounters,
}

impl IngestClient {
    /// Create a client for `base_url` (scheme and host, e.g. "https://cluster.example.com").
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        target: IngestTarget,
        options: IngestOptions,
        counters: DiagnosticCounters,
    ) -> Result<Self> {
        let http_client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(options.request_timeout)
            .build()
            .context("Failed to build ingest HTTP client")?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            target,
            options,
            counters,
        })
    }

    pub fn target(&self) -> &IngestTarget {
        &self.target
    }

    /// Full ingest URL, for logging.
    pub fn ingest_url(&self) -> String {
        format!(
            "{}/ingest/event?table={}&transform={}",
            self.base_url,
            self.target.table_ref(),
            self.target.transform
        )
    }

    /// Probe the cluster. Any HTTP response counts as reachable.
    pub async fn check_connectivity(&self) -> bool {
        let url = format!("{}/config/v1/", self.base_url);

        match self
            .http_client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) => {
                info!(
                    base_url = %self.base_url,
                    status = response.status().as_u16(),
                    "Ingest endpoint reachable"
                );
                self.counters.mark_connected();
                true
            }
            Err(e) => {
                warn!(base_url = %self.base_url, error = %e, "Ingest endpoint unreachable");
                self.counters
                    .mark_disconnected(format!("connectivity check failed: {}", e));
                false
            }
        }
    }

    /// Deliver one batch within the retry budget and account the result.
    ///
    /// - success → `events_sent += len`, connected, last error cleared
    /// - fatal response → whole batch dropped at once, no retries
    /// - transient failures → exponential backoff; after the last attempt
    ///   the batch is dropped and the link marked disconnected
    pub async fn deliver_batch(&self, batch: &Batch) -> Outcome {
        let count = batch.len();
        if count == 0 {
            return Outcome::default();
        }

        let body = match self.encode_body(batch) {
            Ok(body) => body,
            Err(e) => return self.drop_batch(batch, e.reason().to_string(), false),
        };

        let max_attempts = self.options.retry.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            match self.attempt(&body).await {
                Ok(()) => {
                    self.counters.record_sent(count as u64);
                    debug!(
                        sequence = batch.sequence(),
                        batch_len = count,
                        body_bytes = body.len(),
                        attempt = attempt,
                        total_sent = self.counters.events_sent(),
                        "Batch delivered"
                    );
                    return Outcome {
                        sent: count,
                        dropped: 0,
                    };
                }
                Err(DeliveryError::Fatal { reason }) => {
                    return self.drop_batch(batch, reason, false);
                }
                Err(DeliveryError::Transient {
                    reason,
                    retry_after,
                }) => {
                    self.counters.record_error(reason.as_str());
                    last_error = reason;

                    if attempt < max_attempts {
                        let delay = self.options.retry.next_delay(attempt, retry_after);
                        warn!(
                            sequence = batch.sequence(),
                            attempt = attempt,
                            max_attempts = max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_error,
                            "Ingest attempt failed, will retry"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        self.drop_batch(batch, last_error, true)
    }

    fn drop_batch(&self, batch: &Batch, reason: String, disconnect: bool) -> Outcome {
        let count = batch.len();
        error!(
            sequence = batch.sequence(),
            batch_len = count,
            error = %reason,
            "Dropping batch"
        );
        self.counters.record_dropped(count as u64, reason, disconnect);
        Outcome {
            sent: 0,
            dropped: count,
        }
    }

    /// Request body for a batch: NDJSON, gzipped when compression is on.
    pub fn encode_body(&self, batch: &Batch) -> Result<Vec<u8>, DeliveryError> {
        encode_records(batch.events(), self.options.compress)
    }

    async fn attempt(&self, body: &[u8]) -> Result<(), DeliveryError> {
        let url = format!("{}/ingest/event", self.base_url);
        let table_ref = self.target.table_ref();

        let mut request = self
            .http_client
            .post(&url)
            .query(&[
                ("table", table_ref.as_str()),
                ("transform", self.target.transform.as_str()),
            ])
            .bearer_auth(&self.token)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json");
        if self.options.compress {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = request
            .body(body.to_vec())
            .send()
            .await
            .map_err(|e| DeliveryError::from_transport(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "<failed to read body>".to_string());

        Err(classify_status(status, &text, retry_after))
    }
}

#[async_trait]
impl BatchSink for IngestClient {
    async fn deliver(&self, batch: Batch) -> Outcome {
        self.deliver_batch(&batch).await
    }
}

/// Map a non-success status to a delivery error.
///
/// 429 and 5xx are transient; every other status is fatal for the batch.
pub fn classify_status(
    status: StatusCode,
    body: &str,
    retry_after: Option<Duration>,
) -> DeliveryError {
    let reason = format!("HTTP {}: {}", status.as_u16(), truncate(body, ERROR_BODY_LIMIT));

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryError::Transient {
            reason,
            retry_after,
        }
    } else {
        DeliveryError::Fatal { reason }
    }
}

/// Serialize events as newline-delimited JSON, optionally gzip-compressed.
pub fn encode_records(events: &[StateChangeEvent], compress: bool) -> Result<Vec<u8>, DeliveryError> {
    let mut raw = Vec::with_capacity(events.len() * 256);

    for (i, event) in events.iter().enumerate() {
        if i > 0 {
            raw.push(b'\n');
        }
        serde_json::to_writer(&mut raw, &event.to_record()).map_err(|e| DeliveryError::Fatal {
            reason: format!("failed to serialize batch: {}", e),
        })?;
    }

    if !compress {
        return Ok(raw);
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 4), Compression::default());
    encoder
        .write_all(&raw)
        .and_then(|_| encoder.finish())
        .map_err(|e| DeliveryError::Fatal {
            reason: format!("failed to compress batch: {}", e),
        })
}

/// `Retry-After` in delay-seconds form; HTTP-date values are ignored.
///
/// Values no `Duration` can hold (negative, NaN, infinite, overflowing)
/// are treated as absent so the regular backoff applies.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
}

/// Prefix of `text` holding at most `limit` characters.
pub(crate) fn truncate(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
