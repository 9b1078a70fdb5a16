//! Paced HTTP fetching and raw page archiving for DSA exports.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dsa-storage";

/// Longest `Retry-After` the fetcher will honor before retrying.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive of fetched page bodies, addressed by content hash.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn page_relative_path(
        &self,
        job_started_at: DateTime<Utc>,
        district_code: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = job_started_at.format("%Y%m%d_%H%M%S").to_string();
        let district = district_code
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        PathBuf::from(stamp)
            .join(district)
            .join(format!("{content_hash}.html"))
    }

    /// Store a page body under a hash-addressed path using an atomic temp-file rename.
    /// Identical bodies within one job and district are written once.
    pub async fn store_page(
        &self,
        job_started_at: DateTime<Utc>,
        district_code: &str,
        body: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(body);
        let relative_path = self.page_relative_path(job_started_at, district_code, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let stored = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: body.len(),
            deduplicated,
        };

        let Some(parent) = absolute_path.parent() else {
            anyhow::bail!("archive path {} has no parent", absolute_path.display());
        };
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(stored(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), body.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(body)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(stored(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(stored(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp archive file {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Bounded exponential backoff. `max_attempts` counts the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Enforces a minimum gap between the start of any two outbound requests,
/// shared by every district of a job.
#[derive(Debug)]
pub struct RequestPacer {
    min_gap: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_gap: Duration) -> Self {
        Self {
            min_gap,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_gap(&self) -> Duration {
        self.min_gap
    }

    /// Waits until the gap since the previous request has elapsed and claims
    /// the slot. The lock is held while sleeping so callers queue in order.
    pub async fn wait_turn(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_gap;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub min_request_gap: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            proxy: None,
            min_request_gap: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One raw HTTP exchange as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    pub disposition: RetryDisposition,
    pub message: String,
}

/// A single GET against the source, without pacing or retry. The fetcher
/// layers both on top.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(config: &HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        if let Some(proxy) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|err| FetchError::InvalidProxy {
                proxy: proxy.clone(),
                reason: err.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self { client })
    }
}

fn retry_after_header(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl PageTransport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<TransportResponse, TransportError> {
        let to_transport_error = |err: reqwest::Error| TransportError {
            disposition: classify_reqwest_error(&err),
            message: err.to_string(),
        };
        let resp = self.client.get(url).send().await.map_err(to_transport_error)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        let retry_after = retry_after_header(&resp);
        let body = resp.bytes().await.map_err(to_transport_error)?.to_vec();
        Ok(TransportResponse {
            status,
            final_url,
            retry_after,
            body,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
    pub attempts: usize,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("invalid proxy {proxy}: {reason}")]
    InvalidProxy { proxy: String, reason: String },
    #[error("building http client: {0}")]
    Client(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("gave up on {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: usize,
        last_error: String,
    },
}

impl FetchError {
    /// True when the failure came from a transient condition that outlasted the
    /// retry limit; such failures are scoped to the page that hit them.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::RetriesExhausted { .. })
    }
}

/// Request counters for one fetcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub retries: usize,
}

#[derive(Debug, Default)]
struct FetchCounters {
    total: AtomicUsize,
    successful: AtomicUsize,
    failed: AtomicUsize,
    retries: AtomicUsize,
}

impl FetchCounters {
    fn snapshot(&self) -> FetchStats {
        FetchStats {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

pub struct HttpFetcher {
    transport: Arc<dyn PageTransport>,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
    counters: FetchCounters,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("pacer", &self.pacer)
            .field("backoff", &self.backoff)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let transport = ReqwestTransport::new(&config)?;
        Ok(Self::with_transport(Arc::new(transport), &config))
    }

    pub fn with_transport(transport: Arc<dyn PageTransport>, config: &HttpClientConfig) -> Self {
        Self {
            transport,
            pacer: RequestPacer::new(config.min_request_gap),
            backoff: config.backoff,
            counters: FetchCounters::default(),
        }
    }

    pub fn stats(&self) -> FetchStats {
        self.counters.snapshot()
    }

    /// GET `url` with job-wide pacing and bounded retry. Every attempt, including
    /// retries, waits its turn on the pacer.
    pub async fn fetch_page(
        &self,
        job_id: Uuid,
        district_code: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %job_id, district_code, url);
        self.fetch_with_retry(url).instrument(span).await
    }

    async fn fetch_with_retry(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            self.pacer.wait_turn().await;
            self.counters.total.fetch_add(1, Ordering::Relaxed);

            let retry_after = match self.transport.get(url).await {
                Ok(resp) if resp.status.is_success() => {
                    self.counters.successful.fetch_add(1, Ordering::Relaxed);
                    debug!(status = resp.status.as_u16(), bytes = resp.body.len(), "fetched");
                    return Ok(FetchedResponse {
                        status: resp.status,
                        final_url: resp.final_url,
                        body: resp.body,
                        attempts: attempt + 1,
                    });
                }
                Ok(resp) => {
                    let disposition = classify_status(resp.status);
                    if disposition == RetryDisposition::NonRetryable {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return Err(FetchError::HttpStatus {
                            status: resp.status.as_u16(),
                            url: resp.final_url,
                        });
                    }
                    last_error = format!("http status {}", resp.status.as_u16());
                    resp.retry_after
                }
                Err(err) => {
                    if err.disposition == RetryDisposition::NonRetryable {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        return Err(FetchError::Request {
                            url: url.to_string(),
                            message: err.message,
                        });
                    }
                    last_error = err.message;
                    None
                }
            };

            if attempt + 1 < max_attempts {
                let mut wait = self.backoff.delay_for_attempt(attempt);
                if let Some(hint) = retry_after {
                    wait = wait.max(hint.min(MAX_RETRY_AFTER));
                }
                warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %last_error,
                    "transient fetch failure, backing off"
                );
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(wait).await;
            }
        }

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        Err(FetchError::RetriesExhausted {
            url: url.to_string(),
            attempts: max_attempts,
            last_error,
        })
    }
}
