//! HTTP fetch utilities + time-bounded record cache for bursary checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bursary_core::{BursaryRecord, CacheEntry, FetchFailureKind, FetchOutcome};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bursary-storage";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl From<FetchFailureKind> for RetryDisposition {
    fn from(kind: FetchFailureKind) -> Self {
        if kind.is_retryable() {
            RetryDisposition::Retryable
        } else {
            RetryDisposition::NonRetryable
        }
    }
}

pub fn classify_status(status: StatusCode) -> FetchFailureKind {
    if status == StatusCode::NOT_FOUND {
        FetchFailureKind::NotFound
    } else {
        FetchFailureKind::HttpError(status.as_u16())
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> (FetchFailureKind, RetryDisposition) {
    if err.is_timeout() {
        (FetchFailureKind::Timeout, RetryDisposition::Retryable)
    } else if err.is_builder() {
        // The request could not be built (bad URL); retrying cannot help.
        (FetchFailureKind::NetworkError, RetryDisposition::NonRetryable)
    } else {
        (FetchFailureKind::NetworkError, RetryDisposition::Retryable)
    }
}

#[derive(Debug, Clone, Copy)]
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
            max_delay: Duration::from_secs(8),
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub min_request_interval: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            min_request_interval: Duration::from_millis(500),
        }
    }
}

/// Spaces out request starts across every caller sharing the pacer.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(reserved) if reserved > now => reserved,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Anything that can turn a URL into a page body or a classified failure.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> FetchOutcome;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    pacer: RequestPacer,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy)]
struct AttemptFailure {
    kind: FetchFailureKind,
    disposition: RetryDisposition,
}

impl From<FetchFailureKind> for AttemptFailure {
    fn from(kind: FetchFailureKind) -> Self {
        Self {
            kind,
            disposition: kind.into(),
        }
    }
}

fn browser_headers(user_agent: &str) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(user_agent).context("user agent is not a valid header value")?,
    );
    headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));
    Ok(headers)
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let user_agent = config.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);
        let client = reqwest::Client::builder()
            .default_headers(browser_headers(user_agent)?)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            pacer: RequestPacer::new(config.min_request_interval),
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying retryable failures with backoff. 404 is returned after one attempt.
    pub async fn fetch(&self, url: &str) -> FetchOutcome {
        let attempts = self.backoff.max_attempts.max(1);
        let mut last = FetchFailureKind::NetworkError;

        for attempt in 0..attempts {
            self.pacer.wait().await;
            let span = info_span!("http_fetch", url, attempt = attempt + 1);
            let failure = match self.attempt(url).instrument(span).await {
                Ok(body) => return FetchOutcome::Success { body },
                Err(failure) => failure,
            };
            last = failure.kind;

            if failure.disposition == RetryDisposition::NonRetryable || attempt + 1 >= attempts {
                break;
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            debug!(url, attempt = attempt + 1, ?delay, kind = %failure.kind, "retrying fetch");
            tokio::time::sleep(delay).await;
        }

        warn!(url, kind = %last, "fetch failed");
        FetchOutcome::Failure { kind: last }
    }

    async fn attempt(&self, url: &str) -> Result<String, AttemptFailure> {
        let resp = self.client.get(url).send().await.map_err(|err| {
            let (kind, disposition) = classify_reqwest_error(&err);
            debug!(error = %err, "request error");
            AttemptFailure { kind, disposition }
        })?;

        let status = resp.status();
        if status.is_success() {
            return resp.text().await.map_err(|err| {
                let (kind, disposition) = classify_reqwest_error(&err);
                debug!(error = %err, "error reading response body");
                AttemptFailure { kind, disposition }
            });
        }

        debug!(status = status.as_u16(), "unsuccessful status");
        Err(classify_status(status).into())
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> FetchOutcome {
        self.fetch(url).await
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt cache entry at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// One JSON file per key holding the last record collection and its write time.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
    validity: chrono::Duration,
}

impl CacheStore {
    pub const DEFAULT_VALIDITY_HOURS: i64 = 24;

    pub fn new(root: impl Into<PathBuf>, validity: chrono::Duration) -> Self {
        Self {
            root: root.into(),
            validity,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn validity(&self) -> chrono::Duration {
        self.validity
    }

    pub fn entry_path(&self, key: &str) -> PathBuf {
        let file_stem = bursary_core::slugify(key);
        let file_stem = if file_stem.is_empty() { "default".to_string() } else { file_stem };
        self.root.join(format!("{file_stem}.json"))
    }

    pub async fn load(&self, key: &str) -> Vec<BursaryRecord> {
        self.load_at(key, Utc::now()).await
    }

    /// Records for `key` if written within the validity window before `now`; empty otherwise.
    pub async fn load_at(&self, key: &str, now: DateTime<Utc>) -> Vec<BursaryRecord> {
        match self.read_entry(key).await {
            Ok(Some(entry)) if entry.is_fresh(now, self.validity) => entry.records,
            Ok(Some(entry)) => {
                debug!(key, written_at = %entry.written_at, "cache entry outside validity window");
                Vec::new()
            }
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(key, error = %err, "ignoring unreadable cache entry");
                Vec::new()
            }
        }
    }

    pub async fn read_entry(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { path, source })
    }

    pub async fn save(&self, key: &str, records: &[BursaryRecord]) -> Result<PathBuf, CacheError> {
        self.save_at(key, records, Utc::now()).await
    }

    /// Persist the full collection via temp-file + rename so readers never see a partial write.
    pub async fn save_at(
        &self,
        key: &str,
        records: &[BursaryRecord],
        written_at: DateTime<Utc>,
    ) -> Result<PathBuf, CacheError> {
        let entry = CacheEntry {
            records: records.to_vec(),
            written_at,
        };
        let bytes = serde_json::to_vec_pretty(&entry)?;
        let path = self.entry_path(key);

        fs::create_dir_all(&self.root).await.map_err(|source| CacheError::Io {
            path: self.root.clone(),
            source,
        })?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let write_result = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(&bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await;

        match write_result {
            Ok(()) => Ok(path),
            Err(source) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(CacheError::Io { path, source })
            }
        }
    }

    /// Remove the entry for `key`. Returns whether a file was deleted.
    pub async fn clear(&self, key: &str) -> Result<bool, CacheError> {
        let path = self.entry_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(CacheError::Io { path, source }),
        }
    }
}
