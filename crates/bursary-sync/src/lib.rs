//! Check pipeline orchestration: category discovery, bounded fan-out over
//! detail pages, classification and write-through caching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bursary_adapters::{classify_page, discover_links, AdapterError, DiscoveryRules};
use bursary_core::{
    category_url, field_slug, sort_by_closing_date, BursaryRecord, BursaryStatus, FetchFailureKind,
    FetchOutcome, LinkCandidate, DEFAULT_BASE_URL,
};
use bursary_storage::{BackoffPolicy, CacheError, CacheStore, HttpClientConfig, HttpFetcher, PageSource};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bursary-sync";

#[derive(Debug, Clone)]
pub struct CheckConfig {
    pub base_url: String,
    pub cache_dir: PathBuf,
    pub cache_ttl_hours: i64,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub request_delay_ms: u64,
    pub user_agent: Option<String>,
    pub rules_path: Option<PathBuf>,
    pub reference_date: Option<NaiveDate>,
    pub refresh: bool,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cache_dir: PathBuf::from("./.bursary-cache"),
            cache_ttl_hours: CacheStore::DEFAULT_VALIDITY_HOURS,
            workers: 5,
            http_timeout_secs: 20,
            max_attempts: 3,
            request_delay_ms: 500,
            user_agent: None,
            rules_path: None,
            reference_date: None,
            refresh: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl CheckConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: std::env::var("BURSARY_BASE_URL").unwrap_or(defaults.base_url),
            cache_dir: std::env::var("BURSARY_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            cache_ttl_hours: env_parse("BURSARY_CACHE_TTL_HOURS").unwrap_or(defaults.cache_ttl_hours),
            workers: env_parse("BURSARY_WORKERS").unwrap_or(defaults.workers),
            http_timeout_secs: env_parse("BURSARY_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            max_attempts: env_parse("BURSARY_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            request_delay_ms: env_parse("BURSARY_REQUEST_DELAY_MS").unwrap_or(defaults.request_delay_ms),
            user_agent: std::env::var("BURSARY_USER_AGENT").ok(),
            rules_path: std::env::var("BURSARY_RULES_PATH").ok().map(PathBuf::from),
            reference_date: std::env::var("BURSARY_REFERENCE_DATE")
                .ok()
                .and_then(|v| NaiveDate::parse_from_str(v.trim(), "%Y-%m-%d").ok()),
            refresh: false,
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts.max(1),
                ..Default::default()
            },
            min_request_interval: Duration::from_millis(self.request_delay_ms),
        }
    }

    /// Cache validity window; an out-of-range hour count falls back to the default.
    pub fn cache_validity(&self) -> chrono::Duration {
        chrono::Duration::try_hours(self.cache_ttl_hours).unwrap_or_else(|| {
            warn!(hours = self.cache_ttl_hours, "cache ttl out of range; using default");
            chrono::Duration::hours(CacheStore::DEFAULT_VALIDITY_HOURS)
        })
    }

    pub fn load_rules(&self) -> anyhow::Result<DiscoveryRules> {
        match &self.rules_path {
            Some(path) => DiscoveryRules::from_yaml_file(path),
            None => Ok(DiscoveryRules::default()),
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckError {
    #[error("category page {url} unavailable: {kind}")]
    CategoryUnavailable { url: String, kind: FetchFailureKind },
    #[error("no candidate links found on {url}")]
    NoCandidateLinks { url: String },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl CheckError {
    /// The field has no listing: either no category page or no bursary links on it.
    pub fn is_empty_listing(&self) -> bool {
        matches!(
            self,
            CheckError::NoCandidateLinks { .. }
                | CheckError::CategoryUnavailable {
                    kind: FetchFailureKind::NotFound,
                    ..
                }
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckRunSummary {
    pub run_id: Uuid,
    pub field: String,
    pub category_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: usize,
    pub open: usize,
    pub closed: usize,
    pub unknown: usize,
    pub errors: usize,
    pub from_cache: bool,
    pub cache_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CheckRun {
    pub summary: CheckRunSummary,
    pub records: Vec<BursaryRecord>,
}

/// Everything one run needs, built once and shared by every worker.
pub struct CheckPipeline {
    config: CheckConfig,
    source: Arc<dyn PageSource>,
    cache: CacheStore,
    rules: Arc<DiscoveryRules>,
}

impl CheckPipeline {
    pub fn new(config: CheckConfig) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(config.http_client_config()).context("building http fetcher")?;
        let rules = config.load_rules()?;
        let cache = CacheStore::new(config.cache_dir.clone(), config.cache_validity());
        Ok(Self {
            config,
            source: Arc::new(http),
            cache,
            rules: Arc::new(rules),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn PageSource>) -> Self {
        self.source = source;
        self
    }

    pub fn with_rules(mut self, rules: DiscoveryRules) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn category_url(&self, field: &str) -> String {
        category_url(&self.config.base_url, field)
    }

    fn today(&self) -> NaiveDate {
        self.config
            .reference_date
            .unwrap_or_else(|| Local::now().date_naive())
    }

    pub async fn clear_cache(&self, field: &str) -> Result<bool, CacheError> {
        self.cache.clear(&field_slug(field)).await
    }

    /// Check every bursary listed for `field`, serving a fresh cache entry when one exists.
    pub async fn run_once(&self, field: &str) -> Result<CheckRun, CheckError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("check_run", %run_id, field);
        self.run_inner(run_id, field).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, field: &str) -> Result<CheckRun, CheckError> {
        let started_at = Utc::now();
        let category_url = self.category_url(field);
        let cache_key = field_slug(field);

        if !self.config.refresh {
            let mut cached = self.cache.load(&cache_key).await;
            if !cached.is_empty() {
                info!(records = cached.len(), "serving records from cache");
                let expired = close_past_closing_dates(&mut cached, self.today());
                if expired > 0 {
                    debug!(expired, "closing date passed since records were cached");
                }
                sort_by_closing_date(&mut cached);
                let summary = summarize(
                    run_id,
                    field,
                    &category_url,
                    started_at,
                    &cached,
                    true,
                    Some(self.cache.entry_path(&cache_key)),
                );
                return Ok(CheckRun {
                    summary,
                    records: cached,
                });
            }
        }

        let body = match self.source.fetch_page(&category_url).await {
            FetchOutcome::Success { body } => body,
            FetchOutcome::Failure { kind } => {
                return Err(CheckError::CategoryUnavailable {
                    url: category_url,
                    kind,
                })
            }
        };

        let candidates = discover_links(&body, &self.config.base_url, &self.rules)?;
        if candidates.is_empty() {
            return Err(CheckError::NoCandidateLinks { url: category_url });
        }
        info!(candidates = candidates.len(), "discovered candidate links");

        let mut records = self.check_candidates(candidates).await;
        sort_by_closing_date(&mut records);

        let cache_path = match self.cache.save(&cache_key, &records).await {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(error = %err, "failed to persist cache; results kept in memory only");
                None
            }
        };

        let summary = summarize(run_id, field, &category_url, started_at, &records, false, cache_path);
        info!(
            open = summary.open,
            closed = summary.closed,
            unknown = summary.unknown,
            errors = summary.errors,
            "check run complete"
        );
        Ok(CheckRun { summary, records })
    }

    /// Fetch and classify every candidate on at most `workers` concurrent tasks.
    /// Exactly one record comes back per candidate; order is completion order.
    pub async fn check_candidates(&self, candidates: Vec<LinkCandidate>) -> Vec<BursaryRecord> {
        let permits = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let results = Arc::new(Mutex::new(Vec::with_capacity(candidates.len())));
        let today = self.today();

        let mut tasks = JoinSet::new();
        let mut pending = HashMap::new();

        for candidate in candidates {
            let permits = Arc::clone(&permits);
            let results = Arc::clone(&results);
            let source = Arc::clone(&self.source);
            let task_candidate = candidate.clone();
            let span = info_span!("check_link", url = %candidate.url);

            let handle = tasks.spawn(
                async move {
                    let _permit = permits.acquire_owned().await.ok();
                    let record = check_one(source.as_ref(), &task_candidate, today).await;
                    results.lock().await.push(record);
                }
                .instrument(span),
            );
            pending.insert(handle.id(), candidate);
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((id, ())) => {
                    pending.remove(&id);
                }
                Err(err) => {
                    if let Some(candidate) = pending.remove(&err.id()) {
                        error!(url = %candidate.url, error = %err, "worker failed; marking unknown");
                        results
                            .lock()
                            .await
                            .push(BursaryRecord::unclassified(&candidate, Utc::now()));
                    }
                }
            }
        }

        let mut guard = results.lock().await;
        std::mem::take(&mut *guard)
    }
}

async fn check_one(source: &dyn PageSource, candidate: &LinkCandidate, today: NaiveDate) -> BursaryRecord {
    match source.fetch_page(&candidate.url).await {
        FetchOutcome::Success { body } => classify_record(candidate, &body, today, Utc::now()),
        FetchOutcome::Failure { kind } => {
            warn!(url = %candidate.url, %kind, "detail page fetch failed");
            BursaryRecord::fetch_error(candidate, kind, Utc::now())
        }
    }
}

/// Classify one fetched page into a record; classifier errors degrade to `Unknown`.
pub fn classify_record(
    candidate: &LinkCandidate,
    body: &str,
    today: NaiveDate,
    at: DateTime<Utc>,
) -> BursaryRecord {
    match classify_page(body, &candidate.label, today) {
        Ok(c) => {
            debug!(
                url = %candidate.url,
                status = %c.status,
                rule = ?c.rule,
                date_source = ?c.date_source,
                closing_date = ?c.closing_date,
                "classified detail page"
            );
            BursaryRecord {
                name: c.name,
                url: candidate.url.clone(),
                status: c.status,
                closing_date: c.closing_date,
                details: c.details,
                last_updated: at,
            }
        }
        Err(err) => {
            warn!(url = %candidate.url, error = %err, "classifier failed; marking unknown");
            BursaryRecord::unclassified(candidate, at)
        }
    }
}

/// Re-apply the closing-date rule against `today` to records classified on an
/// earlier day. Returns how many records changed to `Closed`.
pub fn close_past_closing_dates(records: &mut [BursaryRecord], today: NaiveDate) -> usize {
    let mut changed = 0;
    for record in records.iter_mut() {
        let passed = record.closing_date.map(|d| d < today).unwrap_or(false);
        if passed && record.status != BursaryStatus::Closed {
            record.status = BursaryStatus::Closed;
            changed += 1;
        }
    }
    changed
}

fn summarize(
    run_id: Uuid,
    field: &str,
    category_url: &str,
    started_at: DateTime<Utc>,
    records: &[BursaryRecord],
    from_cache: bool,
    cache_path: Option<PathBuf>,
) -> CheckRunSummary {
    let count = |status: BursaryStatus| records.iter().filter(|r| r.status == status).count();
    CheckRunSummary {
        run_id,
        field: field.to_string(),
        category_url: category_url.to_string(),
        started_at,
        finished_at: Utc::now(),
        candidates: records.len(),
        open: count(BursaryStatus::Open),
        closed: count(BursaryStatus::Closed),
        unknown: count(BursaryStatus::Unknown),
        errors: count(BursaryStatus::Error),
        from_cache,
        cache_path: cache_path.map(|p| p.display().to_string()),
    }
}
