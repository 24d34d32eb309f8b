//! Core domain model for bursary status checking.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "bursary-core";

pub const DEFAULT_BASE_URL: &str = "https://www.zabursaries.co.za";

/// A (label, absolute URL) pair found on a category page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkCandidate {
    pub label: String,
    pub url: String,
}

/// Why a single page retrieval failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchFailureKind {
    Timeout,
    HttpError(u16),
    NetworkError,
    NotFound,
}

impl FetchFailureKind {
    /// 404 will not change on retry; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FetchFailureKind::NotFound)
    }
}

impl fmt::Display for FetchFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailureKind::Timeout => write!(f, "request timed out"),
            FetchFailureKind::HttpError(code) => write!(f, "http status {code}"),
            FetchFailureKind::NetworkError => write!(f, "network error"),
            FetchFailureKind::NotFound => write!(f, "page not found (404)"),
        }
    }
}

/// Result of one logical page retrieval, after any retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { body: String },
    Failure { kind: FetchFailureKind },
}

impl FetchOutcome {
    pub fn success(body: impl Into<String>) -> Self {
        FetchOutcome::Success { body: body.into() }
    }

    pub fn failure(kind: FetchFailureKind) -> Self {
        FetchOutcome::Failure { kind }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BursaryStatus {
    Open,
    Closed,
    #[default]
    Unknown,
    Error,
}

impl BursaryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BursaryStatus::Open => "open",
            BursaryStatus::Closed => "closed",
            BursaryStatus::Unknown => "unknown",
            BursaryStatus::Error => "error",
        }
    }
}

impl fmt::Display for BursaryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified bursary listing. `url` is the identity key within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BursaryRecord {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub status: BursaryStatus,
    #[serde(default)]
    pub closing_date: Option<NaiveDate>,
    #[serde(default)]
    pub details: String,
    pub last_updated: DateTime<Utc>,
}

impl BursaryRecord {
    /// Record for a link whose page could not be retrieved. Never carries a date.
    pub fn fetch_error(candidate: &LinkCandidate, kind: FetchFailureKind, at: DateTime<Utc>) -> Self {
        Self {
            name: candidate.label.clone(),
            url: candidate.url.clone(),
            status: BursaryStatus::Error,
            closing_date: None,
            details: format!("Could not retrieve page: {kind}"),
            last_updated: at,
        }
    }

    /// Record for a page that was fetched but could not be classified.
    pub fn unclassified(candidate: &LinkCandidate, at: DateTime<Utc>) -> Self {
        Self {
            name: candidate.label.clone(),
            url: candidate.url.clone(),
            status: BursaryStatus::Unknown,
            closing_date: None,
            details: String::new(),
            last_updated: at,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == BursaryStatus::Open
    }
}

/// Persisted snapshot of the last computed record collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub records: Vec<BursaryRecord>,
    pub written_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Valid when written no later than `now` and no earlier than `now - window`.
    pub fn is_fresh(&self, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        let age = now.signed_duration_since(self.written_at);
        age >= chrono::Duration::zero() && age <= window
    }
}

/// Dated records first (earliest closing date first), then undated; ties by name, then URL.
pub fn compare_by_closing_date(a: &BursaryRecord, b: &BursaryRecord) -> Ordering {
    let by_date = match (a.closing_date, b.closing_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date
        .then_with(|| a.name.cmp(&b.name))
        .then_with(|| a.url.cmp(&b.url))
}

pub fn sort_by_closing_date(records: &mut [BursaryRecord]) {
    records.sort_by(compare_by_closing_date);
}

/// Field-of-study names whose category slug is not the plain slugified name.
const FIELD_SLUG_EXCEPTIONS: &[(&str, &str)] = &[
    ("computer science", "computer-science-it"),
    ("information technology", "computer-science-it"),
    ("it", "computer-science-it"),
    ("medicine", "medical"),
    ("health sciences", "medical"),
    ("teaching", "education"),
    ("chartered accountancy", "accounting"),
];

pub fn slugify(input: &str) -> String {
    input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

pub fn field_slug(field_of_study: &str) -> String {
    let normalized = field_of_study
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    FIELD_SLUG_EXCEPTIONS
        .iter()
        .find(|(name, _)| *name == normalized)
        .map(|(_, slug)| slug.to_string())
        .unwrap_or_else(|| slugify(&normalized))
}

pub fn category_url(base_url: &str, field_of_study: &str) -> String {
    format!(
        "{}/{}-bursaries-south-africa/",
        base_url.trim_end_matches('/'),
        field_slug(field_of_study)
    )
}
