//! Candidate link discovery on category pages.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::Context;
use bursary_core::LinkCandidate;
use scraper::Html;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{selector, text_or_none, AdapterError};

/// Keyword / exclusion / boilerplate lists driving candidate selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryRules {
    #[serde(default = "default_keywords")]
    pub keywords: Vec<String>,
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,
    #[serde(default = "default_boilerplate")]
    pub boilerplate: Vec<String>,
}

fn default_keywords() -> Vec<String> {
    ["bursary", "scholarship", "fellowship"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_exclusions() -> Vec<String> {
    [
        "payment date",
        "payment-date",
        "nsfas-payment",
        "status check",
        "status-check",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_boilerplate() -> Vec<String> {
    [
        "view-all",
        "/news",
        "/category/",
        "/tag/",
        "/page/",
        "/author/",
        "/feed",
        "/wp-content/",
        "/wp-login",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for DiscoveryRules {
    fn default() -> Self {
        Self {
            keywords: default_keywords(),
            exclusions: default_exclusions(),
            boilerplate: default_boilerplate(),
        }
    }
}

impl DiscoveryRules {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let mut rules: Self = serde_yaml::from_str(text).context("parsing discovery rules")?;
        rules.lowercase_all();
        Ok(rules)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    fn lowercase_all(&mut self) {
        for list in [&mut self.keywords, &mut self.exclusions, &mut self.boilerplate] {
            for item in list.iter_mut() {
                *item = item.to_lowercase();
            }
        }
    }

    fn is_candidate(&self, href: &str, label: &str, resolved_path: &str) -> bool {
        let href = href.to_lowercase();
        let label = label.to_lowercase();
        let mentions = |needle: &String| href.contains(needle.as_str()) || label.contains(needle.as_str());

        self.keywords.iter().any(mentions)
            && !self.exclusions.iter().any(mentions)
            && !self
                .boilerplate
                .iter()
                .any(|pattern| resolved_path.contains(pattern.as_str()))
    }
}

fn site_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

fn is_under_base(base: &Url, candidate: &Url) -> bool {
    if !matches!(candidate.scheme(), "http" | "https") || candidate.port() != base.port() {
        return false;
    }
    match (base.host_str(), candidate.host_str()) {
        (Some(base_host), Some(host)) => {
            let base_host = site_host(base_host);
            let host = site_host(host);
            host.eq_ignore_ascii_case(base_host)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", base_host.to_ascii_lowercase()))
        }
        _ => false,
    }
}

/// Identity of a page for de-duplication: host without `www.`, explicit port,
/// path without trailing slash, and query.
fn dedupe_key(url: &Url) -> String {
    let host = url.host_str().map(site_host).unwrap_or_default().to_ascii_lowercase();
    let port = url.port().map(|p| format!(":{p}")).unwrap_or_default();
    let path = url.path().trim_end_matches('/');
    match url.query() {
        Some(query) => format!("{host}{port}{path}?{query}"),
        None => format!("{host}{port}{path}"),
    }
}

/// Extract `(label, absolute URL)` pairs that look like bursary detail pages.
///
/// Hrefs are resolved against `base_url`; fragments are dropped before
/// de-duplication, so `/acme-bursary/`, `https://host/acme-bursary#apply` and
/// the bare-host form of the same page are one candidate. The first
/// occurrence keeps its URL and label.
pub fn discover_links(
    body: &str,
    base_url: &str,
    rules: &DiscoveryRules,
) -> Result<Vec<LinkCandidate>, AdapterError> {
    let base = Url::parse(base_url).map_err(|source| AdapterError::InvalidBaseUrl {
        url: base_url.to_string(),
        source,
    })?;
    let document = Html::parse_document(body);
    let anchors = selector("a[href]")?;

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for anchor in document.select(&anchors) {
        let Some(href) = anchor.value().attr("href").map(str::trim) else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') {
            continue;
        }
        let Some(label) = text_or_none(anchor.text().collect::<String>())
            .or_else(|| anchor.value().attr("title").and_then(|t| text_or_none(t.to_string())))
        else {
            continue;
        };
        let Ok(mut resolved) = base.join(href) else {
            continue;
        };
        resolved.set_fragment(None);
        if !is_under_base(&base, &resolved) {
            continue;
        }

        let mut resolved_path = resolved.path().to_lowercase();
        if let Some(query) = resolved.query() {
            resolved_path.push('?');
            resolved_path.push_str(&query.to_lowercase());
        }
        if !rules.is_candidate(href, &label, &resolved_path) {
            continue;
        }

        if seen.insert(dedupe_key(&resolved)) {
            candidates.push(LinkCandidate {
                label,
                url: resolved.to_string(),
            });
        }
    }

    Ok(candidates)
}
