//! Detail-page classification. Each field comes from the most specific
//! evidence on the page and falls back to a neutral default.

use bursary_core::BursaryStatus;
use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::dates::{find_date, parse_date, DATE_TOKEN};
use crate::{is_heading, node_text, select_first_text, selector, visible_text, AdapterError};

pub const NO_DETAILS_PLACEHOLDER: &str = "No eligibility requirements found.";

pub const DETAILS_WORD_LIMIT: usize = 50;

const ANCHOR_ELEMENTS: &str = "h1, h2, h3, h4, h5, h6, strong, b, em, dt, th";

/// Where the closing date came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateSource {
    Section,
    Pattern,
    None,
}

/// Which precedence rule settled the status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRule {
    ExplicitClosed,
    ExplicitOpen,
    ClosingDate,
    StaleContent,
    NoEvidence,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub name: String,
    pub status: BursaryStatus,
    pub closing_date: Option<NaiveDate>,
    pub details: String,
    pub date_source: DateSource,
    pub rule: StatusRule,
}

static SECTION_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)closing\s+date|deadline").expect("valid anchor regex"));

static REQUIREMENTS_ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)requirements|eligibility|criteria").expect("valid requirements regex"));

/// Ordered; earlier labels win.
const CLOSING_LABELS: &[&str] = &[
    r"closing\s+date",
    r"deadline",
    r"applications?\s+close",
    r"due\s+date",
    r"submit\s+before",
    r"last\s+day\s+to\s+apply",
    r"open\s+until",
    r"apply\s+by",
    r"closes\s+on",
];

static LABELED_DATES: Lazy<Vec<Regex>> = Lazy::new(|| {
    CLOSING_LABELS
        .iter()
        .map(|label| {
            Regex::new(&format!(
                r"(?i)\b{label}\b[\s:\-–]*(?:(?:is|on|by)\b[\s:]*)?({DATE_TOKEN})"
            ))
            .expect("valid labeled date regex")
        })
        .collect()
});

static CLOSED_PHRASING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\bapplications?\s+(?:are\s+|have\s+|has\s+|is\s+)?(?:now\s+)?closed\b",
        r"|\bapplications\s+for\s+(?:the\s+)?\d{4}\s+(?:\w+\s+)?(?:are|have)\s+(?:now\s+)?closed\b",
        r"|\bdeadline\s+has\s+(?:now\s+|already\s+)?passed\b",
        r"|\bno\s+longer\s+accepting\s+applications\b",
        r"|\bclosed\s+for\s+applications\b",
        r"|\bthis\s+(?:bursary|scholarship|fellowship|programme|program)\s+(?:is|has)\s+(?:now\s+)?closed\b",
    ))
    .expect("valid closed regex")
});

static OPEN_PHRASING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)\bapplications?\s+(?:are\s+|is\s+)?(?:now\s+)?open\b",
        r"|\bapplications\s+for\s+(?:the\s+)?\d{4}\s+(?:\w+\s+)?are\s+(?:now\s+)?open\b",
        r"|\bapply\s+now\b",
        r"|\bnow\s+accepting\s+applications\b",
        r"|\bopen\s+for\s+applications\b",
    ))
    .expect("valid open regex")
});

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:19|20)\d{2}\b").expect("valid year regex"));

/// Classify a fetched detail page. `label` is the provisional name used when
/// the page has no `<h1>`; `today` decides whether a closing date has passed.
pub fn classify_page(body: &str, label: &str, today: NaiveDate) -> Result<Classification, AdapterError> {
    let document = Html::parse_document(body);
    let text = visible_text(&document);

    let name = select_first_text(&document, "h1")?.unwrap_or_else(|| label.trim().to_string());

    let (closing_date, date_source) = match section_anchored_date(&document)? {
        Some(date) => (Some(date), DateSource::Section),
        None => match pattern_anchored_date(&text) {
            Some(date) => (Some(date), DateSource::Pattern),
            None => (None, DateSource::None),
        },
    };

    let (status, rule) = decide_status(&text, closing_date, today);
    let details = requirements_excerpt(&document, DETAILS_WORD_LIMIT)?
        .unwrap_or_else(|| NO_DETAILS_PLACEHOLDER.to_string());

    Ok(Classification {
        name,
        status,
        closing_date,
        details,
        date_source,
        rule,
    })
}

/// Precedence: explicit closure, explicit opening (unless the date has passed),
/// closing date, stale content, otherwise unknown.
pub fn decide_status(text: &str, closing_date: Option<NaiveDate>, today: NaiveDate) -> (BursaryStatus, StatusRule) {
    let date_passed = closing_date.map(|d| d < today).unwrap_or(false);

    if CLOSED_PHRASING.is_match(text) {
        return (BursaryStatus::Closed, StatusRule::ExplicitClosed);
    }
    if OPEN_PHRASING.is_match(text) && !date_passed {
        return (BursaryStatus::Open, StatusRule::ExplicitOpen);
    }
    if closing_date.is_some() {
        let status = if date_passed {
            BursaryStatus::Closed
        } else {
            BursaryStatus::Open
        };
        return (status, StatusRule::ClosingDate);
    }
    if !mentions_current_or_next_year(text, today) {
        return (BursaryStatus::Closed, StatusRule::StaleContent);
    }
    (BursaryStatus::Unknown, StatusRule::NoEvidence)
}

fn mentions_current_or_next_year(text: &str, today: NaiveDate) -> bool {
    let current = today.year();
    YEAR.find_iter(text)
        .filter_map(|m| m.as_str().parse::<i32>().ok())
        .any(|year| year == current || year == current + 1)
}

fn section_anchored_date(document: &Html) -> Result<Option<NaiveDate>, AdapterError> {
    let anchors = selector(ANCHOR_ELEMENTS)?;
    for anchor in document.select(&anchors) {
        let anchor_text = node_text(*anchor);
        if !SECTION_ANCHOR.is_match(&anchor_text) {
            continue;
        }
        let found = following_block_text(anchor)
            .and_then(|block| find_date(&block))
            .or_else(|| find_date(&anchor_text));
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn pattern_anchored_date(text: &str) -> Option<NaiveDate> {
    LABELED_DATES
        .iter()
        .filter_map(|re| re.captures(text))
        .find_map(|caps| caps.get(1).and_then(|m| parse_date(m.as_str())))
}

/// Text of the first non-blank node after `anchor`, climbing to the parent
/// when the anchor is the last thing in its block.
fn following_block_text(anchor: ElementRef<'_>) -> Option<String> {
    let mut current = Some(*anchor);
    for _ in 0..3 {
        let node = current?;
        let next = node
            .next_siblings()
            .map(node_text)
            .find(|text| text.chars().any(char::is_alphanumeric));
        if next.is_some() {
            return next;
        }
        current = node.parent();
    }
    None
}

fn requirements_excerpt(document: &Html, word_limit: usize) -> Result<Option<String>, AdapterError> {
    let anchors = selector(ANCHOR_ELEMENTS)?;
    for anchor in document.select(&anchors) {
        if !REQUIREMENTS_ANCHOR.is_match(&node_text(*anchor)) {
            continue;
        }
        if let Some(excerpt) = section_excerpt(anchor, word_limit) {
            return Ok(Some(excerpt));
        }
    }
    Ok(None)
}

fn section_excerpt(anchor: ElementRef<'_>, word_limit: usize) -> Option<String> {
    let mut words: Vec<String> = Vec::new();
    let mut truncated = false;
    let mut current = Some(*anchor);

    'climb: for _ in 0..3 {
        let Some(node) = current else {
            break;
        };
        for sibling in node.next_siblings() {
            if is_heading(sibling) {
                break;
            }
            for word in node_text(sibling).split_whitespace() {
                if words.len() == word_limit {
                    truncated = true;
                    break 'climb;
                }
                words.push(word.to_string());
            }
        }
        if !words.is_empty() {
            break;
        }
        current = node.parent();
    }

    if words.is_empty() {
        return None;
    }
    let mut excerpt = words.join(" ");
    if truncated {
        excerpt.push('…');
    }
    Some(excerpt)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn section_anchored_date_reads_following_block() {
        let html = r#"
            <h1>Sasol Engineering Bursary 2025</h1>
            <h3>Closing Date</h3>
            <p>30th September 2025</p>
            <p>Deadline: 1 July 2025 for late applicants.</p>
        "#;
        let c = classify_page(html, "Sasol", today()).unwrap();
        assert_eq!(c.name, "Sasol Engineering Bursary 2025");
        assert_eq!(c.closing_date, Some(ymd(2025, 9, 30)));
        assert_eq!(c.date_source, DateSource::Section);
        assert_eq!(c.status, BursaryStatus::Open);
        assert_eq!(c.rule, StatusRule::ClosingDate);
    }

    #[test]
    fn inline_strong_anchor_uses_trailing_text() {
        let html = "<p><strong>Closing date:</strong> 15-Mar-2025</p>";
        let c = classify_page(html, "Acme Bursary", today()).unwrap();
        assert_eq!(c.name, "Acme Bursary");
        assert_eq!(c.closing_date, Some(ymd(2025, 3, 15)));
        assert_eq!(c.date_source, DateSource::Section);
        assert_eq!(c.status, BursaryStatus::Closed);
    }

    #[test]
    fn pattern_fallback_when_no_section_anchor() {
        let html = "<div><p>Applications close: 31 July 2025. Late entries are ignored.</p></div>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.closing_date, Some(ymd(2025, 7, 31)));
        assert_eq!(c.date_source, DateSource::Pattern);
        assert_eq!(c.status, BursaryStatus::Open);
    }

    #[test]
    fn pattern_labels_are_tried_in_order() {
        let text = "Last day to apply: 20 August 2025. Due date: 10 August 2025.";
        assert_eq!(pattern_anchored_date(text), Some(ymd(2025, 8, 10)));
    }

    #[test]
    fn unparseable_section_falls_through_to_pattern() {
        let html = "<h4>Deadline</h4><p>To be confirmed</p><p>Submit before 2025/08/01</p>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.closing_date, Some(ymd(2025, 8, 1)));
        assert_eq!(c.date_source, DateSource::Pattern);
    }

    #[test]
    fn explicit_closed_phrasing_beats_future_date() {
        let html = "<p>Applications are now closed.</p><p>Closing date: 30 November 2025</p>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.closing_date, Some(ymd(2025, 11, 30)));
        assert_eq!(c.status, BursaryStatus::Closed);
        assert_eq!(c.rule, StatusRule::ExplicitClosed);
    }

    #[test]
    fn explicit_open_phrasing_with_past_date_is_closed() {
        let yesterday = today().pred_opt().unwrap();
        let text = format!(
            "Applications are open. Closing date: {}",
            yesterday.format("%d %B %Y")
        );
        let (status, rule) = decide_status(&text, Some(yesterday), today());
        assert_eq!(status, BursaryStatus::Closed);
        assert_eq!(rule, StatusRule::ClosingDate);

        let html = format!("<p>{text}</p>");
        let c = classify_page(&html, "Acme", today()).unwrap();
        assert_eq!(c.closing_date, Some(yesterday));
        assert_eq!(c.status, BursaryStatus::Closed);
    }

    #[test]
    fn explicit_open_phrasing_without_date_is_open() {
        let html = "<p>Apply now for the 2025 intake!</p>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.closing_date, None);
        assert_eq!(c.status, BursaryStatus::Open);
        assert_eq!(c.rule, StatusRule::ExplicitOpen);
    }

    #[test]
    fn closing_date_today_is_still_open() {
        let (status, _) = decide_status("", Some(today()), today());
        assert_eq!(status, BursaryStatus::Open);
    }

    #[test]
    fn stale_content_without_evidence_is_closed() {
        let html = "<p>The 2019 programme supported 40 students.</p>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.status, BursaryStatus::Closed);
        assert_eq!(c.rule, StatusRule::StaleContent);
    }

    #[test]
    fn current_year_without_evidence_is_unknown() {
        let html = "<p>Details for the 2026 cycle will be published soon.</p>";
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(c.status, BursaryStatus::Unknown);
        assert_eq!(c.rule, StatusRule::NoEvidence);
        assert_eq!(c.details, NO_DETAILS_PLACEHOLDER);
    }

    #[test]
    fn requirements_excerpt_stops_at_next_heading() {
        let html = r#"
            <h2>Eligibility Requirements</h2>
            <ul><li>South African citizen</li><li>Studying Computer Science</li></ul>
            <p>Minimum 65% average.</p>
            <h2>How to apply</h2>
            <p>Email your CV.</p>
        "#;
        let c = classify_page(html, "Acme", today()).unwrap();
        assert_eq!(
            c.details,
            "South African citizen Studying Computer Science Minimum 65% average."
        );
    }

    #[test]
    fn requirements_excerpt_is_bounded() {
        let long = (1..=80).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let html = format!("<p><strong>Criteria:</strong> {long}</p>");
        let c = classify_page(&html, "Acme", today()).unwrap();
        assert_eq!(c.details.split_whitespace().count(), DETAILS_WORD_LIMIT);
        assert!(c.details.starts_with("w1 w2 "));
        assert!(c.details.ends_with("w50…"));
    }

    #[test]
    fn malformed_markup_still_yields_a_classification() {
        let html = "<div><h3>Closing date<p>sometime <b>soon</div></table>";
        let c = classify_page(html, "Broken Page", today()).unwrap();
        assert_eq!(c.name, "Broken Page");
        assert_eq!(c.closing_date, None);
        assert_eq!(c.status, BursaryStatus::Closed);
        assert_eq!(c.rule, StatusRule::StaleContent);
    }
}
