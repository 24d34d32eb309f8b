//! Closing-date token recognition and parsing.

use chrono::{Datelike, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;

/// A day/month/year token in any of the accepted layouts.
pub(crate) const DATE_TOKEN: &str = concat!(
    r"\d{1,2}(?:st|nd|rd|th)?[\s\-/.]+(?:[A-Za-z]{3,9}\.?|\d{1,2})[\s\-/.,]+\d{4}",
    r"|\d{4}[/\-.]\d{1,2}[/\-.]\d{1,2}",
    r"|[A-Za-z]{3,9}\.?\s+\d{1,2}(?:st|nd|rd|th)?,?\s+\d{4}",
);

static DATE_IN_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"(?i)\b(?:{DATE_TOKEN})\b")).expect("valid date regex"));

static ORDINAL_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(\d{1,2})(?:st|nd|rd|th)\b").expect("valid ordinal regex"));

static SEPT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bsept\b").expect("valid sept regex"));

static MONTH_ABBREV_DOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([A-Za-z]{3,9})\.").expect("valid abbreviation regex"));

// %B accepts both full and abbreviated month names when parsing.
const FORMATS: &[&str] = &[
    "%d %B %Y",
    "%d-%B-%Y",
    "%d/%B/%Y",
    "%B %d %Y",
    "%Y/%m/%d",
    "%Y-%m-%d",
    "%Y.%m.%d",
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
];

const MIN_YEAR: i32 = 2000;
const MAX_YEAR: i32 = 2100;

/// Strip ordinals, commas and abbreviation dots so the token fits one of [`FORMATS`].
pub fn normalize_date_token(raw: &str) -> String {
    let stripped = ORDINAL_SUFFIX.replace_all(raw.trim(), "$1");
    let stripped = SEPT.replace_all(&stripped, "Sep");
    let stripped = MONTH_ABBREV_DOT.replace_all(&stripped, "$1");
    stripped
        .replace(',', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let normalized = normalize_date_token(raw);
    if normalized.is_empty() {
        return None;
    }
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&normalized, fmt).ok())
        .filter(|date| (MIN_YEAR..=MAX_YEAR).contains(&date.year()))
}

/// First date token in free text that actually parses.
pub fn find_date(text: &str) -> Option<NaiveDate> {
    DATE_IN_TEXT
        .find_iter(text)
        .find_map(|m| parse_date(m.as_str()))
}

pub fn format_canonical(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn supported_layouts_parse_to_the_same_day() {
        let expected = ymd(2025, 3, 15);
        for raw in [
            "15 March 2025",
            "15-Mar-2025",
            "2025/03/15",
            "2025-03-15",
            "15th March 2025",
            "15 Mar. 2025",
            "March 15, 2025",
            "15/03/2025",
            "15.03.2025",
            "15 MARCH 2025",
        ] {
            let parsed = parse_date(raw);
            assert_eq!(parsed, Some(expected), "layout {raw:?}");
            assert_eq!(format_canonical(parsed.unwrap()), "2025-03-15");
        }
    }

    #[test]
    fn ordinal_and_sept_normalization() {
        assert_eq!(normalize_date_token(" 1st  Sept, 2025 "), "1 Sep 2025");
        assert_eq!(parse_date("1st Sept 2025"), Some(ymd(2025, 9, 1)));
        assert_eq!(parse_date("22nd of nothing"), None);
    }

    #[test]
    fn unparseable_or_implausible_tokens_yield_none() {
        assert_eq!(parse_date(""), None);
        assert_eq!(parse_date("To be announced"), None);
        assert_eq!(parse_date("31 February 2025"), None);
        assert_eq!(parse_date("15 March 1899"), None);
    }

    #[test]
    fn find_date_skips_tokens_that_do_not_parse() {
        let text = "Submit 15 apples 2025 or earlier; final date 30 June 2025.";
        assert_eq!(find_date(text), Some(ymd(2025, 6, 30)));
        assert_eq!(find_date("no dates here"), None);
    }
}
