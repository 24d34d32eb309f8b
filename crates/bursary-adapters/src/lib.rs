//! HTML adapters: category-page link discovery and detail-page classification.

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;

pub mod classifier;
pub mod dates;
pub mod discovery;

pub use classifier::{classify_page, Classification, DateSource, StatusRule, NO_DETAILS_PLACEHOLDER};
pub use dates::{find_date, format_canonical, parse_date};
pub use discovery::{discover_links, DiscoveryRules};

pub const CRATE_NAME: &str = "bursary-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub(crate) fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let collapsed = collapse_whitespace(&value);
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

pub(crate) fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("bad selector {css}: {e}")))
}

pub(crate) fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .find_map(|n| text_or_none(n.text().collect::<String>())))
}

fn is_non_content(name: &str) -> bool {
    matches!(name, "script" | "style" | "noscript" | "template")
}

pub(crate) fn is_heading(node: ego_tree::NodeRef<'_, Node>) -> bool {
    node.value()
        .as_element()
        .map(|el| matches!(el.name(), "h1" | "h2" | "h3" | "h4" | "h5" | "h6"))
        .unwrap_or(false)
}

/// Visible text of a node and its descendants, whitespace-collapsed.
pub(crate) fn node_text(node: ego_tree::NodeRef<'_, Node>) -> String {
    match node.value() {
        Node::Text(text) => collapse_whitespace(text),
        Node::Element(el) if is_non_content(el.name()) => String::new(),
        Node::Element(_) => ElementRef::wrap(node)
            .map(element_text)
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    let mut parts = Vec::new();
    for descendant in element.descendants() {
        let Node::Text(text) = descendant.value() else {
            continue;
        };
        let hidden = descendant.ancestors().any(|a| {
            a.value()
                .as_element()
                .map(|el| is_non_content(el.name()))
                .unwrap_or(false)
        });
        if !hidden {
            parts.push(&**text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

/// Whole-document visible text with scripts and styles removed.
pub(crate) fn visible_text(document: &Html) -> String {
    element_text(document.root_element())
}
