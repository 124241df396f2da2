// src/ingest/webpage.rs
//! Generic article scraper: title plus main readable text of an HTML page.

use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;

use crate::ingest::fetch::Fetcher;
use crate::ingest::{clean_text, normalize_text};
use crate::ingest::types::CandidateItem;
use crate::ssrf::UrlValidator;

const MIN_BLOCK_CHARS: usize = 25;
const SUMMARY_MAX_CHARS: usize = 300;

fn selector(css: &str) -> Selector {
    // Only called with literals below.
    Selector::parse(css).unwrap_or_else(|e| panic!("bad selector {css}: {e:?}"))
}

static OG_TITLE: Lazy<Selector> = Lazy::new(|| selector(r#"meta[property="og:title"]"#));
static TITLE: Lazy<Selector> = Lazy::new(|| selector("title"));
static H1: Lazy<Selector> = Lazy::new(|| selector("h1"));
static DESCRIPTION: Lazy<Selector> = Lazy::new(|| {
    selector(r#"meta[name="description"], meta[property="og:description"]"#)
});
static ROOTS: Lazy<Vec<Selector>> = Lazy::new(|| {
    ["article", "main", "[role=main]", "#content", ".post-content", "body"]
        .into_iter()
        .map(selector)
        .collect()
});
static BLOCKS: Lazy<Selector> =
    Lazy::new(|| selector("p, h1, h2, h3, h4, li, blockquote, pre"));

/// Article pieces pulled out of an HTML document.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracted {
    pub title: String,
    pub description: Option<String>,
    pub text: String,
}

fn meta_content(doc: &Html, sel: &Selector) -> Option<String> {
    doc.select(sel)
        .filter_map(|el| el.value().attr("content"))
        .map(normalize_text)
        .find(|s| !s.is_empty())
}

fn element_text(el: ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

fn root_text(root: ElementRef<'_>) -> String {
    let blocks: Vec<String> = root
        .select(&BLOCKS)
        // Nested blocks (li > p) would repeat text.
        .filter(|el| {
            !el.ancestors()
                .filter_map(ElementRef::wrap)
                .take_while(|a| a.id() != root.id())
                .any(|a| BLOCKS.matches(&a))
        })
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect();
    blocks.join("\n\n")
}

/// Pick the first content root that yields a reasonable amount of text.
pub fn extract(html: &str) -> Extracted {
    let doc = Html::parse_document(html);

    let title = meta_content(&doc, &OG_TITLE)
        .or_else(|| doc.select(&TITLE).map(element_text).find(|t| !t.is_empty()))
        .or_else(|| doc.select(&H1).map(element_text).find(|t| !t.is_empty()))
        .unwrap_or_default();
    let description = meta_content(&doc, &DESCRIPTION);

    let mut text = String::new();
    for sel in ROOTS.iter() {
        if let Some(root) = doc.select(sel).next() {
            let candidate = root_text(root);
            if candidate.chars().count() >= MIN_BLOCK_CHARS {
                text = candidate;
                break;
            }
            if text.is_empty() {
                text = candidate;
            }
        }
    }
    if text.is_empty() {
        text = element_text(doc.root_element());
    }

    Extracted {
        title,
        description,
        text,
    }
}

/// Validate `url`, fetch it and return the page as a candidate with `content` set.
pub async fn fetch_page(
    fetcher: &dyn Fetcher,
    validator: &UrlValidator,
    url: &str,
) -> Result<CandidateItem> {
    let parsed = validator.validate(url)?;
    let html = fetcher.get_text(parsed.as_str(), &[]).await?;
    let page = extract(&html);
    if page.text.trim().is_empty() {
        return Err(anyhow!("no readable text at {}", parsed));
    }

    let title = if page.title.is_empty() {
        parsed.host_str().unwrap_or_default().to_string()
    } else {
        page.title
    };
    let summary = page
        .description
        .or_else(|| Some(page.text.chars().take(SUMMARY_MAX_CHARS).collect()));

    Ok(CandidateItem::new(title, parsed.as_str())
        .with_external_id(parsed.as_str())
        .with_summary(summary)
        .with_content(Some(page.text))
        .with_metadata(json!({ "host": parsed.host_str() })))
}
