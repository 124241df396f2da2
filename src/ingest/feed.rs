// src/ingest/feed.rs
//! RSS 2.0 / RSS 1.0 (RDF) / Atom parsing into candidate items.

use std::borrow::Cow;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use quick_xml::de::from_str;
use regex::{Captures, Regex};
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use crate::ingest::normalize_text;
use crate::ingest::types::CandidateItem;

const SUMMARY_MAX_CHARS: usize = 500;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Rdf {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

/// Element names match on their local part, so `<atom:link>` lands in `link`
/// and `<slash:comments>` in `comments`; repeated names are collected.
#[derive(Debug, Deserialize)]
struct Item {
    #[serde(default)]
    title: Vec<Text>,
    #[serde(default)]
    link: Vec<Text>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    /// `<dc:date>` in RSS 1.0.
    #[serde(default)]
    date: Vec<Text>,
    #[serde(default)]
    description: Vec<Text>,
    #[serde(default)]
    comments: Vec<Text>,
}

#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    text: String,
}

/// First non-blank text among same-named elements.
fn first_text(texts: &[Text]) -> Option<&str> {
    texts.iter().map(|t| t.text.trim()).find(|t| !t.is_empty())
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    title: Vec<Text>,
    #[serde(rename = "link", default)]
    link: Vec<AtomLink>,
    id: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    #[serde(default)]
    summary: Vec<Text>,
    #[serde(default)]
    content: Vec<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: Option<String>,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_any_date(ts: &str) -> Option<DateTime<Utc>> {
    parse_rfc2822(ts).or_else(|| parse_rfc3339(ts))
}

/// XML predefines five entities; feeds routinely carry HTML ones as well.
/// Known names are decoded in place and unknown ones are escaped as text.
fn decode_html_entities_for_xml(s: &str) -> Cow<'_, str> {
    static ENTITY: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"&([A-Za-z][A-Za-z0-9]{1,31});").unwrap());
    ENTITY.replace_all(s, |caps: &Captures<'_>| {
        let name = &caps[1];
        if matches!(name, "amp" | "lt" | "gt" | "quot" | "apos") {
            return caps[0].to_string();
        }
        let decoded = html_escape::decode_html_entities(&caps[0]);
        if decoded == caps[0] {
            format!("&amp;{name};")
        } else {
            html_escape::encode_text(&decoded).into_owned()
        }
    })
}

fn summary_of(raw: Option<&str>) -> Option<String> {
    let s = normalize_text(raw?);
    if s.is_empty() {
        return None;
    }
    Some(s.chars().take(SUMMARY_MAX_CHARS).collect())
}

fn rss_item_to_candidate(it: Item) -> Option<CandidateItem> {
    let title = normalize_text(first_text(&it.title).unwrap_or_default());
    let guid = it.guid.map(|g| g.text.trim().to_string()).filter(|g| !g.is_empty());
    let url = first_text(&it.link)
        .map(str::to_string)
        .or_else(|| guid.clone().filter(|g| g.starts_with("http")))?;
    if title.is_empty() {
        return None;
    }
    let published = it
        .pub_date
        .as_deref()
        .or(first_text(&it.date))
        .and_then(parse_any_date);
    let mut meta = serde_json::Map::new();
    // `<slash:comments>` is a count, not a URL.
    if let Some(c) = it
        .comments
        .iter()
        .map(|c| c.text.trim())
        .find(|c| c.starts_with("http"))
    {
        meta.insert("commentsUrl".into(), c.into());
    }

    let mut item = CandidateItem::new(title, url)
        .with_summary(summary_of(first_text(&it.description)))
        .with_published_at(published)
        .with_metadata(serde_json::Value::Object(meta));
    if let Some(g) = guid {
        item = item.with_external_id(g);
    }
    Some(item)
}

fn atom_entry_to_candidate(e: AtomEntry) -> Option<CandidateItem> {
    let title = normalize_text(first_text(&e.title).unwrap_or_default());
    let url = e
        .link
        .iter()
        .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
        .or_else(|| e.link.first())
        .and_then(|l| l.href.clone())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())?;
    if title.is_empty() {
        return None;
    }
    let published = e
        .published
        .as_deref()
        .or(e.updated.as_deref())
        .and_then(parse_any_date);
    let summary = first_text(&e.summary).or_else(|| first_text(&e.content));

    let mut item = CandidateItem::new(title, url)
        .with_summary(summary_of(summary))
        .with_published_at(published);
    if let Some(id) = e.id.map(|i| i.trim().to_string()).filter(|i| !i.is_empty()) {
        item = item.with_external_id(id);
    }
    Some(item)
}

/// Parse a feed document of any supported flavour.
pub fn parse_feed(xml: &str) -> Result<Vec<CandidateItem>> {
    let clean = decode_html_entities_for_xml(xml);
    let head: String = clean.chars().take(2048).collect::<String>().to_ascii_lowercase();

    let items = if head.contains("<rdf:rdf") {
        let rdf: Rdf = from_str(&clean).context("parsing rss 1.0 (rdf) xml")?;
        rdf.item.into_iter().filter_map(rss_item_to_candidate).collect()
    } else if head.contains("<feed") && !head.contains("<rss") {
        let feed: AtomFeed = from_str(&clean).context("parsing atom xml")?;
        feed.entry
            .into_iter()
            .filter_map(atom_entry_to_candidate)
            .collect()
    } else {
        let rss: Rss = from_str(&clean).context("parsing rss xml")?;
        rss.channel
            .item
            .into_iter()
            .filter_map(rss_item_to_candidate)
            .collect()
    };
    Ok(items)
}
