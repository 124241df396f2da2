// src/ingest/providers/hackernews.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{stream, StreamExt};
use serde::Deserialize;
use serde_json::json;

use crate::ingest::fetch::{get_json, SharedFetcher};
use crate::ingest::normalize_text;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::Source;

pub const HN_API_BASE: &str = "https://hacker-news.firebaseio.com/v0";
const DEFAULT_FEED: &str = "topstories";
const DEFAULT_LIMIT: u64 = 30;
const ITEM_CONCURRENCY: usize = 8;

#[derive(Debug, Deserialize)]
struct HnItem {
    id: u64,
    #[serde(rename = "type")]
    kind: Option<String>,
    title: Option<String>,
    url: Option<String>,
    text: Option<String>,
    by: Option<String>,
    score: Option<i64>,
    descendants: Option<i64>,
    time: Option<i64>,
    #[serde(default)]
    dead: bool,
    #[serde(default)]
    deleted: bool,
}

pub fn discussion_url(id: u64) -> String {
    format!("https://news.ycombinator.com/item?id={id}")
}

/// Firebase API adapter. Item ids come from one of the story lists
/// (`topstories`, `newstories`, `beststories`, ...).
pub struct HackerNewsAdapter {
    fetcher: SharedFetcher,
    api_base: String,
}

impl HackerNewsAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self::with_base(fetcher, HN_API_BASE)
    }

    pub fn with_base(fetcher: SharedFetcher, api_base: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }

    async fn fetch_item(&self, id: u64) -> Option<HnItem> {
        let url = format!("{}/item/{id}.json", self.api_base);
        // Firebase answers `null` for ids it no longer knows.
        match get_json::<Option<HnItem>>(self.fetcher.as_ref(), &url, &[]).await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(target: "ingest", id, error = %e, "hn item fetch failed");
                None
            }
        }
    }
}

fn to_candidate(it: HnItem) -> Option<CandidateItem> {
    if it.dead || it.deleted || it.kind.as_deref().is_some_and(|k| k != "story") {
        return None;
    }
    let title = normalize_text(it.title.as_deref()?);
    if title.is_empty() {
        return None;
    }
    let hn_url = discussion_url(it.id);
    let url = it
        .url
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| hn_url.clone());
    let summary = it.text.as_deref().map(normalize_text);
    let published = it.time.and_then(|t| Utc.timestamp_opt(t, 0).single());

    Some(
        CandidateItem::new(title, url)
            .with_external_id(it.id.to_string())
            .with_score(it.score.unwrap_or(0) as f64)
            .with_summary(summary)
            .with_published_at(published)
            .with_metadata(json!({
                "comments": it.descendants.unwrap_or(0),
                "author": it.by,
                "hnUrl": hn_url,
            })),
    )
}

#[async_trait]
impl SourceAdapter for HackerNewsAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let feed = source.config_str("feed").unwrap_or(DEFAULT_FEED);
        let limit = source.config_u64("limit").unwrap_or(DEFAULT_LIMIT) as usize;
        let list_url = format!("{}/{feed}.json", self.api_base);
        let ids: Vec<u64> = get_json(self.fetcher.as_ref(), &list_url, &[]).await?;

        let items: Vec<CandidateItem> = stream::iter(ids.into_iter().take(limit))
            .map(|id| self.fetch_item(id))
            .buffered(ITEM_CONCURRENCY)
            .filter_map(|it| async move { it.and_then(to_candidate) })
            .collect()
            .await;
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "hackernews"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetch::FixtureFetcher;
    use crate::ingest::providers::source_fixture;
    use crate::models::SourceType;
    use std::sync::Arc;

    fn fixture() -> FixtureFetcher {
        FixtureFetcher::new()
            .with(format!("{HN_API_BASE}/topstories.json"), "[1, 2, 3, 4]")
            .with(
                format!("{HN_API_BASE}/item/1.json"),
                r#"{"id":1,"type":"story","title":"Rust 2.0","url":"https://rust.example/2","by":"alice","score":120,"descendants":45,"time":1700000000}"#,
            )
            .with(
                format!("{HN_API_BASE}/item/2.json"),
                r#"{"id":2,"type":"story","title":"Ask HN: Tabs &amp; spaces?","text":"<p>Which one</p>","score":7,"time":1700000100}"#,
            )
            .with(format!("{HN_API_BASE}/item/3.json"), "null")
            .with(
                format!("{HN_API_BASE}/item/4.json"),
                r#"{"id":4,"type":"job","title":"Hiring","time":1700000200}"#,
            )
    }

    #[tokio::test]
    async fn maps_stories_and_skips_the_rest() {
        let adapter = HackerNewsAdapter::new(Arc::new(fixture()));
        let src = source_fixture(SourceType::HackerNews, "https://news.ycombinator.com", json!({}));
        let items = adapter.fetch_items(&src).await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].external_id.as_deref(), Some("1"));
        assert_eq!(items[0].score, 120.0);
        assert_eq!(items[0].metadata["comments"], 45);
        assert_eq!(items[0].metadata["author"], "alice");
        assert_eq!(items[1].title, "Ask HN: Tabs & spaces?");
        assert_eq!(items[1].url, discussion_url(2));
        assert_eq!(items[1].summary.as_deref(), Some("Which one"));
    }

    #[tokio::test]
    async fn limit_caps_item_requests() {
        let f = fixture();
        let adapter = HackerNewsAdapter::new(Arc::new(f.clone()));
        let src = source_fixture(SourceType::HackerNews, "", json!({ "limit": 1 }));
        let items = adapter.fetch_items(&src).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(f.hits().len(), 2, "list plus one item");
    }

    #[tokio::test]
    async fn missing_list_is_an_error() {
        let adapter = HackerNewsAdapter::new(Arc::new(FixtureFetcher::new()));
        let src = source_fixture(SourceType::HackerNews, "", json!({ "feed": "beststories" }));
        assert!(adapter.fetch_items(&src).await.is_err());
    }
}
