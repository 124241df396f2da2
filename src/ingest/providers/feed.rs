// src/ingest/providers/feed.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::ingest::feed::parse_feed;
use crate::ingest::fetch::SharedFetcher;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::{Source, SourceType};

pub const PRODUCT_HUNT_FEED: &str = "https://www.producthunt.com/feed";

/// RSS/Atom adapter shared by `rss`, `substack`, `producthunt` and `other`.
pub struct FeedAdapter {
    fetcher: SharedFetcher,
}

impl FeedAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self { fetcher }
    }
}

/// Where the feed for `source` lives.
pub fn feed_url_for(source: &Source) -> Result<String> {
    if let Some(url) = source.config_str("feedUrl") {
        return Ok(url.to_string());
    }
    let base = source.base_url.trim().trim_end_matches('/');
    match source.source_type {
        SourceType::ProductHunt => Ok(PRODUCT_HUNT_FEED.to_string()),
        SourceType::Substack if !base.is_empty() => Ok(format!("{base}/feed")),
        SourceType::Rss if !base.is_empty() => Ok(base.to_string()),
        t => Err(anyhow!("{t} source '{}' has no feedUrl configured", source.name)),
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let url = feed_url_for(source)?;
        let xml = self.fetcher.get_text(&url, &[]).await?;
        parse_feed(&xml)
    }

    fn name(&self) -> &'static str {
        "feed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetch::FixtureFetcher;
    use crate::ingest::providers::source_fixture;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn feed_url_resolution_per_type() {
        let s = source_fixture(SourceType::Substack, "https://acme.substack.com/", json!({}));
        assert_eq!(feed_url_for(&s).unwrap(), "https://acme.substack.com/feed");

        let ph = source_fixture(SourceType::ProductHunt, "https://www.producthunt.com", json!({}));
        assert_eq!(feed_url_for(&ph).unwrap(), PRODUCT_HUNT_FEED);

        let rss = source_fixture(
            SourceType::Rss,
            "https://blog.example.com",
            json!({ "feedUrl": "https://blog.example.com/rss.xml" }),
        );
        assert_eq!(feed_url_for(&rss).unwrap(), "https://blog.example.com/rss.xml");

        let other = source_fixture(SourceType::Other, "https://x.example.com", json!({}));
        assert!(feed_url_for(&other).is_err());
    }

    #[tokio::test]
    async fn fetches_and_parses_feed() {
        let f = FixtureFetcher::new().with(
            "https://blog.example.com/rss.xml",
            r#"<rss version="2.0"><channel>
                 <item><title>Hello</title><link>https://blog.example.com/hello</link></item>
               </channel></rss>"#,
        );
        let adapter = FeedAdapter::new(Arc::new(f));
        let src = source_fixture(
            SourceType::Rss,
            "",
            json!({ "feedUrl": "https://blog.example.com/rss.xml" }),
        );
        let items = adapter.fetch_items(&src).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].dedup_key(), "https://blog.example.com/hello");
    }
}
