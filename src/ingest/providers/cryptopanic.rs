// src/ingest/providers/cryptopanic.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::ingest::fetch::{get_json, SharedFetcher};
use crate::ingest::normalize_text;
use crate::ingest::providers::env_token;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::Source;

pub const CRYPTOPANIC_API_BASE: &str = "https://cryptopanic.com/api/v1";
pub const DEFAULT_TOKEN_ENV: &str = "CRYPTOPANIC_API_KEY";

#[derive(Debug, Deserialize)]
struct PostsResponse {
    #[serde(default)]
    results: Vec<Post>,
}

#[derive(Debug, Deserialize)]
struct Post {
    id: u64,
    title: Option<String>,
    url: Option<String>,
    slug: Option<String>,
    published_at: Option<DateTime<Utc>>,
    source: Option<PostSource>,
    votes: Option<Votes>,
    #[serde(default)]
    currencies: Vec<Currency>,
}

#[derive(Debug, Deserialize)]
struct PostSource {
    title: Option<String>,
    domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Votes {
    #[serde(default)]
    positive: i64,
    #[serde(default)]
    negative: i64,
    #[serde(default)]
    important: i64,
}

#[derive(Debug, Deserialize)]
struct Currency {
    code: String,
}

/// CryptoPanic posts. The auth token comes from the env var named by
/// `config.authTokenEnv`.
pub struct CryptoPanicAdapter {
    fetcher: SharedFetcher,
    api_base: String,
}

impl CryptoPanicAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self {
            fetcher,
            api_base: CRYPTOPANIC_API_BASE.to_string(),
        }
    }

    pub fn posts_url(&self, source: &Source, token: &str) -> String {
        let mut url = format!("{}/posts/?auth_token={token}&public=true", self.api_base);
        if let Some(filter) = source.config_str("filter") {
            url.push_str(&format!("&filter={filter}"));
        }
        if let Some(currencies) = source.config_str("currencies") {
            url.push_str(&format!("&currencies={currencies}"));
        }
        url
    }
}

#[async_trait]
impl SourceAdapter for CryptoPanicAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let env_name = source.config_str("authTokenEnv").unwrap_or(DEFAULT_TOKEN_ENV);
        let token = env_token(env_name)
            .ok_or_else(|| anyhow!("cryptopanic token missing: set {env_name}"))?;
        let resp: PostsResponse =
            get_json(self.fetcher.as_ref(), &self.posts_url(source, &token), &[]).await?;

        let items = resp
            .results
            .into_iter()
            .filter_map(|p| {
                let title = normalize_text(p.title.as_deref()?);
                if title.is_empty() {
                    return None;
                }
                let url = p.url.filter(|u| !u.trim().is_empty()).unwrap_or_else(|| {
                    format!(
                        "https://cryptopanic.com/news/{}/{}",
                        p.id,
                        p.slug.as_deref().unwrap_or_default()
                    )
                });
                let votes = p.votes.unwrap_or_default();
                let codes: Vec<String> = p.currencies.into_iter().map(|c| c.code).collect();
                Some(
                    CandidateItem::new(title, url)
                        .with_external_id(p.id.to_string())
                        .with_score((votes.positive + votes.important - votes.negative) as f64)
                        .with_published_at(p.published_at)
                        .with_metadata(json!({
                            "currencies": codes,
                            "publisher": p.source.as_ref().and_then(|s| s.title.clone()),
                            "domain": p.source.and_then(|s| s.domain),
                        })),
                )
            })
            .collect();
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "cryptopanic"
    }
}
