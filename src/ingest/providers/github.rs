// src/ingest/providers/github.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::ingest::fetch::{get_json, SharedFetcher};
use crate::ingest::normalize_text;
use crate::ingest::providers::env_token;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::Source;

pub const GITHUB_API_BASE: &str = "https://api.github.com";
const DEFAULT_DAYS: u64 = 7;
const DEFAULT_LIMIT: u64 = 25;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<Repo>,
}

#[derive(Debug, Deserialize)]
struct Repo {
    id: u64,
    full_name: String,
    html_url: String,
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    language: Option<String>,
    created_at: Option<DateTime<Utc>>,
}

/// Recently created repositories, most starred first.
pub struct GithubAdapter {
    fetcher: SharedFetcher,
    api_base: String,
}

impl GithubAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self {
            fetcher,
            api_base: GITHUB_API_BASE.to_string(),
        }
    }

    /// Search URL for repos created on or after `today - days`.
    pub fn search_url(&self, source: &Source, today: NaiveDate) -> String {
        let days = source.config_u64("days").unwrap_or(DEFAULT_DAYS) as i64;
        let limit = source.config_u64("limit").unwrap_or(DEFAULT_LIMIT).clamp(1, 100);
        let since = today - Duration::days(days);
        let mut q = format!("created:>={}", since.format("%Y-%m-%d"));
        if let Some(lang) = source.config_str("language") {
            q.push_str(&format!("+language:{lang}"));
        }
        format!(
            "{}/search/repositories?q={q}&sort=stars&order=desc&per_page={limit}",
            self.api_base
        )
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let url = self.search_url(source, Utc::now().date_naive());
        let mut headers = vec![("Accept", "application/vnd.github+json".to_string())];
        if let Some(token) = env_token("GITHUB_TOKEN") {
            headers.push(("Authorization", format!("Bearer {token}")));
        }
        let resp: SearchResponse = get_json(self.fetcher.as_ref(), &url, &headers).await?;

        let items = resp
            .items
            .into_iter()
            .map(|r| {
                CandidateItem::new(r.full_name.clone(), r.html_url)
                    .with_external_id(r.id.to_string())
                    .with_score(r.stargazers_count as f64)
                    .with_summary(r.description.as_deref().map(normalize_text))
                    .with_published_at(r.created_at)
                    .with_metadata(json!({
                        "stars": r.stargazers_count,
                        "forks": r.forks_count,
                        "language": r.language,
                        "repo": r.full_name,
                    }))
            })
            .collect();
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "github"
    }
}
