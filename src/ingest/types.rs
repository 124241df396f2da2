// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Source;

/// One normalized upstream item, before it becomes a signal row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateItem {
    pub title: String,
    pub url: String,
    pub external_id: Option<String>,
    pub summary: Option<String>,
    pub score: f64,
    pub content: Option<String>, // full text, only set by the page scraper
    pub published_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

impl CandidateItem {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            external_id: None,
            summary: None,
            score: 0.0,
            content: None,
            published_at: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_summary(mut self, summary: Option<String>) -> Self {
        self.summary = summary.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    pub fn with_published_at(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.published_at = ts;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_content(mut self, content: Option<String>) -> Self {
        self.content = content;
        self
    }

    /// Dedup key within a source: the upstream id, else the URL.
    pub fn dedup_key(&self) -> &str {
        self.external_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.url)
    }
}

/// Fetches candidate items for one source type.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>>;
    fn name(&self) -> &'static str;
}
