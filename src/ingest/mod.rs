// src/ingest/mod.rs
pub mod feed;
pub mod fetch;
pub mod opml;
pub mod providers;
pub mod types;
pub mod webpage;

use anyhow::{anyhow, Result};
use futures::{stream, StreamExt};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::db::{signals, sources};
use crate::ingest::providers::AdapterRegistry;
use crate::ingest::types::CandidateItem;
use crate::models::{Source, SourceType};

const TEXT_MAX_CHARS: usize = 1500;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Source fetches attempted.");
        describe_counter!(
            "ingest_items_added_total",
            "New signals stored after deduplication."
        );
        describe_counter!(
            "ingest_source_errors_total",
            "Source fetches that failed."
        );
        describe_histogram!("ingest_fetch_ms", "Upstream HTTP fetch time in milliseconds.");
        describe_gauge!("ingest_last_run_ts", "Unix ts when a scrape run last finished.");
    });
}

/// [`clean_text`] capped to a listing-sized length.
pub fn normalize_text(s: &str) -> String {
    let out = clean_text(s);
    if out.chars().count() > TEXT_MAX_CHARS {
        return out.chars().take(TEXT_MAX_CHARS).collect();
    }
    out
}

/// Decode entities, strip tags and collapse whitespace.
pub fn clean_text(s: &str) -> String {
    let mut out = html_escape::decode_html_entities(s).to_string();

    // Block-level tags separate words; inline ones do not.
    static RE_BLOCK: OnceCell<regex::Regex> = OnceCell::new();
    let re_block = RE_BLOCK.get_or_init(|| {
        regex::Regex::new(r"(?is)</?(p|br|div|li|ul|ol|h[1-6]|tr|td|th|blockquote|pre|hr)\b[^>]*>")
            .unwrap()
    });
    out = re_block.replace_all(&out, " ").to_string();

    static RE_TAGS: OnceCell<regex::Regex> = OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[a-z!][^>]*>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// Outcome of scraping one source.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRunResult {
    pub source_id: i64,
    pub source_name: String,
    pub source_type: SourceType,
    pub success: bool,
    pub items_added: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Fetches sources through their adapters and stores new signals.
pub struct ScraperRunner {
    pool: SqlitePool,
    registry: AdapterRegistry,
    concurrency: usize,
}

impl ScraperRunner {
    pub fn new(pool: SqlitePool, registry: AdapterRegistry, concurrency: usize) -> Self {
        Self {
            pool,
            registry,
            concurrency: concurrency.max(1),
        }
    }

    /// Scrape every active, enabled source. Per-source failures are reported,
    /// not returned as errors.
    pub async fn run_all(&self) -> Result<Vec<SourceRunResult>> {
        ensure_metrics_described();
        let targets = sources::list_scrape_targets(&self.pool).await?;
        info!(target: "ingest", sources = targets.len(), "scrape run started");

        let mut results: Vec<SourceRunResult> = stream::iter(targets)
            .map(|src| self.run_one(src))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by_key(|r| r.source_id);

        let added: usize = results.iter().map(|r| r.items_added).sum();
        let failed = results.iter().filter(|r| !r.success).count();
        gauge!("ingest_last_run_ts").set(chrono::Utc::now().timestamp() as f64);
        info!(target: "ingest", added, failed, "scrape run finished");
        Ok(results)
    }

    /// Scrape a single source by id, whether or not anyone subscribes to it.
    pub async fn run_source(&self, source_id: i64) -> Result<SourceRunResult> {
        ensure_metrics_described();
        let src = sources::get(&self.pool, source_id)
            .await?
            .ok_or_else(|| anyhow!("source {source_id} not found"))?;
        Ok(self.run_one(src).await)
    }

    async fn run_one(&self, src: Source) -> SourceRunResult {
        counter!("ingest_runs_total").increment(1);
        let mut result = SourceRunResult {
            source_id: src.id,
            source_name: src.name.clone(),
            source_type: src.source_type,
            success: false,
            items_added: 0,
            error: None,
        };

        let Some(adapter) = self.registry.get(src.source_type) else {
            result.error = Some(format!("no adapter for source type {}", src.source_type));
            counter!("ingest_source_errors_total").increment(1);
            return result;
        };

        match adapter.fetch_items(&src).await {
            Ok(items) => {
                result.items_added = self.persist(&src, items).await;
                result.success = true;
                counter!("ingest_items_added_total").increment(result.items_added as u64);
                if let Err(e) = sources::touch_last_fetched(&self.pool, src.id).await {
                    warn!(target: "ingest", source_id = src.id, error = %e, "failed to set last_fetched");
                }
                info!(
                    target: "ingest",
                    source = %src.name,
                    adapter = adapter.name(),
                    added = result.items_added,
                    "source scraped"
                );
            }
            Err(e) => {
                counter!("ingest_source_errors_total").increment(1);
                warn!(target: "ingest", source = %src.name, error = %e, "source fetch failed");
                result.error = Some(format!("{e:#}"));
            }
        }
        result
    }

    /// Insert new items; duplicates and per-item failures are skipped.
    async fn persist(&self, src: &Source, items: Vec<CandidateItem>) -> usize {
        let mut added = 0usize;
        for item in items {
            if item.title.trim().is_empty() || item.url.trim().is_empty() {
                continue;
            }
            match signals::insert_candidate(&self.pool, src.id, &item).await {
                Ok(Some(_)) => added += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "ingest", source = %src.name, key = item.dedup_key(), error = %e, "skipping item");
                }
            }
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_decodes_strips_and_collapses() {
        let s = "  Hello,&nbsp;&nbsp; <b>world</b>!\n\n What?  ";
        assert_eq!(normalize_text(s), "Hello, world! What?");
        assert_eq!(normalize_text("<p>one</p><p>two</p>"), "one two");
        assert_eq!(normalize_text("a &lt; b"), "a < b");
        assert_eq!(normalize_text("<p></p>"), "");
    }

    #[test]
    fn normalize_text_caps_length() {
        let long = "x".repeat(TEXT_MAX_CHARS + 10);
        assert_eq!(normalize_text(&long).chars().count(), TEXT_MAX_CHARS);
        assert_eq!(clean_text(&long).chars().count(), TEXT_MAX_CHARS + 10);
    }
}
