// src/enrich/mod.rs
//! Signal Processor: fills AI fields (tags, summary, translations) of
//! signals that do not have them yet.

pub mod llm;

use anyhow::{anyhow, Result};
use futures::{stream, StreamExt};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::EnrichConfig;
use crate::db::signals::{self, Enrichment};
use crate::enrich::llm::{ChatRequest, DynLlm};
use crate::models::Signal;

const MAX_TAGS: usize = 5;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("enrich_processed_total", "Signals enriched successfully.");
        describe_counter!("enrich_failed_total", "Enrichment attempts that failed.");
    });
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    /// Pending signals picked for this batch.
    pub selected: usize,
    pub processed: usize,
    pub failed: usize,
    /// Still pending after the batch.
    pub remaining: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub iterations: usize,
    pub processed: usize,
    pub failed: usize,
    pub remaining: i64,
}

/// Raw model answer; accepts snake_case and camelCase keys.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Answer {
    tags: Vec<String>,
    #[serde(alias = "tagsLocalized")]
    tags_localized: Vec<String>,
    summary: String,
    #[serde(alias = "summaryLocalized")]
    summary_localized: String,
    #[serde(alias = "titleTranslated")]
    title_translated: String,
}

fn clean_tags(tags: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tags {
        let t = t.trim().trim_start_matches('#').trim().to_string();
        if !t.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(&t)) {
            out.push(t);
        }
        if out.len() == MAX_TAGS {
            break;
        }
    }
    out
}

/// Parse the model's JSON answer. Code fences and text around the object are
/// tolerated; an empty summary is an error.
pub fn parse_enrichment(raw: &str) -> Result<Enrichment> {
    let start = raw
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object in model answer"))?;
    let end = raw
        .rfind('}')
        .filter(|&e| e > start)
        .ok_or_else(|| anyhow!("unterminated JSON object in model answer"))?;
    let answer: Answer = serde_json::from_str(&raw[start..=end])
        .map_err(|e| anyhow!("invalid JSON in model answer: {e}"))?;

    let summary = answer.summary.trim().to_string();
    if summary.is_empty() {
        return Err(anyhow!("model answer has an empty summary"));
    }
    Ok(Enrichment {
        tags: clean_tags(answer.tags),
        tags_localized: clean_tags(answer.tags_localized),
        summary,
        summary_localized: answer.summary_localized.trim().to_string(),
        title_translated: answer.title_translated.trim().to_string(),
    })
}

fn system_prompt(target_language: &str) -> String {
    format!(
        "You are a news analyst. Reply with ONE JSON object and nothing else, with keys: \
         \"tags\" (3-5 short English topic tags), \
         \"tags_localized\" (the same tags in {target_language}), \
         \"summary\" (one or two neutral English sentences), \
         \"summary_localized\" (the summary in {target_language}), \
         \"title_translated\" (the title in {target_language})."
    )
}

fn user_prompt(sig: &Signal) -> String {
    let mut p = format!("Title: {}\nURL: {}\n", sig.title, sig.url);
    if let Some(s) = sig.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        p.push_str(&format!("Excerpt: {s}\n"));
    }
    if let Some(obj) = sig.metadata.0.as_object().filter(|o| !o.is_empty()) {
        p.push_str(&format!("Metadata: {}\n", serde_json::Value::Object(obj.clone())));
    }
    p
}

/// Batch enrichment over the pending-signal queue.
pub struct SignalProcessor {
    pool: SqlitePool,
    llm: DynLlm,
    concurrency: usize,
    max_attempts: i64,
    target_language: String,
}

impl SignalProcessor {
    pub fn new(pool: SqlitePool, llm: DynLlm, cfg: &EnrichConfig) -> Self {
        Self {
            pool,
            llm,
            concurrency: cfg.concurrency.max(1),
            max_attempts: cfg.max_attempts.max(1),
            target_language: cfg.target_language.clone(),
        }
    }

    /// Enrich up to `n` pending signals, newest first. Each result is
    /// committed on its own.
    pub async fn process_signals(&self, n: usize) -> Result<ProcessReport> {
        ensure_metrics_described();
        let batch = signals::list_pending(&self.pool, n as i64, self.max_attempts).await?;
        let selected = batch.len();

        let outcomes: Vec<bool> = stream::iter(batch)
            .map(|sig| self.process_one(sig))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        let processed = outcomes.iter().filter(|ok| **ok).count();
        let failed = selected - processed;
        let remaining = self.pending_count().await?;

        info!(target: "enrich", selected, processed, failed, remaining, "enrichment batch done");
        Ok(ProcessReport {
            selected,
            processed,
            failed,
            remaining,
        })
    }

    async fn process_one(&self, sig: Signal) -> bool {
        let req = ChatRequest::new(system_prompt(&self.target_language), user_prompt(&sig))
            .json()
            .max_tokens(600);

        let result = match self.llm.complete(&req).await {
            Ok(raw) => parse_enrichment(&raw),
            Err(e) => Err(e),
        };
        match result {
            Ok(enrichment) => match signals::save_enrichment(&self.pool, sig.id, &enrichment).await {
                Ok(()) => {
                    counter!("enrich_processed_total").increment(1);
                    debug!(target: "enrich", signal_id = sig.id, "signal enriched");
                    true
                }
                Err(e) => {
                    counter!("enrich_failed_total").increment(1);
                    warn!(target: "enrich", signal_id = sig.id, error = %e, "saving enrichment failed");
                    false
                }
            },
            Err(e) => {
                counter!("enrich_failed_total").increment(1);
                warn!(
                    target: "enrich",
                    signal_id = sig.id,
                    attempt = sig.ai_attempts + 1,
                    error = %e,
                    "enrichment failed"
                );
                if let Err(e) = signals::record_failure(&self.pool, sig.id).await {
                    warn!(target: "enrich", signal_id = sig.id, error = %e, "recording failure failed");
                }
                false
            }
        }
    }

    /// Signals still waiting for enrichment (attempt-capped ones excluded).
    pub async fn pending_count(&self) -> Result<i64> {
        signals::pending_count(&self.pool, self.max_attempts).await
    }

    /// Signals that used up their attempts.
    pub async fn failed_count(&self) -> Result<i64> {
        signals::failed_count(&self.pool, self.max_attempts).await
    }

    /// Put attempt-capped signals back in the queue.
    pub async fn reset_failed(&self) -> Result<u64> {
        let n = signals::reset_failed(&self.pool, self.max_attempts).await?;
        info!(target: "enrich", reset = n, "failed signals requeued");
        Ok(n)
    }

    /// Run batches until nothing is pending, a batch enriches nothing, or
    /// `max_iterations` batches have run.
    pub async fn process_until_drained(
        &self,
        batch: usize,
        max_iterations: usize,
    ) -> Result<DrainReport> {
        let mut report = DrainReport {
            remaining: self.pending_count().await?,
            ..DrainReport::default()
        };
        while report.iterations < max_iterations && report.remaining > 0 {
            let r = self.process_signals(batch.max(1)).await?;
            report.iterations += 1;
            report.processed += r.processed;
            report.failed += r.failed;
            report.remaining = r.remaining;
            if r.processed == 0 {
                break;
            }
        }
        Ok(report)
    }

    /// Clear AI fields of one signal so the next batch picks it up again.
    pub async fn reset_enrichment(&self, signal_id: i64) -> Result<bool> {
        signals::reset_enrichment(&self.pool, signal_id).await
    }

    /// Move Hacker News `Comments: N` summaries into `metadata.comments`
    /// and requeue those signals. Returns how many were migrated.
    pub async fn migrate_hn_comment_summaries(&self) -> Result<usize> {
        let rows = signals::list_hn_comment_summaries(&self.pool).await?;
        let mut migrated = 0usize;
        for sig in rows {
            let Some(count) = sig
                .summary
                .as_deref()
                .and_then(|s| s.trim().strip_prefix("Comments:"))
                .and_then(|n| n.trim().parse::<i64>().ok())
            else {
                continue;
            };
            let mut meta = match sig.metadata.0 {
                serde_json::Value::Object(m) => m,
                _ => serde_json::Map::new(),
            };
            meta.insert("comments".into(), count.into());
            signals::replace_metadata_and_clear(&self.pool, sig.id, &serde_json::Value::Object(meta))
                .await?;
            migrated += 1;
        }
        info!(target: "enrich", migrated, "hn comment summaries migrated");
        Ok(migrated)
    }
}
