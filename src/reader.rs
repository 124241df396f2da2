// src/reader.rs
//! AI reader: streamed summary, deep read or translation of an article URL,
//! cached per URL and mode.

use std::fmt;
use std::str::FromStr;

use futures::{Stream, StreamExt};
use metrics::{counter, describe_counter};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::db::ai_cache::{self, CacheSlot};
use crate::enrich::llm::{ChatRequest, DynLlm};
use crate::ingest::fetch::SharedFetcher;
use crate::ingest::webpage::fetch_page;
use crate::ssrf::UrlValidator;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("reader_cache_hits_total", "Reader requests served from the cache.");
        describe_counter!("reader_cache_misses_total", "Reader requests that called the LLM.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReaderMode {
    /// Short summary.
    Summary,
    /// Long, structured summary.
    Deep,
    Translate,
}

impl ReaderMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderMode::Summary => "summary",
            ReaderMode::Deep => "deep",
            ReaderMode::Translate => "translate",
        }
    }

    pub fn cache_slot(&self) -> CacheSlot {
        match self {
            ReaderMode::Summary => CacheSlot::Short,
            ReaderMode::Deep => CacheSlot::Long,
            ReaderMode::Translate => CacheSlot::Translation,
        }
    }

    fn system_prompt(&self, target_language: &str) -> String {
        match self {
            ReaderMode::Summary => format!(
                "Summarize this part of an article in 2-3 sentences, in {target_language}. \
                 Plain text only."
            ),
            ReaderMode::Deep => format!(
                "Write a detailed reading of this part of an article in {target_language}: \
                 key points as short paragraphs, then notable facts and figures. Plain text only."
            ),
            ReaderMode::Translate => format!(
                "Translate this text into {target_language}. Keep paragraph breaks. \
                 Output only the translation."
            ),
        }
    }

    fn max_tokens(&self) -> u32 {
        match self {
            ReaderMode::Summary => 300,
            ReaderMode::Deep => 1200,
            ReaderMode::Translate => 4000,
        }
    }
}

impl fmt::Display for ReaderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReaderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summary" | "short" => Ok(ReaderMode::Summary),
            "deep" | "long" => Ok(ReaderMode::Deep),
            "translate" | "translation" => Ok(ReaderMode::Translate),
            other => Err(anyhow::anyhow!("unknown reader mode: {other}")),
        }
    }
}

/// One event of a reader stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Text(String),
    Done,
    Error(String),
}

impl ReaderEvent {
    /// Payload of the SSE `data:` field.
    pub fn data(&self) -> String {
        match self {
            ReaderEvent::Text(t) => serde_json::json!({ "text": t }).to_string(),
            ReaderEvent::Done => "[DONE]".to_string(),
            ReaderEvent::Error(e) => serde_json::json!({ "error": e }).to_string(),
        }
    }
}

#[derive(Clone)]
pub struct AiReader {
    pool: SqlitePool,
    llm: DynLlm,
    fetcher: SharedFetcher,
    validator: UrlValidator,
    chunk_tokens: usize,
    target_language: String,
}

impl AiReader {
    pub fn new(
        pool: SqlitePool,
        llm: DynLlm,
        fetcher: SharedFetcher,
        chunk_tokens: usize,
        target_language: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            llm,
            fetcher,
            validator: UrlValidator::new(),
            chunk_tokens: chunk_tokens.max(1),
            target_language: target_language.into(),
        }
    }

    pub fn with_validator(mut self, validator: UrlValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Stream the answer for `url` in `mode`. Ends with `Done` on success or a
    /// single `Error` on failure. Only complete answers are cached.
    pub fn stream(&self, url: String, mode: ReaderMode) -> impl Stream<Item = ReaderEvent> + Send + 'static {
        ensure_metrics_described();
        let this = self.clone();
        async_stream::stream! {
            let parsed = match this.validator.validate(&url) {
                Ok(u) => u,
                Err(e) => {
                    yield ReaderEvent::Error(e.to_string());
                    return;
                }
            };
            let key = parsed.to_string();
            let slot = mode.cache_slot();

            match ai_cache::lookup(&this.pool, &key, slot).await {
                Ok(Some(text)) => {
                    counter!("reader_cache_hits_total").increment(1);
                    yield ReaderEvent::Text(text);
                    yield ReaderEvent::Done;
                    return;
                }
                Ok(None) => counter!("reader_cache_misses_total").increment(1),
                Err(e) => warn!(target: "reader", error = %e, "cache lookup failed"),
            }

            let page = match fetch_page(this.fetcher.as_ref(), &this.validator, &key).await {
                Ok(p) => p,
                Err(e) => {
                    yield ReaderEvent::Error(format!("could not read page: {e:#}"));
                    return;
                }
            };
            let content = page.content.unwrap_or_default();
            let chunks = chunk_text(&content, this.chunk_tokens);
            let system = mode.system_prompt(&this.target_language);

            let mut full = String::new();
            for (i, chunk) in chunks.iter().enumerate() {
                if i > 0 {
                    full.push_str("\n\n");
                    yield ReaderEvent::Text("\n\n".to_string());
                }
                let user = if i == 0 {
                    format!("Title: {}\n\n{chunk}", page.title)
                } else {
                    chunk.clone()
                };
                let req = ChatRequest::new(system.clone(), user).max_tokens(mode.max_tokens());
                let mut deltas = match this.llm.complete_stream(&req).await {
                    Ok(s) => s,
                    Err(e) => {
                        yield ReaderEvent::Error(e.to_string());
                        return;
                    }
                };
                while let Some(delta) = deltas.next().await {
                    match delta {
                        Ok(t) => {
                            full.push_str(&t);
                            yield ReaderEvent::Text(t);
                        }
                        Err(e) => {
                            yield ReaderEvent::Error(e.to_string());
                            return;
                        }
                    }
                }
            }

            if full.trim().is_empty() {
                yield ReaderEvent::Error("model returned no text".to_string());
                return;
            }
            if let Err(e) = ai_cache::store(
                &this.pool,
                &key,
                slot,
                &full,
                this.llm.model(),
                this.llm.provider_name(),
            )
            .await
            {
                warn!(target: "reader", error = %e, "cache store failed");
            }
            info!(target: "reader", url = %key, mode = %mode, chunks = chunks.len(), "reader answer cached");
            yield ReaderEvent::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::enrich::llm::MockLlm;
    use crate::ingest::fetch::FixtureFetcher;
    use std::sync::Arc;

    const ARTICLE: &str = "<html><head><title>Story</title></head><body><article>\
        <p>The first paragraph explains what happened in some detail.</p>\
        <p>The second paragraph adds more context for the reader.</p>\
        </article></body></html>";

    #[test]
    fn modes_parse_and_map_to_slots() {
        assert_eq!("Deep".parse::<ReaderMode>().unwrap(), ReaderMode::Deep);
        assert_eq!(ReaderMode::Translate.cache_slot(), CacheSlot::Translation);
        assert!("poem".parse::<ReaderMode>().is_err());
        assert_eq!(ReaderEvent::Done.data(), "[DONE]");
        assert_eq!(ReaderEvent::Text("a\"b".into()).data(), r#"{"text":"a\"b"}"#);
    }

    #[tokio::test]
    async fn miss_streams_then_caches_and_hit_skips_llm() {
        let pool = test_pool().await;
        let mock = Arc::new(MockLlm::with_reply("short answer"));
        let fetcher = FixtureFetcher::new().with("https://news.example.com/story", ARTICLE);
        let reader = AiReader::new(pool.clone(), mock.clone(), Arc::new(fetcher.clone()), 3000, "English");

        let first: Vec<ReaderEvent> = reader
            .stream("https://news.example.com/story".into(), ReaderMode::Summary)
            .collect()
            .await;
        assert_eq!(first.last(), Some(&ReaderEvent::Done));
        let text: String = first
            .iter()
            .filter_map(|e| match e {
                ReaderEvent::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "short answer");
        assert_eq!(mock.calls(), 1);

        let second: Vec<ReaderEvent> = reader
            .stream("https://news.example.com/story".into(), ReaderMode::Summary)
            .collect()
            .await;
        assert_eq!(
            second,
            vec![ReaderEvent::Text("short answer".into()), ReaderEvent::Done]
        );
        assert_eq!(mock.calls(), 1);
        assert_eq!(fetcher.hits().len(), 1);

        let entry = ai_cache::get(&pool, "https://news.example.com/story").await.unwrap().unwrap();
        assert_eq!(entry.provider.as_deref(), Some("mock"));
        assert!(entry.long_summary.is_none());
    }

    #[tokio::test]
    async fn blocked_url_and_llm_failure_emit_errors_without_caching() {
        let pool = test_pool().await;
        let mock = Arc::new(MockLlm::new().failing_when("first paragraph"));
        let fetcher = FixtureFetcher::new().with("https://news.example.com/story", ARTICLE);
        let reader = AiReader::new(pool.clone(), mock, Arc::new(fetcher), 3000, "English");

        let blocked: Vec<ReaderEvent> = reader
            .stream("http://127.0.0.1/admin".into(), ReaderMode::Deep)
            .collect()
            .await;
        assert!(matches!(blocked.as_slice(), [ReaderEvent::Error(_)]));

        let failed: Vec<ReaderEvent> = reader
            .stream("https://news.example.com/story".into(), ReaderMode::Deep)
            .collect()
            .await;
        assert!(matches!(failed.last(), Some(ReaderEvent::Error(_))));
        assert!(ai_cache::get(&pool, "https://news.example.com/story").await.unwrap().is_none());
    }
}
