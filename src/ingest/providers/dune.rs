// src/ingest/providers/dune.rs
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::ingest::fetch::{get_json, SharedFetcher};
use crate::ingest::normalize_text;
use crate::ingest::providers::env_token;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::Source;

pub const DUNE_API_BASE: &str = "https://api.dune.com/api/v1";
const DEFAULT_LIMIT: u64 = 50;

#[derive(Debug, Deserialize)]
struct ResultsResponse {
    result: Option<ResultBody>,
}

#[derive(Debug, Deserialize)]
struct ResultBody {
    #[serde(default)]
    rows: Vec<Map<String, Value>>,
}

fn cell_text(row: &Map<String, Value>, col: &str) -> Option<String> {
    match row.get(col)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn cell_f64(row: &Map<String, Value>, col: &str) -> f64 {
    match row.get(col) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Latest results of a saved Dune query, mapped through configured columns.
pub struct DuneAdapter {
    fetcher: SharedFetcher,
    api_base: String,
}

impl DuneAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self {
            fetcher,
            api_base: DUNE_API_BASE.to_string(),
        }
    }

    pub fn results_url(&self, query_id: &str, limit: u64) -> String {
        format!("{}/query/{query_id}/results?limit={limit}", self.api_base)
    }
}

#[async_trait]
impl SourceAdapter for DuneAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let query_id = source
            .config_str("queryId")
            .map(str::to_string)
            .or_else(|| source.config_u64("queryId").map(|n| n.to_string()))
            .ok_or_else(|| anyhow!("dune source '{}' has no queryId", source.name))?;
        let key = env_token("DUNE_API_KEY").ok_or_else(|| anyhow!("DUNE_API_KEY is not set"))?;
        let limit = source.config_u64("limit").unwrap_or(DEFAULT_LIMIT);

        let title_col = source.config_str("titleColumn").unwrap_or("title");
        let url_col = source.config_str("urlColumn").unwrap_or("url");
        let id_col = source.config_str("idColumn");
        let score_col = source.config_str("scoreColumn");

        let resp: ResultsResponse = get_json(
            self.fetcher.as_ref(),
            &self.results_url(&query_id, limit),
            &[("X-Dune-API-Key", key)],
        )
        .await?;
        let rows = resp.result.map(|r| r.rows).unwrap_or_default();

        let items = rows
            .into_iter()
            .filter_map(|row| {
                let title = normalize_text(&cell_text(&row, title_col)?);
                let url = cell_text(&row, url_col)?;
                if title.is_empty() {
                    return None;
                }
                let mut item = CandidateItem::new(title, url);
                if let Some(id) = id_col.and_then(|c| cell_text(&row, c)) {
                    item = item.with_external_id(id);
                }
                if let Some(col) = score_col {
                    item = item.with_score(cell_f64(&row, col));
                }
                Some(item.with_metadata(json!({ "queryId": query_id, "row": row })))
            })
            .collect();
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "dune"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetch::FixtureFetcher;
    use crate::ingest::providers::source_fixture;
    use crate::models::SourceType;
    use std::sync::Arc;

    #[tokio::test]
    async fn query_id_is_required() {
        let adapter = DuneAdapter::new(Arc::new(FixtureFetcher::new()));
        let src = source_fixture(SourceType::Dune, "https://dune.com", json!({}));
        let err = adapter.fetch_items(&src).await.unwrap_err();
        assert!(err.to_string().contains("queryId"));
    }

    #[tokio::test]
    #[serial_test::serial]
    async fn maps_rows_through_configured_columns() {
        std::env::set_var("DUNE_API_KEY", "dune-key");
        let f = FixtureFetcher::new();
        let adapter = DuneAdapter::new(Arc::new(f.clone()));
        f.insert(
            adapter.results_url("42", DEFAULT_LIMIT),
            r#"{"result":{"rows":[
                {"name":"Pool A","link":"https://dex.example/a","pool":"0xa","tvl":"1500.5"},
                {"name":"","link":"https://dex.example/b","pool":"0xb","tvl":1}
            ]}}"#,
        );
        let src = source_fixture(
            SourceType::Dune,
            "https://dune.com",
            json!({ "queryId": 42, "titleColumn": "name", "urlColumn": "link",
                    "idColumn": "pool", "scoreColumn": "tvl" }),
        );

        let items = adapter.fetch_items(&src).await.unwrap();
        std::env::remove_var("DUNE_API_KEY");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].dedup_key(), "0xa");
        assert_eq!(items[0].score, 1500.5);
        assert_eq!(items[0].metadata["row"]["pool"], "0xa");
    }
}
