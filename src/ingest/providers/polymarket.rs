// src/ingest/providers/polymarket.rs
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::ingest::fetch::{get_json, SharedFetcher};
use crate::ingest::normalize_text;
use crate::ingest::types::{CandidateItem, SourceAdapter};
use crate::models::Source;

pub const GAMMA_API_BASE: &str = "https://gamma-api.polymarket.com";
const DEFAULT_LIMIT: u64 = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Market {
    id: Value,
    question: Option<String>,
    slug: Option<String>,
    description: Option<String>,
    volume24hr: Option<Value>,
    end_date: Option<String>,
    start_date: Option<DateTime<Utc>>,
    outcomes: Option<Value>,
    outcome_prices: Option<Value>,
}

/// Gamma returns numbers both as JSON numbers and as strings.
fn as_f64(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Lists like `outcomes` arrive as JSON-encoded strings.
fn decode_list(v: Option<Value>) -> Value {
    match v {
        Some(Value::String(s)) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        Some(other) => other,
        None => Value::Null,
    }
}

fn id_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Active markets ordered by 24h volume.
pub struct PolymarketAdapter {
    fetcher: SharedFetcher,
    api_base: String,
}

impl PolymarketAdapter {
    pub fn new(fetcher: SharedFetcher) -> Self {
        Self {
            fetcher,
            api_base: GAMMA_API_BASE.to_string(),
        }
    }

    pub fn markets_url(&self, limit: u64) -> String {
        format!(
            "{}/markets?active=true&closed=false&order=volume24hr&ascending=false&limit={limit}",
            self.api_base
        )
    }
}

#[async_trait]
impl SourceAdapter for PolymarketAdapter {
    async fn fetch_items(&self, source: &Source) -> Result<Vec<CandidateItem>> {
        let limit = source.config_u64("limit").unwrap_or(DEFAULT_LIMIT);
        let markets: Vec<Market> =
            get_json(self.fetcher.as_ref(), &self.markets_url(limit), &[]).await?;

        let items = markets
            .into_iter()
            .filter_map(|m| {
                let id = id_string(&m.id)?;
                let title = normalize_text(m.question.as_deref()?);
                let slug = m.slug.filter(|s| !s.trim().is_empty())?;
                if title.is_empty() {
                    return None;
                }
                let volume = as_f64(m.volume24hr.as_ref());
                Some(
                    CandidateItem::new(title, format!("https://polymarket.com/market/{slug}"))
                        .with_external_id(id)
                        .with_score(volume)
                        .with_summary(m.description.as_deref().map(normalize_text))
                        .with_published_at(m.start_date)
                        .with_metadata(json!({
                            "volume24hr": volume,
                            "endDate": m.end_date,
                            "outcomes": decode_list(m.outcomes),
                            "outcomePrices": decode_list(m.outcome_prices),
                        })),
                )
            })
            .collect();
        Ok(items)
    }

    fn name(&self) -> &'static str {
        "polymarket"
    }
}
