// src/models.rs
//! Persisted records: sources, signals, subscriptions, per-user state, agent keys
//! and the reader cache. Row structs map 1:1 onto the SQLite schema in `db`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::fmt;
use std::str::FromStr;

/// Type tag of a source; selects the adapter used to fetch it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SourceType {
    HackerNews,
    Github,
    ProductHunt,
    Rss,
    Polymarket,
    CryptoPanic,
    Dune,
    Substack,
    Other,
}

impl SourceType {
    pub const ALL: [SourceType; 9] = [
        SourceType::HackerNews,
        SourceType::Github,
        SourceType::ProductHunt,
        SourceType::Rss,
        SourceType::Polymarket,
        SourceType::CryptoPanic,
        SourceType::Dune,
        SourceType::Substack,
        SourceType::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::HackerNews => "hackernews",
            SourceType::Github => "github",
            SourceType::ProductHunt => "producthunt",
            SourceType::Rss => "rss",
            SourceType::Polymarket => "polymarket",
            SourceType::CryptoPanic => "cryptopanic",
            SourceType::Dune => "dune",
            SourceType::Substack => "substack",
            SourceType::Other => "other",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        SourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| anyhow::anyhow!("unknown source type: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub source_type: SourceType,
    pub base_url: String,
    pub icon: Option<String>,
    pub config: Json<serde_json::Value>,
    pub is_built_in: bool,
    pub is_active: bool,
    pub last_fetched: Option<DateTime<Utc>>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl Source {
    /// String value from the free-form config, e.g. `feedUrl`.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config
            .0
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Unsigned integer from the config; accepts numbers and numeric strings.
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        match self.config.0.get(key)? {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// Insert payload for a source row.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub source_type: SourceType,
    pub base_url: String,
    pub icon: Option<String>,
    pub config: serde_json::Value,
    pub is_built_in: bool,
    pub created_by: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub url: String,
    pub summary: Option<String>,
    pub score: f64,
    pub tags: Json<Vec<String>>,
    pub tags_localized: Json<Vec<String>>,
    pub ai_summary: Option<String>,
    pub ai_summary_localized: Option<String>,
    pub title_translated: Option<String>,
    pub external_id: String,
    pub metadata: Json<serde_json::Value>,
    pub ai_attempts: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Signal joined with its source name and the caller's read/favorite state.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SignalView {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub signal: Signal,
    pub source_name: String,
    pub source_type: SourceType,
    pub is_read: bool,
    pub is_favorited: bool,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserSource {
    pub user_id: i64,
    pub source_id: i64,
    pub enabled: bool,
    pub display_order: i64,
}

#[derive(Debug, Clone, Default, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UserSignal {
    pub user_id: i64,
    pub signal_id: i64,
    pub is_read: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub is_favorited: bool,
}

/// Source listing for one user: the source plus its subscription state.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedSource {
    #[sqlx(flatten)]
    #[serde(flatten)]
    pub source: Source,
    pub subscribed: bool,
    pub display_order: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AgentApiKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub key_prefix: String,
    pub permissions: Json<Vec<String>>,
    pub enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t <= now)
    }

    /// `*` grants every permission.
    pub fn allows(&self, permission: &str) -> bool {
        self.permissions
            .0
            .iter()
            .any(|p| p == "*" || p == permission)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AiCacheEntry {
    pub url: String,
    pub short_summary: Option<String>,
    pub long_summary: Option<String>,
    pub translation: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_round_trips_through_str() {
        for t in SourceType::ALL {
            assert_eq!(t.as_str().parse::<SourceType>().unwrap(), t);
        }
        assert_eq!(
            " HackerNews ".parse::<SourceType>().unwrap(),
            SourceType::HackerNews
        );
        assert!("mastodon".parse::<SourceType>().is_err());
    }

    #[test]
    fn source_type_serde_uses_lowercase_tags() {
        let v = serde_json::to_string(&SourceType::CryptoPanic).unwrap();
        assert_eq!(v, "\"cryptopanic\"");
        let t: SourceType = serde_json::from_str("\"producthunt\"").unwrap();
        assert_eq!(t, SourceType::ProductHunt);
    }

    #[test]
    fn wildcard_permission_allows_everything() {
        let key = AgentApiKey {
            id: 1,
            user_id: 1,
            name: "k".into(),
            key_hash: String::new(),
            key_prefix: "sb_x".into(),
            permissions: Json(vec!["*".into()]),
            enabled: true,
            expires_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        };
        assert!(key.allows("signals:read"));
        assert!(key.allows("sources:write"));
        assert!(!key.is_expired(Utc::now()));
    }
}
