// src/ingest/providers/mod.rs
//! Per-type source adapters and the registry that dispatches on `SourceType`.

pub mod cryptopanic;
pub mod dune;
pub mod feed;
pub mod github;
pub mod hackernews;
pub mod polymarket;

use std::collections::HashMap;
use std::sync::Arc;

use crate::ingest::fetch::SharedFetcher;
use crate::ingest::types::SourceAdapter;
use crate::models::SourceType;

pub use cryptopanic::CryptoPanicAdapter;
pub use dune::DuneAdapter;
pub use feed::FeedAdapter;
pub use github::GithubAdapter;
pub use hackernews::HackerNewsAdapter;
pub use polymarket::PolymarketAdapter;

/// Read an env var, treating empty values as unset.
pub(crate) fn env_token(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<SourceType, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Every built-in adapter, all sharing one fetcher.
    pub fn with_defaults(fetcher: SharedFetcher) -> Self {
        let feed: Arc<dyn SourceAdapter> = Arc::new(FeedAdapter::new(fetcher.clone()));
        let mut reg = Self::empty();
        reg.register(
            SourceType::HackerNews,
            Arc::new(HackerNewsAdapter::new(fetcher.clone())),
        );
        reg.register(SourceType::Github, Arc::new(GithubAdapter::new(fetcher.clone())));
        reg.register(
            SourceType::Polymarket,
            Arc::new(PolymarketAdapter::new(fetcher.clone())),
        );
        reg.register(
            SourceType::CryptoPanic,
            Arc::new(CryptoPanicAdapter::new(fetcher.clone())),
        );
        reg.register(SourceType::Dune, Arc::new(DuneAdapter::new(fetcher)));
        for t in [
            SourceType::ProductHunt,
            SourceType::Rss,
            SourceType::Substack,
            SourceType::Other,
        ] {
            reg.register(t, feed.clone());
        }
        reg
    }

    pub fn register(&mut self, source_type: SourceType, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(source_type, adapter);
    }

    pub fn get(&self, source_type: SourceType) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&source_type).cloned()
    }
}

#[cfg(test)]
pub(crate) fn source_fixture(
    source_type: SourceType,
    base_url: &str,
    config: serde_json::Value,
) -> crate::models::Source {
    crate::models::Source {
        id: 1,
        name: format!("test {source_type}"),
        source_type,
        base_url: base_url.to_string(),
        icon: None,
        config: sqlx::types::Json(config),
        is_built_in: false,
        is_active: true,
        last_fetched: None,
        created_by: None,
        created_at: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::fetch::FixtureFetcher;

    #[test]
    fn defaults_cover_every_source_type() {
        let reg = AdapterRegistry::with_defaults(Arc::new(FixtureFetcher::new()));
        for t in SourceType::ALL {
            assert!(reg.get(t).is_some(), "no adapter for {t}");
        }
        assert_eq!(reg.get(SourceType::Substack).map(|a| a.name()), Some("feed"));
        assert!(AdapterRegistry::empty().get(SourceType::Rss).is_none());
    }
}
