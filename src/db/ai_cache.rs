// src/db/ai_cache.rs
//! Reader-mode output cache keyed by article URL.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::AiCacheEntry;

/// Which cached column a reader mode reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSlot {
    Short,
    Long,
    Translation,
}

impl CacheSlot {
    fn column(self) -> &'static str {
        match self {
            CacheSlot::Short => "short_summary",
            CacheSlot::Long => "long_summary",
            CacheSlot::Translation => "translation",
        }
    }

    pub fn pick(self, entry: &AiCacheEntry) -> Option<&str> {
        match self {
            CacheSlot::Short => entry.short_summary.as_deref(),
            CacheSlot::Long => entry.long_summary.as_deref(),
            CacheSlot::Translation => entry.translation.as_deref(),
        }
        .filter(|s| !s.trim().is_empty())
    }
}

pub async fn get(pool: &SqlitePool, url: &str) -> Result<Option<AiCacheEntry>> {
    let row = sqlx::query_as::<_, AiCacheEntry>(
        r#"
        SELECT url, short_summary, long_summary, translation, model, provider, created_at, updated_at
        FROM ai_cache WHERE url = ?
        "#,
    )
    .bind(url)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Cached text for `slot`, if any.
pub async fn lookup(pool: &SqlitePool, url: &str, slot: CacheSlot) -> Result<Option<String>> {
    Ok(get(pool, url)
        .await?
        .and_then(|e| slot.pick(&e).map(str::to_string)))
}

pub async fn store(
    pool: &SqlitePool,
    url: &str,
    slot: CacheSlot,
    text: &str,
    model: &str,
    provider: &str,
) -> Result<()> {
    let col = slot.column();
    let now = Utc::now();
    let sql = format!(
        "INSERT INTO ai_cache (url, {col}, model, provider, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) \
         ON CONFLICT (url) DO UPDATE SET {col} = excluded.{col}, model = excluded.model, \
         provider = excluded.provider, updated_at = excluded.updated_at"
    );
    sqlx::query(&sql)
        .bind(url)
        .bind(text)
        .bind(model)
        .bind(provider)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn slots_are_filled_independently() {
        let pool = test_pool().await;
        let url = "https://example.com/post";
        assert!(lookup(&pool, url, CacheSlot::Short).await.unwrap().is_none());

        store(&pool, url, CacheSlot::Short, "short", "m1", "openai").await.unwrap();
        store(&pool, url, CacheSlot::Translation, "译文", "m2", "openai").await.unwrap();

        assert_eq!(lookup(&pool, url, CacheSlot::Short).await.unwrap().as_deref(), Some("short"));
        assert_eq!(
            lookup(&pool, url, CacheSlot::Translation).await.unwrap().as_deref(),
            Some("译文")
        );
        assert!(lookup(&pool, url, CacheSlot::Long).await.unwrap().is_none());

        let entry = get(&pool, url).await.unwrap().unwrap();
        assert_eq!(entry.model.as_deref(), Some("m2"));
    }
}
