// src/db/sources.rs
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::{NewSource, Source, SourceType, SubscribedSource};

const SOURCE_COLUMNS: &str = "id, name, source_type, base_url, icon, config, is_built_in, \
     is_active, last_fetched, created_by, created_at";

pub async fn insert(pool: &SqlitePool, new: &NewSource) -> Result<Source> {
    let id = sqlx::query(
        r#"
        INSERT INTO sources (name, source_type, base_url, icon, config, is_built_in, is_active, created_by, created_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&new.name)
    .bind(new.source_type)
    .bind(&new.base_url)
    .bind(&new.icon)
    .bind(Json(&new.config))
    .bind(new.is_built_in)
    .bind(new.created_by)
    .bind(Utc::now())
    .execute(pool)
    .await
    .with_context(|| format!("inserting source '{}'", new.name))?
    .last_insert_rowid();

    get(pool, id)
        .await?
        .context("source vanished right after insert")
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Source>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = ?");
    let row = sqlx::query_as::<_, Source>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn find_by_name(pool: &SqlitePool, name: &str) -> Result<Option<Source>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE name = ?");
    let row = sqlx::query_as::<_, Source>(&sql)
        .bind(name)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// RSS-like source whose `config.feedUrl` equals `feed_url`.
pub async fn find_by_feed_url(pool: &SqlitePool, feed_url: &str) -> Result<Option<Source>> {
    let sql = format!(
        "SELECT {SOURCE_COLUMNS} FROM sources \
         WHERE json_extract(config, '$.feedUrl') = ? ORDER BY id LIMIT 1"
    );
    let row = sqlx::query_as::<_, Source>(&sql)
        .bind(feed_url)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Sources the scraper should visit: active, and either built-in or
/// subscribed (enabled) by at least one user.
pub async fn list_scrape_targets(pool: &SqlitePool) -> Result<Vec<Source>> {
    let sql = format!(
        "SELECT {SOURCE_COLUMNS} FROM sources s \
         WHERE s.is_active = 1 AND (s.is_built_in = 1 OR EXISTS ( \
             SELECT 1 FROM user_sources us WHERE us.source_id = s.id AND us.enabled = 1)) \
         ORDER BY s.id"
    );
    let rows = sqlx::query_as::<_, Source>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

pub async fn list_builtin(pool: &SqlitePool) -> Result<Vec<Source>> {
    let sql = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE is_built_in = 1 ORDER BY id");
    let rows = sqlx::query_as::<_, Source>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

/// Every active source with the user's subscription state.
pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<SubscribedSource>> {
    let rows = sqlx::query_as::<_, SubscribedSource>(
        r#"
        SELECT s.id, s.name, s.source_type, s.base_url, s.icon, s.config, s.is_built_in,
               s.is_active, s.last_fetched, s.created_by, s.created_at,
               COALESCE(us.enabled, 0) AS subscribed,
               us.display_order AS display_order
        FROM sources s
        LEFT JOIN user_sources us ON us.source_id = s.id AND us.user_id = ?
        WHERE s.is_active = 1
        ORDER BY COALESCE(us.display_order, 1000000), s.id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn touch_last_fetched(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE sources SET last_fetched = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_active(pool: &SqlitePool, id: i64, active: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE sources SET is_active = ? WHERE id = ?")
        .bind(active)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    BuiltIn,
    NotOwner,
}

/// Delete a user-created source. Built-ins are never deleted.
pub async fn delete_owned(pool: &SqlitePool, id: i64, user_id: i64) -> Result<DeleteOutcome> {
    let Some(src) = get(pool, id).await? else {
        return Ok(DeleteOutcome::NotFound);
    };
    if src.is_built_in {
        return Ok(DeleteOutcome::BuiltIn);
    }
    if src.created_by != Some(user_id) {
        return Ok(DeleteOutcome::NotOwner);
    }
    sqlx::query("DELETE FROM sources WHERE id = ? AND is_built_in = 0")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(DeleteOutcome::Deleted)
}

/// `base` if free, else `base (2)`, `base (3)`, ...
pub async fn unique_name(pool: &SqlitePool, base: &str) -> Result<String> {
    let base = base.trim();
    let base = if base.is_empty() { "Untitled feed" } else { base };
    if find_by_name(pool, base).await?.is_none() {
        return Ok(base.to_string());
    }
    for n in 2..1000 {
        let candidate = format!("{base} ({n})");
        if find_by_name(pool, &candidate).await?.is_none() {
            return Ok(candidate);
        }
    }
    anyhow::bail!("no free name for source '{base}'")
}

pub fn is_feed_type(t: SourceType) -> bool {
    matches!(
        t,
        SourceType::Rss | SourceType::Substack | SourceType::ProductHunt | SourceType::Other
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{seed_builtin_sources, test_pool, users};
    use serde_json::json;

    fn rss(name: &str, owner: Option<i64>) -> NewSource {
        NewSource {
            name: name.into(),
            source_type: SourceType::Rss,
            base_url: "https://blog.example.com".into(),
            icon: None,
            config: json!({ "feedUrl": "https://blog.example.com/feed.xml" }),
            is_built_in: false,
            created_by: owner,
        }
    }

    #[tokio::test]
    async fn name_is_unique() {
        let pool = test_pool().await;
        insert(&pool, &rss("Blog", None)).await.unwrap();
        let err = insert(&pool, &rss("Blog", None)).await.unwrap_err();
        assert!(crate::db::is_unique_violation(&err));
        assert_eq!(unique_name(&pool, "Blog").await.unwrap(), "Blog (2)");
    }

    #[tokio::test]
    async fn builtin_sources_cannot_be_deleted() {
        let pool = test_pool().await;
        seed_builtin_sources(&pool).await.unwrap();
        let user = users::register(&pool, "a@example.com").await.unwrap();
        let hn = find_by_name(&pool, "Hacker News").await.unwrap().unwrap();
        assert_eq!(
            delete_owned(&pool, hn.id, user.id).await.unwrap(),
            DeleteOutcome::BuiltIn
        );
        assert!(get(&pool, hn.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn only_owner_deletes_custom_source() {
        let pool = test_pool().await;
        let owner = users::register(&pool, "o@example.com").await.unwrap();
        let other = users::register(&pool, "x@example.com").await.unwrap();
        let src = insert(&pool, &rss("Mine", Some(owner.id))).await.unwrap();

        assert_eq!(
            delete_owned(&pool, src.id, other.id).await.unwrap(),
            DeleteOutcome::NotOwner
        );
        assert_eq!(
            delete_owned(&pool, src.id, owner.id).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            delete_owned(&pool, src.id, owner.id).await.unwrap(),
            DeleteOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn feed_url_lookup_uses_config_json() {
        let pool = test_pool().await;
        let src = insert(&pool, &rss("Blog", None)).await.unwrap();
        let found = find_by_feed_url(&pool, "https://blog.example.com/feed.xml")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, src.id);
        assert_eq!(found.config_str("feedUrl"), Some("https://blog.example.com/feed.xml"));
    }

    #[tokio::test]
    async fn scrape_targets_skip_unsubscribed_custom_sources() {
        let pool = test_pool().await;
        seed_builtin_sources(&pool).await.unwrap();
        let custom = insert(&pool, &rss("Lonely", None)).await.unwrap();
        let targets = list_scrape_targets(&pool).await.unwrap();
        assert!(targets.iter().all(|s| s.id != custom.id));
        assert!(targets.iter().all(|s| s.is_built_in));
    }
}
