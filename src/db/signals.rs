// src/db/signals.rs
//! Signal persistence. The enrichment queue is the predicate
//! `ai_summary IS NULL AND ai_attempts < max_attempts`.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::ingest::types::CandidateItem;
use crate::models::{Signal, SignalView};

const SIGNAL_COLUMNS: &str = "s.id, s.source_id, s.title, s.url, s.summary, s.score, s.tags, \
     s.tags_localized, s.ai_summary, s.ai_summary_localized, s.title_translated, s.external_id, \
     s.metadata, s.ai_attempts, s.created_at, s.updated_at";

/// AI-derived fields written back by the enrichment pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Enrichment {
    pub tags: Vec<String>,
    pub tags_localized: Vec<String>,
    pub summary: String,
    pub summary_localized: String,
    pub title_translated: String,
}

pub async fn exists(pool: &SqlitePool, source_id: i64, external_id: &str) -> Result<bool> {
    let found: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM signals WHERE source_id = ? AND external_id = ?)",
    )
    .bind(source_id)
    .bind(external_id)
    .fetch_one(pool)
    .await?;
    Ok(found)
}

/// Insert unless the dedup key is already stored for this source.
/// Returns the new row id, or `None` when it was a duplicate.
pub async fn insert_candidate(
    pool: &SqlitePool,
    source_id: i64,
    item: &CandidateItem,
) -> Result<Option<i64>> {
    let key = item.dedup_key();
    if exists(pool, source_id, key).await? {
        return Ok(None);
    }

    let now = Utc::now();
    let created = item.published_at.map(|p| p.min(now)).unwrap_or(now);
    let res = sqlx::query(
        r#"
        INSERT INTO signals (source_id, title, url, summary, score, external_id, metadata, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (source_id, external_id) DO NOTHING
        "#,
    )
    .bind(source_id)
    .bind(&item.title)
    .bind(&item.url)
    .bind(&item.summary)
    .bind(item.score)
    .bind(key)
    .bind(Json(&item.metadata))
    .bind(created)
    .bind(now)
    .execute(pool)
    .await
    .with_context(|| format!("inserting signal {key} for source {source_id}"))?;

    // A concurrent run may have won the race between the check and the insert.
    if res.rows_affected() == 0 {
        return Ok(None);
    }
    Ok(Some(res.last_insert_rowid()))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<Signal>> {
    let sql = format!("SELECT {SIGNAL_COLUMNS} FROM signals s WHERE s.id = ?");
    let row = sqlx::query_as::<_, Signal>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn count(pool: &SqlitePool) -> Result<i64> {
    let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signals")
        .fetch_one(pool)
        .await?;
    Ok(n)
}

/// Newest-first batch of signals still waiting for enrichment.
pub async fn list_pending(pool: &SqlitePool, limit: i64, max_attempts: i64) -> Result<Vec<Signal>> {
    let sql = format!(
        "SELECT {SIGNAL_COLUMNS} FROM signals s \
         WHERE s.ai_summary IS NULL AND s.ai_attempts < ? \
         ORDER BY s.created_at DESC, s.id DESC LIMIT ?"
    );
    let rows = sqlx::query_as::<_, Signal>(&sql)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn pending_count(pool: &SqlitePool, max_attempts: i64) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM signals WHERE ai_summary IS NULL AND ai_attempts < ?",
    )
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Signals that exhausted their enrichment attempts.
pub async fn failed_count(pool: &SqlitePool, max_attempts: i64) -> Result<i64> {
    let n: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM signals WHERE ai_summary IS NULL AND ai_attempts >= ?",
    )
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

pub async fn save_enrichment(pool: &SqlitePool, id: i64, e: &Enrichment) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE signals
        SET tags = ?, tags_localized = ?, ai_summary = ?, ai_summary_localized = ?,
            title_translated = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Json(&e.tags))
    .bind(Json(&e.tags_localized))
    .bind(&e.summary)
    .bind(&e.summary_localized)
    .bind(&e.title_translated)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("saving enrichment for signal {id}"))?;
    Ok(())
}

pub async fn record_failure(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE signals SET ai_attempts = ai_attempts + 1, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Clear AI fields so the signal is picked up again.
pub async fn reset_enrichment(pool: &SqlitePool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        r#"
        UPDATE signals
        SET tags = '[]', tags_localized = '[]', ai_summary = NULL, ai_summary_localized = NULL,
            title_translated = NULL, ai_attempts = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() > 0)
}

/// Give attempt-capped signals a fresh set of attempts.
pub async fn reset_failed(pool: &SqlitePool, max_attempts: i64) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE signals SET ai_attempts = 0 WHERE ai_summary IS NULL AND ai_attempts >= ?",
    )
    .bind(max_attempts)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Hacker News signals whose summary is still the raw `Comments: N` string.
pub async fn list_hn_comment_summaries(pool: &SqlitePool) -> Result<Vec<Signal>> {
    let sql = format!(
        "SELECT {SIGNAL_COLUMNS} FROM signals s JOIN sources src ON src.id = s.source_id \
         WHERE src.source_type = 'hackernews' AND s.summary LIKE 'Comments:%' ORDER BY s.id"
    );
    let rows = sqlx::query_as::<_, Signal>(&sql).fetch_all(pool).await?;
    Ok(rows)
}

/// Replace metadata, drop the summary and every AI field.
pub async fn replace_metadata_and_clear(
    pool: &SqlitePool,
    id: i64,
    metadata: &serde_json::Value,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE signals
        SET metadata = ?, summary = NULL, tags = '[]', tags_localized = '[]', ai_summary = NULL,
            ai_summary_localized = NULL, title_translated = NULL, ai_attempts = 0, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Json(metadata))
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Filters for listing signals visible to one user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignalQuery {
    pub source_id: Option<i64>,
    pub unread: Option<bool>,
    pub favorited: Option<bool>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn push_view_select(qb: &mut QueryBuilder<'_, Sqlite>, user_id: i64) {
    qb.push(format!(
        "SELECT {SIGNAL_COLUMNS}, src.name AS source_name, src.source_type AS source_type, \
         COALESCE(ust.is_read, 0) AS is_read, COALESCE(ust.is_favorited, 0) AS is_favorited \
         FROM signals s JOIN sources src ON src.id = s.source_id \
         LEFT JOIN user_signals ust ON ust.signal_id = s.id AND ust.user_id = "
    ));
    qb.push_bind(user_id);
}

/// Signals from the user's enabled subscriptions, newest first.
pub async fn query_for_user(
    pool: &SqlitePool,
    user_id: i64,
    q: &SignalQuery,
    max_limit: i64,
) -> Result<Vec<SignalView>> {
    let mut qb = QueryBuilder::<Sqlite>::new("");
    push_view_select(&mut qb, user_id);
    qb.push(" JOIN user_sources us ON us.source_id = s.source_id AND us.enabled = 1 AND us.user_id = ");
    qb.push_bind(user_id);
    qb.push(" WHERE 1 = 1");

    if let Some(source_id) = q.source_id {
        qb.push(" AND s.source_id = ").push_bind(source_id);
    }
    if q.unread == Some(true) {
        qb.push(" AND COALESCE(ust.is_read, 0) = 0");
    }
    if let Some(fav) = q.favorited {
        qb.push(" AND COALESCE(ust.is_favorited, 0) = ").push_bind(fav);
    }
    if let Some(term) = q.q.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let like = format!("%{term}%");
        qb.push(" AND (s.title LIKE ")
            .push_bind(like.clone())
            .push(" OR s.title_translated LIKE ")
            .push_bind(like.clone())
            .push(" OR s.ai_summary LIKE ")
            .push_bind(like)
            .push(")");
    }

    let limit = q.limit.unwrap_or(50).clamp(1, max_limit.max(1));
    let offset = q.offset.unwrap_or(0).max(0);
    qb.push(" ORDER BY s.created_at DESC, s.id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb.build_query_as::<SignalView>().fetch_all(pool).await?;
    Ok(rows)
}

/// One signal with the user's state, regardless of subscription.
pub async fn view_for_user(
    pool: &SqlitePool,
    user_id: i64,
    signal_id: i64,
) -> Result<Option<SignalView>> {
    let mut qb = QueryBuilder::<Sqlite>::new("");
    push_view_select(&mut qb, user_id);
    qb.push(" WHERE s.id = ").push_bind(signal_id);
    let row = qb.build_query_as::<SignalView>().fetch_optional(pool).await?;
    Ok(row)
}

/// Latest signals of one source for a kanban column.
pub async fn latest_for_source(
    pool: &SqlitePool,
    user_id: i64,
    source_id: i64,
    limit: i64,
) -> Result<Vec<SignalView>> {
    let mut qb = QueryBuilder::<Sqlite>::new("");
    push_view_select(&mut qb, user_id);
    qb.push(" WHERE s.source_id = ")
        .push_bind(source_id)
        .push(" ORDER BY s.created_at DESC, s.id DESC LIMIT ")
        .push_bind(limit);
    let rows = qb.build_query_as::<SignalView>().fetch_all(pool).await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{sources, subscriptions, test_pool, users};
    use crate::models::{NewSource, SourceType};
    use serde_json::json;

    async fn source(pool: &SqlitePool, t: SourceType) -> i64 {
        sources::insert(
            pool,
            &NewSource {
                name: format!("src-{t}"),
                source_type: t,
                base_url: "https://example.com".into(),
                icon: None,
                config: json!({}),
                is_built_in: false,
                created_by: None,
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn duplicate_external_id_is_skipped() {
        let pool = test_pool().await;
        let src = source(&pool, SourceType::Rss).await;
        let item = CandidateItem::new("A", "https://example.com/a").with_external_id("guid-1");

        assert!(insert_candidate(&pool, src, &item).await.unwrap().is_some());
        assert!(insert_candidate(&pool, src, &item).await.unwrap().is_none());
        assert_eq!(count(&pool).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn url_is_the_key_without_external_id() {
        let pool = test_pool().await;
        let src = source(&pool, SourceType::Rss).await;
        let a = CandidateItem::new("A", "https://example.com/a");
        let a_retitled = CandidateItem::new("A (updated)", "https://example.com/a");

        assert!(insert_candidate(&pool, src, &a).await.unwrap().is_some());
        assert!(insert_candidate(&pool, src, &a_retitled).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn same_key_in_different_sources_is_kept() {
        let pool = test_pool().await;
        let s1 = source(&pool, SourceType::Rss).await;
        let s2 = source(&pool, SourceType::Substack).await;
        let item = CandidateItem::new("A", "https://example.com/a").with_external_id("1");
        assert!(insert_candidate(&pool, s1, &item).await.unwrap().is_some());
        assert!(insert_candidate(&pool, s2, &item).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn attempts_cap_removes_from_pending() {
        let pool = test_pool().await;
        let src = source(&pool, SourceType::Rss).await;
        let id = insert_candidate(&pool, src, &CandidateItem::new("A", "https://e.com/a"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pending_count(&pool, 2).await.unwrap(), 1);
        record_failure(&pool, id).await.unwrap();
        record_failure(&pool, id).await.unwrap();
        assert_eq!(pending_count(&pool, 2).await.unwrap(), 0);
        assert_eq!(failed_count(&pool, 2).await.unwrap(), 1);
        assert!(list_pending(&pool, 10, 2).await.unwrap().is_empty());

        assert_eq!(reset_failed(&pool, 2).await.unwrap(), 1);
        assert_eq!(pending_count(&pool, 2).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_filters_by_subscription_and_state() {
        let pool = test_pool().await;
        let user = users::register(&pool, "q@example.com").await.unwrap();
        let subscribed = source(&pool, SourceType::Rss).await;
        let other = source(&pool, SourceType::Github).await;
        subscriptions::subscribe(&pool, user.id, subscribed).await.unwrap();

        let a = insert_candidate(&pool, subscribed, &CandidateItem::new("Rust 2.0", "https://e.com/1"))
            .await
            .unwrap()
            .unwrap();
        insert_candidate(&pool, subscribed, &CandidateItem::new("Go news", "https://e.com/2"))
            .await
            .unwrap();
        insert_candidate(&pool, other, &CandidateItem::new("Rust elsewhere", "https://e.com/3"))
            .await
            .unwrap();

        let all = query_for_user(&pool, user.id, &SignalQuery::default(), 100)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);

        let search = SignalQuery {
            q: Some("rust".into()),
            ..Default::default()
        };
        let hits = query_for_user(&pool, user.id, &search, 100).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].signal.id, a);
        assert_eq!(hits[0].source_type, SourceType::Rss);

        subscriptions::set_read(&pool, user.id, a, true).await.unwrap();
        let unread = SignalQuery {
            unread: Some(true),
            ..Default::default()
        };
        let rows = query_for_user(&pool, user.id, &unread, 100).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_ne!(rows[0].signal.id, a);

        let view = view_for_user(&pool, user.id, a).await.unwrap().unwrap();
        assert!(view.is_read);
    }
}
