// src/db/subscriptions.rs
//! User ↔ source subscriptions and per-user signal state (read / favorite).

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{UserSignal, UserSource};

/// Subscribe (or re-enable). New rows go to the end of the user's column order.
pub async fn subscribe(pool: &SqlitePool, user_id: i64, source_id: i64) -> Result<UserSource> {
    sqlx::query(
        r#"
        INSERT INTO user_sources (user_id, source_id, enabled, display_order)
        VALUES (?, ?, 1, (SELECT COALESCE(MAX(display_order), -1) + 1 FROM user_sources WHERE user_id = ?))
        ON CONFLICT (user_id, source_id) DO UPDATE SET enabled = 1
        "#,
    )
    .bind(user_id)
    .bind(source_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    let row = sqlx::query_as::<_, UserSource>(
        "SELECT user_id, source_id, enabled, display_order FROM user_sources WHERE user_id = ? AND source_id = ?",
    )
    .bind(user_id)
    .bind(source_id)
    .fetch_one(pool)
    .await?;
    Ok(row)
}

/// Soft-disable; the row stays. Returns false when there was no subscription.
pub async fn unsubscribe(pool: &SqlitePool, user_id: i64, source_id: i64) -> Result<bool> {
    let res =
        sqlx::query("UPDATE user_sources SET enabled = 0 WHERE user_id = ? AND source_id = ?")
            .bind(user_id)
            .bind(source_id)
            .execute(pool)
            .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_enabled(pool: &SqlitePool, user_id: i64) -> Result<Vec<UserSource>> {
    let rows = sqlx::query_as::<_, UserSource>(
        r#"
        SELECT user_id, source_id, enabled, display_order
        FROM user_sources
        WHERE user_id = ? AND enabled = 1
        ORDER BY display_order, source_id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get(pool: &SqlitePool, user_id: i64, source_id: i64) -> Result<Option<UserSource>> {
    let row = sqlx::query_as::<_, UserSource>(
        "SELECT user_id, source_id, enabled, display_order FROM user_sources WHERE user_id = ? AND source_id = ?",
    )
    .bind(user_id)
    .bind(source_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Mark a signal read (or unread). Upserts the per-user row.
pub async fn set_read(
    pool: &SqlitePool,
    user_id: i64,
    signal_id: i64,
    read: bool,
) -> Result<UserSignal> {
    let read_at = read.then(Utc::now);
    sqlx::query(
        r#"
        INSERT INTO user_signals (user_id, signal_id, is_read, read_at, is_favorited)
        VALUES (?, ?, ?, ?, 0)
        ON CONFLICT (user_id, signal_id) DO UPDATE SET is_read = excluded.is_read, read_at = excluded.read_at
        "#,
    )
    .bind(user_id)
    .bind(signal_id)
    .bind(read)
    .bind(read_at)
    .execute(pool)
    .await?;
    state(pool, user_id, signal_id).await
}

pub async fn set_favorite(
    pool: &SqlitePool,
    user_id: i64,
    signal_id: i64,
    favorited: bool,
) -> Result<UserSignal> {
    sqlx::query(
        r#"
        INSERT INTO user_signals (user_id, signal_id, is_read, read_at, is_favorited)
        VALUES (?, ?, 0, NULL, ?)
        ON CONFLICT (user_id, signal_id) DO UPDATE SET is_favorited = excluded.is_favorited
        "#,
    )
    .bind(user_id)
    .bind(signal_id)
    .bind(favorited)
    .execute(pool)
    .await?;
    state(pool, user_id, signal_id).await
}

/// Per-user state; a missing row reads as unread and not favorited.
pub async fn state(pool: &SqlitePool, user_id: i64, signal_id: i64) -> Result<UserSignal> {
    let row = sqlx::query_as::<_, UserSignal>(
        "SELECT user_id, signal_id, is_read, read_at, is_favorited FROM user_signals WHERE user_id = ? AND signal_id = ?",
    )
    .bind(user_id)
    .bind(signal_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.unwrap_or(UserSignal {
        user_id,
        signal_id,
        ..Default::default()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{signals, sources, test_pool, users};
    use crate::ingest::types::CandidateItem;
    use crate::models::{NewSource, SourceType};
    use serde_json::json;

    async fn fixture() -> (SqlitePool, i64, i64) {
        let pool = test_pool().await;
        let user = users::register(&pool, "u@example.com").await.unwrap();
        let src = sources::insert(
            &pool,
            &NewSource {
                name: "Feed".into(),
                source_type: SourceType::Rss,
                base_url: "https://example.com".into(),
                icon: None,
                config: json!({}),
                is_built_in: false,
                created_by: Some(user.id),
            },
        )
        .await
        .unwrap();
        (pool, user.id, src.id)
    }

    #[tokio::test]
    async fn unsubscribe_keeps_the_row_disabled() {
        let (pool, user, src) = fixture().await;
        let sub = subscribe(&pool, user, src).await.unwrap();
        assert!(sub.enabled);

        assert!(unsubscribe(&pool, user, src).await.unwrap());
        let row = get(&pool, user, src).await.unwrap().unwrap();
        assert!(!row.enabled);
        assert!(list_enabled(&pool, user).await.unwrap().is_empty());

        let again = subscribe(&pool, user, src).await.unwrap();
        assert!(again.enabled);
        assert_eq!(again.display_order, sub.display_order);
    }

    #[tokio::test]
    async fn read_and_favorite_share_one_row() {
        let (pool, user, src) = fixture().await;
        let item = CandidateItem::new("Title", "https://example.com/a").with_external_id("a");
        let signal_id = signals::insert_candidate(&pool, src, &item)
            .await
            .unwrap()
            .unwrap();

        let s0 = state(&pool, user, signal_id).await.unwrap();
        assert!(!s0.is_read && !s0.is_favorited);

        let s1 = set_read(&pool, user, signal_id, true).await.unwrap();
        assert!(s1.is_read);
        assert!(s1.read_at.is_some());

        let s2 = set_favorite(&pool, user, signal_id, true).await.unwrap();
        assert!(s2.is_read, "favorite must not clear read state");
        assert!(s2.is_favorited);

        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM user_signals")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
}
