// src/db/mod.rs
//! SQLite pool setup, schema bootstrap and built-in source seeding.

pub mod ai_cache;
pub mod api_keys;
pub mod signals;
pub mod sources;
pub mod subscriptions;
pub mod users;

use anyhow::{Context, Result};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

use crate::models::{NewSource, SourceType};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        source_type TEXT NOT NULL,
        base_url TEXT NOT NULL,
        icon TEXT,
        config TEXT NOT NULL DEFAULT '{}',
        is_built_in INTEGER NOT NULL DEFAULT 0,
        is_active INTEGER NOT NULL DEFAULT 1,
        last_fetched TEXT,
        created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS signals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        summary TEXT,
        score REAL NOT NULL DEFAULT 0,
        tags TEXT NOT NULL DEFAULT '[]',
        tags_localized TEXT NOT NULL DEFAULT '[]',
        ai_summary TEXT,
        ai_summary_localized TEXT,
        title_translated TEXT,
        external_id TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        ai_attempts INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (source_id, external_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_signals_pending ON signals (ai_summary, ai_attempts)",
    "CREATE INDEX IF NOT EXISTS idx_signals_source_created ON signals (source_id, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS user_sources (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
        enabled INTEGER NOT NULL DEFAULT 1,
        display_order INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, source_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_signals (
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        signal_id INTEGER NOT NULL REFERENCES signals(id) ON DELETE CASCADE,
        is_read INTEGER NOT NULL DEFAULT 0,
        read_at TEXT,
        is_favorited INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (user_id, signal_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS agent_api_keys (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        key_hash TEXT NOT NULL UNIQUE,
        key_prefix TEXT NOT NULL,
        permissions TEXT NOT NULL DEFAULT '[]',
        enabled INTEGER NOT NULL DEFAULT 1,
        expires_at TEXT,
        last_used_at TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS ai_cache (
        url TEXT PRIMARY KEY,
        short_summary TEXT,
        long_summary TEXT,
        translation TEXT,
        model TEXT,
        provider TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
];

/// Open a pool for `database_url` (`sqlite://path.db` or `sqlite::memory:`).
///
/// In-memory databases are private to a connection, so they get a single-connection pool.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("invalid database url: {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true);

    let max = if database_url.contains(":memory:") { 1 } else { 8 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(opts)
        .await
        .context("opening sqlite pool")?;
    Ok(pool)
}

/// Create tables and indexes if missing.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for stmt in SCHEMA {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("applying schema")?;
    }
    Ok(())
}

/// Built-in sources every user is subscribed to on registration.
pub fn builtin_sources() -> Vec<NewSource> {
    vec![
        NewSource {
            name: "Hacker News".into(),
            source_type: SourceType::HackerNews,
            base_url: "https://news.ycombinator.com".into(),
            icon: Some("https://news.ycombinator.com/favicon.ico".into()),
            config: json!({ "feed": "topstories", "limit": 30 }),
            is_built_in: true,
            created_by: None,
        },
        NewSource {
            name: "GitHub Trending".into(),
            source_type: SourceType::Github,
            base_url: "https://github.com".into(),
            icon: Some("https://github.com/favicon.ico".into()),
            config: json!({ "days": 7, "limit": 25 }),
            is_built_in: true,
            created_by: None,
        },
        NewSource {
            name: "Product Hunt".into(),
            source_type: SourceType::ProductHunt,
            base_url: "https://www.producthunt.com".into(),
            icon: Some("https://www.producthunt.com/favicon.ico".into()),
            config: json!({ "feedUrl": "https://www.producthunt.com/feed" }),
            is_built_in: true,
            created_by: None,
        },
        NewSource {
            name: "Polymarket".into(),
            source_type: SourceType::Polymarket,
            base_url: "https://polymarket.com".into(),
            icon: Some("https://polymarket.com/favicon.ico".into()),
            config: json!({ "limit": 20 }),
            is_built_in: true,
            created_by: None,
        },
    ]
}

/// Insert built-in sources that are not present yet (matched by name).
pub async fn seed_builtin_sources(pool: &SqlitePool) -> Result<usize> {
    let mut inserted = 0usize;
    for src in builtin_sources() {
        if sources::find_by_name(pool, &src.name).await?.is_none() {
            sources::insert(pool, &src).await?;
            info!(target: "db", name = %src.name, "seeded built-in source");
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Connect, create the schema and seed built-ins.
pub async fn open(database_url: &str) -> Result<SqlitePool> {
    let pool = connect(database_url).await?;
    init_schema(&pool).await?;
    seed_builtin_sources(&pool).await?;
    Ok(pool)
}

/// True when `err` wraps a unique-constraint violation.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<sqlx::Error>()
            .and_then(|e| e.as_database_error())
            .is_some_and(|db| db.is_unique_violation())
    })
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = connect("sqlite::memory:").await.unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent_and_seed_runs_once() {
        let pool = test_pool().await;
        init_schema(&pool).await.unwrap();

        let first = seed_builtin_sources(&pool).await.unwrap();
        let second = seed_builtin_sources(&pool).await.unwrap();
        assert_eq!(first, builtin_sources().len());
        assert_eq!(second, 0);

        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources WHERE is_built_in = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(n as usize, builtin_sources().len());
    }
}
