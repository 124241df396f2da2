// src/db/api_keys.rs
//! Agent API keys. Only the SHA-256 of the secret is stored; the secret is
//! returned once from `create`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::models::AgentApiKey;

pub const KEY_PREFIX: &str = "sb_";

const KEY_COLUMNS: &str = "id, user_id, name, key_hash, key_prefix, permissions, enabled, \
     expires_at, last_used_at, created_at";

pub fn hash_secret(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    let mut out = String::with_capacity(64);
    for b in digest.iter() {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

fn generate_secret() -> String {
    format!(
        "{KEY_PREFIX}{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Create a key; returns the row and the plaintext secret.
pub async fn create(
    pool: &SqlitePool,
    user_id: i64,
    name: &str,
    permissions: &[String],
    expires_at: Option<DateTime<Utc>>,
) -> Result<(AgentApiKey, String)> {
    let secret = generate_secret();
    let prefix: String = secret.chars().take(KEY_PREFIX.len() + 8).collect();

    let id = sqlx::query(
        r#"
        INSERT INTO agent_api_keys (user_id, name, key_hash, key_prefix, permissions, enabled, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(name)
    .bind(hash_secret(&secret))
    .bind(&prefix)
    .bind(Json(permissions))
    .bind(expires_at)
    .bind(Utc::now())
    .execute(pool)
    .await
    .context("inserting api key")?
    .last_insert_rowid();

    let key = get(pool, id).await?.context("api key vanished after insert")?;
    Ok((key, secret))
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<AgentApiKey>> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM agent_api_keys WHERE id = ?");
    let row = sqlx::query_as::<_, AgentApiKey>(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

/// Look a key up by its plaintext secret. Does not check enabled/expiry.
pub async fn find_by_secret(pool: &SqlitePool, secret: &str) -> Result<Option<AgentApiKey>> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM agent_api_keys WHERE key_hash = ?");
    let row = sqlx::query_as::<_, AgentApiKey>(&sql)
        .bind(hash_secret(secret.trim()))
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn touch_last_used(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE agent_api_keys SET last_used_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_enabled(pool: &SqlitePool, id: i64, enabled: bool) -> Result<bool> {
    let res = sqlx::query("UPDATE agent_api_keys SET enabled = ? WHERE id = ?")
        .bind(enabled)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_for_user(pool: &SqlitePool, user_id: i64) -> Result<Vec<AgentApiKey>> {
    let sql = format!("SELECT {KEY_COLUMNS} FROM agent_api_keys WHERE user_id = ? ORDER BY id");
    let rows = sqlx::query_as::<_, AgentApiKey>(&sql)
        .bind(user_id)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
