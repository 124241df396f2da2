// src/db/users.rs
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::{sources, subscriptions};
use crate::models::User;

/// Create a user and subscribe them to every built-in source.
pub async fn register(pool: &SqlitePool, email: &str) -> Result<User> {
    let email = email.trim().to_ascii_lowercase();
    anyhow::ensure!(email.contains('@'), "invalid email: {email}");

    let id = sqlx::query("INSERT INTO users (email, created_at) VALUES (?, ?)")
        .bind(&email)
        .bind(Utc::now())
        .execute(pool)
        .await
        .with_context(|| format!("registering user {email}"))?
        .last_insert_rowid();

    for src in sources::list_builtin(pool).await? {
        subscriptions::subscribe(pool, id, src.id).await?;
    }
    info!(target: "db", user_id = id, "registered user");

    get(pool, id).await?.context("user vanished right after insert")
}

pub async fn get(pool: &SqlitePool, id: i64) -> Result<Option<User>> {
    let row = sqlx::query_as::<_, User>("SELECT id, email, created_at FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}

pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>> {
    let row =
        sqlx::query_as::<_, User>("SELECT id, email, created_at FROM users WHERE email = ?")
            .bind(email.trim().to_ascii_lowercase())
            .fetch_optional(pool)
            .await?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{seed_builtin_sources, test_pool};

    #[tokio::test]
    async fn registration_subscribes_to_builtins() {
        let pool = test_pool().await;
        seed_builtin_sources(&pool).await.unwrap();

        let user = register(&pool, " Reader@Example.com ").await.unwrap();
        assert_eq!(user.email, "reader@example.com");

        let subs = subscriptions::list_enabled(&pool, user.id).await.unwrap();
        let builtins = sources::list_builtin(&pool).await.unwrap();
        assert_eq!(subs.len(), builtins.len());
        assert!(find_by_email(&pool, "READER@example.com")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn rejects_garbage_email() {
        let pool = test_pool().await;
        assert!(register(&pool, "nobody").await.is_err());
    }
}
