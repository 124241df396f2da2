// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod chunk;
pub mod config;
pub mod db;
pub mod enrich;
pub mod ingest;
pub mod metrics;
pub mod models;
pub mod reader;
pub mod ssrf;
pub mod telemetry;

#[cfg(test)]
mod test_http;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

pub use crate::api::{router, AppState};
use crate::config::{AiConfig, AppConfig};
use crate::enrich::llm::build_llm_client;
use crate::ingest::fetch::HttpFetcher;

/// Open the database and wire every service from config.
pub async fn build_state(config: AppConfig, ai: &AiConfig) -> Result<AppState> {
    let pool = db::open(&config.database_url).await?;
    let fetcher = Arc::new(
        HttpFetcher::new(&config.ingest.user_agent, config.ingest.timeout_secs)?
            .max_body_bytes(config.ingest.max_body_bytes),
    );
    let llm = build_llm_client(ai);
    info!(
        llm_provider = llm.provider_name(),
        llm_model = llm.model(),
        "services ready"
    );
    Ok(AppState::new(pool, config, llm, fetcher))
}
