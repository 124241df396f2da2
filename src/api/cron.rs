// src/api/cron.rs
//! Scheduler-facing triggers guarded by `CRON_SECRET`.

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::auth::presented_key;
use super::{ApiError, ApiResult, AppState};
use crate::enrich::ProcessReport;
use crate::ingest::SourceRunResult;

fn check_secret(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.cron_secret.as_deref() else {
        return Err(ApiError::Forbidden("cron endpoints are disabled".into()));
    };
    let given = presented_key(headers)
        .ok_or_else(|| ApiError::Unauthorized("missing cron secret".into()))?;
    // Compare digests so timing does not depend on the common prefix.
    if Sha256::digest(given.as_bytes()) != Sha256::digest(expected.as_bytes()) {
        return Err(ApiError::Unauthorized("invalid cron secret".into()));
    }
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapeReport {
    pub sources: usize,
    pub items_added: usize,
    pub failed: usize,
    pub results: Vec<SourceRunResult>,
}

pub async fn scrape(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<ScrapeReport>> {
    check_secret(&state, &headers)?;
    let results = state.runner.run_all().await?;
    let report = ScrapeReport {
        sources: results.len(),
        items_added: results.iter().map(|r| r.items_added).sum(),
        failed: results.iter().filter(|r| !r.success).count(),
        results,
    };
    info!(
        target: "api",
        sources = report.sources,
        added = report.items_added,
        failed = report.failed,
        "cron scrape done"
    );
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize)]
pub struct ProcessQuery {
    pub batch: Option<usize>,
}

pub async fn process(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ProcessQuery>,
) -> ApiResult<Json<ProcessReport>> {
    check_secret(&state, &headers)?;
    let batch = q.batch.unwrap_or(state.config.enrich.batch_size);
    if batch == 0 {
        return Err(ApiError::BadRequest("batch must be >= 1".into()));
    }
    let report = state.processor.process_signals(batch).await?;
    Ok(Json(report))
}
