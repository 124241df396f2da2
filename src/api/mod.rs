// src/api/mod.rs
//! HTTP surface: health, cron triggers, agent REST and MCP JSON-RPC.

pub mod agent;
pub mod auth;
pub mod cron;
pub mod mcp;

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use sqlx::SqlitePool;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::config::AppConfig;
use crate::enrich::llm::DynLlm;
use crate::enrich::SignalProcessor;
use crate::ingest::fetch::SharedFetcher;
use crate::ingest::opml::OpmlError;
use crate::ingest::providers::AdapterRegistry;
use crate::ingest::ScraperRunner;
use crate::reader::AiReader;
use crate::ssrf::{UrlRejection, UrlValidator};

use self::auth::RateLimiter;

/// Services shared by every handler. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub config: Arc<AppConfig>,
    pub llm: DynLlm,
    pub runner: Arc<ScraperRunner>,
    pub processor: Arc<SignalProcessor>,
    pub reader: AiReader,
    pub validator: UrlValidator,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: AppConfig, llm: DynLlm, fetcher: SharedFetcher) -> Self {
        let registry = AdapterRegistry::with_defaults(fetcher.clone());
        Self::with_registry(pool, config, llm, fetcher, registry)
    }

    pub fn with_registry(
        pool: SqlitePool,
        config: AppConfig,
        llm: DynLlm,
        fetcher: SharedFetcher,
        registry: AdapterRegistry,
    ) -> Self {
        let runner = ScraperRunner::new(pool.clone(), registry, config.ingest.concurrency);
        let processor = SignalProcessor::new(pool.clone(), llm.clone(), &config.enrich);
        let reader = AiReader::new(
            pool.clone(),
            llm.clone(),
            fetcher,
            config.reader.chunk_tokens,
            config.enrich.target_language.clone(),
        );
        let limiter = RateLimiter::per_minute(config.api.rate_limit_per_minute);
        Self {
            pool,
            config: Arc::new(config),
            llm,
            runner: Arc::new(runner),
            processor: Arc::new(processor),
            reader,
            validator: UrlValidator::new(),
            limiter: Arc::new(limiter),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("rate limit exceeded")]
    RateLimited,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to clients.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(e) = &self {
            error!(target: "api", error = %format!("{e:#}"), "request failed");
        }
        let body = Json(json!({ "error": self.public_message() }));
        (self.status(), body).into_response()
    }
}

impl From<UrlRejection> for ApiError {
    fn from(e: UrlRejection) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<OpmlError> for ApiError {
    fn from(e: OpmlError) -> Self {
        match e {
            OpmlError::Malformed(_) => ApiError::BadRequest(e.to_string()),
            OpmlError::InvalidUrl(r) => r.into(),
            OpmlError::Storage(e) => ApiError::Internal(e),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/cron/scrape", post(cron::scrape))
        .route("/api/cron/process", post(cron::process))
        .route("/api/agent/signals", get(agent::list_signals))
        .route("/api/agent/signals/{id}", get(agent::get_signal))
        .route("/api/agent/signals/{id}/read", post(agent::mark_read))
        .route("/api/agent/signals/{id}/favorite", post(agent::set_favorite))
        .route("/api/agent/feed", get(agent::feed))
        .route("/api/agent/sources", get(agent::list_sources))
        .route(
            "/api/agent/sources/{id}/subscribe",
            post(agent::subscribe).delete(agent::unsubscribe),
        )
        .route("/api/agent/rss", post(agent::add_rss))
        .route("/api/agent/rss/{id}", delete(agent::delete_rss))
        .route("/api/agent/opml", post(agent::import_opml))
        .route("/api/agent/reader", get(agent::reader))
        .route("/api/mcp", post(mcp::handle))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}
