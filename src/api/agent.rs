// src/api/agent.rs
//! Agent REST handlers. The `*_op` functions are shared with the MCP tools.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::auth::{
    authorize, READER_USE, SIGNALS_READ, SIGNALS_WRITE, SOURCES_READ, SOURCES_WRITE,
};
use super::{ApiError, ApiResult, AppState};
use crate::db::signals::{self, SignalQuery};
use crate::db::sources::{self, DeleteOutcome};
use crate::db::subscriptions;
use crate::ingest::opml::{self, ImportReport};
use crate::models::{Signal, Source, SignalView, SubscribedSource, UserSignal, UserSource};
use crate::reader::ReaderMode;

const DEFAULT_COLUMN_SIZE: i64 = 20;

// ------------------------------------------------------------
// Operations
// ------------------------------------------------------------

pub async fn list_signals_op(
    state: &AppState,
    user_id: i64,
    q: &SignalQuery,
) -> ApiResult<Vec<SignalView>> {
    if q.limit.is_some_and(|l| l < 1) || q.offset.is_some_and(|o| o < 0) {
        return Err(ApiError::BadRequest("limit must be >= 1 and offset >= 0".into()));
    }
    let rows =
        signals::query_for_user(&state.pool, user_id, q, state.config.api.max_page_size).await?;
    Ok(rows)
}

pub async fn get_signal_op(state: &AppState, user_id: i64, id: i64) -> ApiResult<SignalView> {
    signals::view_for_user(&state.pool, user_id, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("signal {id} not found")))
}

async fn existing_signal(state: &AppState, id: i64) -> ApiResult<Signal> {
    signals::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("signal {id} not found")))
}

async fn existing_source(state: &AppState, id: i64) -> ApiResult<Source> {
    sources::get(&state.pool, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("source {id} not found")))
}

pub async fn list_sources_op(state: &AppState, user_id: i64) -> ApiResult<Vec<SubscribedSource>> {
    Ok(sources::list_for_user(&state.pool, user_id).await?)
}

pub async fn subscribe_op(state: &AppState, user_id: i64, source_id: i64) -> ApiResult<UserSource> {
    let src = existing_source(state, source_id).await?;
    if !src.is_active {
        return Err(ApiError::Conflict(format!("source {source_id} is inactive")));
    }
    Ok(subscriptions::subscribe(&state.pool, user_id, source_id).await?)
}

pub async fn unsubscribe_op(state: &AppState, user_id: i64, source_id: i64) -> ApiResult<Value> {
    existing_source(state, source_id).await?;
    let changed = subscriptions::unsubscribe(&state.pool, user_id, source_id).await?;
    Ok(json!({ "sourceId": source_id, "unsubscribed": changed }))
}

#[derive(Debug, Deserialize)]
pub struct AddRssBody {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRssResponse {
    pub source: Source,
    pub created: bool,
    pub subscribed: bool,
}

pub async fn add_rss_op(state: &AppState, user_id: i64, body: &AddRssBody) -> ApiResult<AddRssResponse> {
    if body.url.trim().is_empty() {
        return Err(ApiError::BadRequest("url is required".into()));
    }
    let added = opml::add_feed(
        &state.pool,
        &state.validator,
        user_id,
        body.url.trim(),
        body.name.as_deref(),
        None,
    )
    .await?;
    info!(
        target: "api",
        user_id,
        source_id = added.source.id,
        created = added.created,
        "rss source added"
    );
    Ok(AddRssResponse {
        source: added.source,
        created: added.created,
        subscribed: added.newly_subscribed,
    })
}

pub async fn delete_rss_op(state: &AppState, user_id: i64, source_id: i64) -> ApiResult<Value> {
    let src = existing_source(state, source_id).await?;
    if !sources::is_feed_type(src.source_type) {
        return Err(ApiError::BadRequest(format!("source {source_id} is not a feed")));
    }
    match sources::delete_owned(&state.pool, source_id, user_id).await? {
        DeleteOutcome::Deleted => {
            info!(target: "api", user_id, source_id, "rss source deleted");
            Ok(json!({ "deleted": true, "sourceId": source_id }))
        }
        DeleteOutcome::NotFound => Err(ApiError::NotFound(format!("source {source_id} not found"))),
        DeleteOutcome::BuiltIn => Err(ApiError::Forbidden("built-in sources cannot be deleted".into())),
        DeleteOutcome::NotOwner => Err(ApiError::Forbidden("source belongs to another user".into())),
    }
}

// ------------------------------------------------------------
// Handlers
// ------------------------------------------------------------

pub async fn list_signals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<SignalQuery>,
) -> ApiResult<Json<Vec<SignalView>>> {
    let key = authorize(&state, &headers, SIGNALS_READ).await?;
    Ok(Json(list_signals_op(&state, key.user_id, &q).await?))
}

pub async fn get_signal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<SignalView>> {
    let key = authorize(&state, &headers, SIGNALS_READ).await?;
    Ok(Json(get_signal_op(&state, key.user_id, id).await?))
}

pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserSignal>> {
    let key = authorize(&state, &headers, SIGNALS_WRITE).await?;
    existing_signal(&state, id).await?;
    Ok(Json(subscriptions::set_read(&state.pool, key.user_id, id, true).await?))
}

#[derive(Debug, Deserialize)]
pub struct FavoriteBody {
    pub favorited: bool,
}

pub async fn set_favorite(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(body): Json<FavoriteBody>,
) -> ApiResult<Json<UserSignal>> {
    let key = authorize(&state, &headers, SIGNALS_WRITE).await?;
    existing_signal(&state, id).await?;
    Ok(Json(
        subscriptions::set_favorite(&state.pool, key.user_id, id, body.favorited).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct FeedColumn {
    pub source: Source,
    pub signals: Vec<SignalView>,
}

/// One column per enabled subscription, in the user's display order.
pub async fn feed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<FeedQuery>,
) -> ApiResult<Json<Vec<FeedColumn>>> {
    let key = authorize(&state, &headers, SIGNALS_READ).await?;
    let per_column = q
        .limit
        .unwrap_or(DEFAULT_COLUMN_SIZE)
        .clamp(1, state.config.api.max_page_size.max(1));

    let mut columns = Vec::new();
    for sub in subscriptions::list_enabled(&state.pool, key.user_id).await? {
        let Some(source) = sources::get(&state.pool, sub.source_id).await? else {
            continue;
        };
        if !source.is_active {
            continue;
        }
        let signals =
            signals::latest_for_source(&state.pool, key.user_id, source.id, per_column).await?;
        columns.push(FeedColumn { source, signals });
    }
    Ok(Json(columns))
}

pub async fn list_sources(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<SubscribedSource>>> {
    let key = authorize(&state, &headers, SOURCES_READ).await?;
    Ok(Json(list_sources_op(&state, key.user_id).await?))
}

pub async fn subscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<UserSource>> {
    let key = authorize(&state, &headers, SOURCES_WRITE).await?;
    Ok(Json(subscribe_op(&state, key.user_id, id).await?))
}

pub async fn unsubscribe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let key = authorize(&state, &headers, SOURCES_WRITE).await?;
    Ok(Json(unsubscribe_op(&state, key.user_id, id).await?))
}

pub async fn add_rss(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AddRssBody>,
) -> ApiResult<(StatusCode, Json<AddRssResponse>)> {
    let key = authorize(&state, &headers, SOURCES_WRITE).await?;
    let resp = add_rss_op(&state, key.user_id, &body).await?;
    let status = if resp.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(resp)))
}

pub async fn delete_rss(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let key = authorize(&state, &headers, SOURCES_WRITE).await?;
    Ok(Json(delete_rss_op(&state, key.user_id, id).await?))
}

/// Raw OPML document in the body.
pub async fn import_opml(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ImportReport>> {
    let key = authorize(&state, &headers, SOURCES_WRITE).await?;
    if body.trim().is_empty() {
        return Err(ApiError::BadRequest("empty OPML body".into()));
    }
    let report = opml::import_opml(&state.pool, &state.validator, key.user_id, &body).await?;
    info!(
        target: "api",
        user_id = key.user_id,
        created = report.created,
        subscribed = report.subscribed,
        skipped = report.skipped,
        errors = report.errors.len(),
        "opml imported"
    );
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ReaderQuery {
    pub url: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// SSE: `data: {"text": ...}` deltas, then `data: [DONE]` or one
/// `data: {"error": ...}`.
pub async fn reader(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<ReaderQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    authorize(&state, &headers, READER_USE).await?;
    let mode = match q.mode.as_deref() {
        None | Some("") => ReaderMode::Summary,
        Some(m) => m
            .parse::<ReaderMode>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
    };
    state.validator.validate(&q.url)?;

    let events = state
        .reader
        .stream(q.url, mode)
        .map(|ev| Ok::<Event, Infallible>(Event::default().data(ev.data())));
    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    ))
}
