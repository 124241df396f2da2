// src/api/mcp.rs
//! MCP over JSON-RPC 2.0 (`POST /api/mcp`), exposing agent operations as tools.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::agent::{self, AddRssBody};
use super::auth::{authenticate, require, SIGNALS_READ, SOURCES_READ, SOURCES_WRITE};
use super::{ApiError, AppState};
use crate::db::signals::SignalQuery;
use crate::models::AgentApiKey;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const PERMISSION_DENIED: i64 = -32001;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    jsonrpc: Option<String>,
    /// Absent for notifications.
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

fn reply(id: Value, outcome: Result<Value, RpcError>) -> Response {
    let body = match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err(e) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": e.code, "message": e.message },
        }),
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let key = match authenticate(&state, &headers).await {
        Ok(k) => k,
        Err(e) => return e.into_response(),
    };

    let body: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            debug!(target: "api", error = %e, "mcp body is not json");
            return reply(Value::Null, Err(RpcError::new(PARSE_ERROR, format!("parse error: {e}"))));
        }
    };

    let req: RpcRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => return reply(Value::Null, Err(RpcError::new(INVALID_REQUEST, e.to_string()))),
    };
    if req.jsonrpc.as_deref().is_some_and(|v| v != "2.0") {
        let id = req.id.unwrap_or(Value::Null);
        return reply(id, Err(RpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\"")));
    }
    let Some(id) = req.id else {
        debug!(target: "api", method = %req.method, "mcp notification");
        return StatusCode::ACCEPTED.into_response();
    };

    let outcome = match req.method.as_str() {
        "initialize" => Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "signalboard", "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tool_list() })),
        "tools/call" => call_tool(&state, &key, req.params).await,
        other => Err(RpcError::new(METHOD_NOT_FOUND, format!("method not found: {other}"))),
    };
    reply(id, outcome)
}

struct Tool {
    name: &'static str,
    description: &'static str,
    permission: &'static str,
    schema: fn() -> Value,
}

const TOOLS: &[Tool] = &[
    Tool {
        name: "list_signals",
        description: "List signals from subscribed sources, newest first.",
        permission: SIGNALS_READ,
        schema: || {
            json!({
                "type": "object",
                "properties": {
                    "source_id": { "type": "integer" },
                    "unread": { "type": "boolean" },
                    "favorited": { "type": "boolean" },
                    "q": { "type": "string" },
                    "limit": { "type": "integer", "minimum": 1 },
                    "offset": { "type": "integer", "minimum": 0 }
                }
            })
        },
    },
    Tool {
        name: "get_signal",
        description: "Get one signal by id.",
        permission: SIGNALS_READ,
        schema: || id_schema("id"),
    },
    Tool {
        name: "list_sources",
        description: "List sources with the caller's subscription state.",
        permission: SOURCES_READ,
        schema: || json!({ "type": "object", "properties": {} }),
    },
    Tool {
        name: "subscribe_source",
        description: "Subscribe to a source.",
        permission: SOURCES_WRITE,
        schema: || id_schema("source_id"),
    },
    Tool {
        name: "unsubscribe_source",
        description: "Unsubscribe from a source.",
        permission: SOURCES_WRITE,
        schema: || id_schema("source_id"),
    },
    Tool {
        name: "add_rss_source",
        description: "Add an RSS/Atom feed by URL and subscribe to it.",
        permission: SOURCES_WRITE,
        schema: || {
            json!({
                "type": "object",
                "properties": { "url": { "type": "string" }, "name": { "type": "string" } },
                "required": ["url"]
            })
        },
    },
    Tool {
        name: "delete_rss_source",
        description: "Delete an RSS source the caller created.",
        permission: SOURCES_WRITE,
        schema: || id_schema("source_id"),
    },
];

fn id_schema(field: &str) -> Value {
    json!({
        "type": "object",
        "properties": { field: { "type": "integer" } },
        "required": [field]
    })
}

fn tool_list() -> Vec<Value> {
    TOOLS
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "inputSchema": (t.schema)(),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct IdArg {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SourceIdArg {
    source_id: i64,
}

fn args<T: DeserializeOwned>(arguments: Value) -> Result<T, RpcError> {
    let arguments = if arguments.is_null() {
        json!({})
    } else {
        arguments
    };
    serde_json::from_value(arguments).map_err(|e| RpcError::new(INVALID_PARAMS, e.to_string()))
}

fn to_value<T: serde::Serialize>(v: T) -> Result<Value, ApiError> {
    serde_json::to_value(v).map_err(|e| ApiError::Internal(e.into()))
}

async fn call_tool(state: &AppState, key: &AgentApiKey, params: Value) -> Result<Value, RpcError> {
    let call: CallParams = args(params)?;
    let tool = TOOLS
        .iter()
        .find(|t| t.name == call.name)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("unknown tool: {}", call.name)))?;
    require(key, tool.permission).map_err(|e| RpcError::new(PERMISSION_DENIED, e.to_string()))?;

    let user = key.user_id;
    let result = match tool.name {
        "list_signals" => {
            let q: SignalQuery = args(call.arguments)?;
            agent::list_signals_op(state, user, &q).await.and_then(to_value)
        }
        "get_signal" => {
            let a: IdArg = args(call.arguments)?;
            agent::get_signal_op(state, user, a.id).await.and_then(to_value)
        }
        "list_sources" => agent::list_sources_op(state, user).await.and_then(to_value),
        "subscribe_source" => {
            let a: SourceIdArg = args(call.arguments)?;
            agent::subscribe_op(state, user, a.source_id).await.and_then(to_value)
        }
        "unsubscribe_source" => {
            let a: SourceIdArg = args(call.arguments)?;
            agent::unsubscribe_op(state, user, a.source_id).await
        }
        "add_rss_source" => {
            let a: AddRssBody = args(call.arguments)?;
            agent::add_rss_op(state, user, &a).await.and_then(to_value)
        }
        "delete_rss_source" => {
            let a: SourceIdArg = args(call.arguments)?;
            agent::delete_rss_op(state, user, a.source_id).await
        }
        other => return Err(RpcError::new(INVALID_PARAMS, format!("unknown tool: {other}"))),
    };

    match result {
        Ok(value) => Ok(json!({
            "content": [{ "type": "text", "text": value.to_string() }],
            "structuredContent": value,
        })),
        Err(ApiError::BadRequest(m)) => Err(RpcError::new(INVALID_PARAMS, m)),
        Err(e @ (ApiError::Forbidden(_) | ApiError::Unauthorized(_))) => {
            Err(RpcError::new(PERMISSION_DENIED, e.to_string()))
        }
        Err(ApiError::Internal(e)) => {
            warn!(target: "api", tool = tool.name, error = %format!("{e:#}"), "mcp tool failed");
            Err(RpcError::new(INTERNAL_ERROR, "internal error"))
        }
        // Domain failures (not found, conflict) are tool results, not protocol errors.
        Err(e) => Ok(json!({
            "content": [{ "type": "text", "text": e.to_string() }],
            "isError": true,
        })),
    }
}
