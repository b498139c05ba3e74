//! HTTP transport for the MCP protocol. `POST /mcp` accepts one JSON-RPC
//! request per body and shares [`crate::mcp::dispatch_jsonrpc`] with the
//! stdio transport. Session correlation uses the request-supplied
//! `Mcp-Session-Id` header, echoed back verbatim; progress is polled, so
//! there is no server-push channel.

use crate::mcp::dispatch_jsonrpc;
use crate::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Response,
};
use std::sync::Arc;

const SESSION_HEADER: &str = "mcp-session-id";

#[derive(Clone)]
pub struct HttpContext {
    pub state: Arc<AppState>,
}

// ---------------------------------------------------------------------------
// POST /mcp
// ---------------------------------------------------------------------------

pub async fn handle_mcp_post(
    State(ctx): State<HttpContext>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let session_id =
        headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()).map(|s| s.to_string());

    let parsed: serde_json::Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &rpc_error(serde_json::Value::Null, "invalid_argument", "parse error"),
                session_id.as_deref(),
            );
        }
    };
    if parsed.is_array() {
        return json_response(
            StatusCode::BAD_REQUEST,
            &rpc_error(
                serde_json::Value::Null,
                "invalid_argument",
                "batch requests are not supported; send one request per body",
            ),
            session_id.as_deref(),
        );
    }

    match dispatch_jsonrpc(&ctx.state, &parsed).await {
        Some(response) => json_response(StatusCode::OK, &response, session_id.as_deref()),
        // Notification: acknowledged with no body.
        None => Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())
            .unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn handle_health(State(ctx): State<HttpContext>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "folders": ctx.state.registry.list().len(),
    }))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn rpc_error(id: serde_json::Value, code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

fn json_response(
    status: StatusCode,
    body: &serde_json::Value,
    session_id: Option<&str>,
) -> Response {
    let mut builder = Response::builder().status(status).header("content-type", "application/json");
    if let Some(session_id) = session_id {
        builder = builder.header(SESSION_HEADER, session_id);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_default()
}
