//! The single JSON-RPC 2.0 endpoint: `initialize`, `tools/list`,
//! `tools/call` (dispatching by tool name), plus direct methods mirroring
//! the same coordinator operations.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use buildpilot_core::{JobConfig, JobId, Phase};
use serde_json::{Value, json};

use crate::error::{INVALID_PARAMS, PARSE_ERROR, RpcError};
use crate::state::AppState;

const JSONRPC_VERSION: &str = "2.0";

pub async fn handle(State(state): State<AppState>, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => return error_response(Value::Null, PARSE_ERROR, e.to_string()),
    };

    let id = parsed.get("id").cloned().unwrap_or(Value::Null);
    let is_notification = id.is_null();

    let Some(method) = parsed.get("method").and_then(Value::as_str) else {
        return error_response(id, INVALID_PARAMS, "missing \"method\"".to_string());
    };
    let params = parsed.get("params").cloned().unwrap_or(Value::Null);

    let result = dispatch(&state, method, params).await;

    if is_notification {
        return StatusCode::OK.into_response();
    }
    match result {
        Ok(value) => success_response(id, value),
        Err(e) => error_response(id, e.code, e.message),
    }
}

async fn dispatch(state: &AppState, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "initialize" => Ok(initialize_result()),
        "tools/list" => Ok(tools_list_result()),
        "tools/call" => call_tool(state, params).await,
        "submitJob" => submit_job(state, params).await,
        "getStatus" => get_status(state, params).await,
        "getLogs" => get_logs(state, params).await,
        "killJob" => kill_job(state, params).await,
        "cleanup" => cleanup(state, params).await,
        "getHistory" => get_history(state, params).await,
        "purgeFailedJob" => purge_failed_job(state, params).await,
        other => Err(RpcError::method_not_found(other)),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "serverInfo": { "name": "buildpilot", "version": env!("CARGO_PKG_VERSION") },
        "capabilities": { "tools": {} },
    })
}

fn tools_list_result() -> Value {
    json!({ "tools": TOOLS.iter().map(tool_schema).collect::<Vec<_>>() })
}

struct ToolDef {
    name: &'static str,
    description: &'static str,
}

const TOOLS: &[ToolDef] = &[
    ToolDef { name: "submitJob", description: "Submit a container build/test/publish job" },
    ToolDef { name: "getStatus", description: "Get a job's current status" },
    ToolDef { name: "getLogs", description: "Get a job's logs, optionally for one phase" },
    ToolDef { name: "killJob", description: "Cancel a running job" },
    ToolDef { name: "cleanup", description: "Best-effort cleanup of a terminal job's resources" },
    ToolDef { name: "getHistory", description: "List terminal jobs, newest first" },
    ToolDef { name: "purgeFailedJob", description: "Delete a failed job's live record" },
];

fn tool_schema(tool: &ToolDef) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "inputSchema": { "type": "object" },
    })
}

async fn call_tool(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("tools/call requires \"name\""))?;
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

    let outcome = match name {
        "submitJob" => submit_job(state, arguments).await,
        "getStatus" => get_status(state, arguments).await,
        "getLogs" => get_logs(state, arguments).await,
        "killJob" => kill_job(state, arguments).await,
        "cleanup" => cleanup(state, arguments).await,
        "getHistory" => get_history(state, arguments).await,
        "purgeFailedJob" => purge_failed_job(state, arguments).await,
        other => return Err(RpcError::method_not_found(other)),
    };

    Ok(match outcome {
        Ok(value) => json!({
            "content": [{ "type": "text", "text": value.to_string() }],
            "isError": false,
        }),
        Err(e) => json!({
            "content": [{ "type": "text", "text": e.message }],
            "isError": true,
        }),
    })
}

fn require_job_id(params: &Value) -> Result<JobId, RpcError> {
    let raw = params
        .get("job_id")
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params("\"job_id\" is required"))?;
    raw.parse()
        .map_err(|_| RpcError::invalid_params(format!("\"{raw}\" is not a valid job id")))
}

/// Accepts `image_tags` as a list of strings, a JSON-encoded string of a
/// list, or a bare string (treated as a one-element list) before handing
/// the arguments to `JobConfig`'s normal serde deserialization.
fn normalize_image_tags(mut params: Value) -> Value {
    let Some(object) = params.as_object_mut() else {
        return params;
    };
    let Some(tags) = object.get("image_tags").cloned() else {
        return params;
    };
    let normalized = match tags {
        Value::String(s) => match serde_json::from_str::<Vec<String>>(&s) {
            Ok(list) => Value::Array(list.into_iter().map(Value::String).collect()),
            Err(_) => Value::Array(vec![Value::String(s)]),
        },
        other => other,
    };
    object.insert("image_tags".to_string(), normalized);
    params
}

async fn submit_job(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let params = normalize_image_tags(params);
    let config: JobConfig = serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params(format!("invalid job config: {e}")))?;
    let id = state.coordinator.submit_job(config).await?;
    Ok(json!({ "job_id": id.to_string() }))
}

async fn get_status(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let id = require_job_id(&params)?;
    let view = state.coordinator.get_status(id).await?;
    serde_json::to_value(view).map_err(|e| RpcError::new(crate::error::INTERNAL_ERROR, e.to_string()))
}

fn parse_phase(params: &Value) -> Result<Option<Phase>, RpcError> {
    let Some(raw) = params.get("phase").and_then(Value::as_str) else {
        return Ok(None);
    };
    match raw {
        "build" => Ok(Some(Phase::Build)),
        "test" => Ok(Some(Phase::Test)),
        "publish" => Ok(Some(Phase::Publish)),
        other => Err(RpcError::invalid_params(format!(
            "unknown phase \"{other}\", expected build/test/publish"
        ))),
    }
}

async fn get_logs(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let id = require_job_id(&params)?;
    let phase = parse_phase(&params)?;
    let logs = state.coordinator.get_logs(id, phase).await?;
    Ok(json!({ "logs": logs }))
}

async fn kill_job(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let id = require_job_id(&params)?;
    state.coordinator.kill_job(id).await?;
    Ok(json!({ "job_id": id.to_string(), "killed": true }))
}

async fn cleanup(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let id = require_job_id(&params)?;
    state.coordinator.cleanup(id).await?;
    Ok(json!({ "job_id": id.to_string(), "cleaned": true }))
}

async fn purge_failed_job(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let id = require_job_id(&params)?;
    state.coordinator.purge_failed_job(id).await?;
    Ok(json!({ "job_id": id.to_string(), "purged": true }))
}

async fn get_history(state: &AppState, params: Value) -> Result<Value, RpcError> {
    let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(50) as usize;
    let offset = params.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
    let (records, total) = state.coordinator.get_history(limit, offset).await?;
    Ok(json!({ "history": records, "total": total }))
}

fn success_response(id: Value, result: Value) -> Response {
    Json(json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": result })).into_response()
}

fn error_response(id: Value, code: i64, message: String) -> Response {
    Json(json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": { "code": code, "message": message },
    }))
    .into_response()
}

