//! HTTP side of the dispatcher: resolving against the control plane's
//! read endpoint, forwarding to other groups, and the group's own entry
//! point.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use fuse_core::TaskName;
use fusegrid_driver::http::{HOPS_HEADER, InvokeHeaders, TASK_NAME_HEADER, get_json, invoke_group};
use fusegrid_driver::DriverError;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::dispatcher::{Dispatcher, Forwarder, Invocation, ResolvedTask, TaskResolver};
use crate::error::{DispatchError, DispatchResult};

/// Asks the control plane's `GET /api/v1/tasks/{name}` where a task lives.
pub struct HttpResolver {
    api: String,
    timeout: Duration,
}

impl HttpResolver {
    pub fn new(api: impl Into<String>, timeout: Duration) -> Self {
        Self {
            api: api.into(),
            timeout,
        }
    }
}

#[async_trait]
impl TaskResolver for HttpResolver {
    async fn resolve(&self, task: &TaskName) -> DispatchResult<Option<ResolvedTask>> {
        let path = format!("/api/v1/tasks/{task}");
        let body = get_json(&self.api, &path, self.timeout)
            .await
            .map_err(|source| DispatchError::Resolve {
                task: task.clone(),
                source,
            })?;
        Ok(body.as_ref().and_then(parse_resolved))
    }
}

/// Pull the group and its address out of the read endpoint's envelope.
fn parse_resolved(body: &Value) -> Option<ResolvedTask> {
    if body.get("success").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    let data = body.get("data")?;
    let group = data.get("group")?.as_str()?.to_string();
    let address = data
        .get("handle")
        .and_then(|h| h.get("address"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(ResolvedTask { group, address })
}

/// POSTs invocations to other groups' entry points.
pub struct HttpForwarder {
    server_address: Option<String>,
    timeout: Duration,
}

impl HttpForwarder {
    pub fn new(server_address: Option<String>, timeout: Duration) -> Self {
        Self {
            server_address,
            timeout,
        }
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, address: &str, invocation: &Invocation) -> DispatchResult<Value> {
        let headers = InvokeHeaders {
            task: invocation.task.to_string(),
            server_address: self.server_address.clone(),
            hops: invocation.hops,
        };
        invoke_group(address, &headers, &invocation.payload, self.timeout)
            .await
            .map_err(|source| match source {
                DriverError::Status { status: 404, body, .. } => {
                    DispatchError::unresolvable(&invocation.task, format!("remote group: {body}"))
                }
                source => DispatchError::Forward {
                    task: invocation.task.clone(),
                    source,
                },
            })
    }
}

/// The group's single HTTP handler: `POST /` with the task in `Task-Name`.
pub fn entry_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new().route("/", post(entry)).with_state(dispatcher)
}

async fn entry(
    State(dispatcher): State<Arc<Dispatcher>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let task = match header(&headers, TASK_NAME_HEADER).map(TaskName::parse) {
        Some(Ok(task)) => task,
        Some(Err(e)) => return error(StatusCode::BAD_REQUEST, e.to_string()),
        None => return error(StatusCode::BAD_REQUEST, format!("missing {TASK_NAME_HEADER} header")),
    };
    let hops = match header(&headers, HOPS_HEADER).map(str::parse::<u32>) {
        None => 0,
        Some(Ok(hops)) => hops,
        Some(Err(_)) => return error(StatusCode::BAD_REQUEST, format!("invalid {HOPS_HEADER} header")),
    };
    let payload = match parse_payload(&body) {
        Ok(payload) => payload,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
    };

    debug!(task = %task, hops, "Entry point invoked");
    match dispatcher.dispatch(Invocation { task, payload, hops }).await {
        Ok(value) => Json(value).into_response(),
        Err(e) => {
            let status = status_for(&e);
            warn!(error = %e, status = status.as_u16(), "Dispatch failed");
            error(status, e.to_string())
        }
    }
}

/// Status a group answers a failed dispatch with.
pub(crate) fn status_for(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::TaskUnresolvable { .. } => StatusCode::NOT_FOUND,
        DispatchError::Forward { .. } | DispatchError::Resolve { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn error(status: StatusCode, message: String) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// An empty body is a `null` payload.
fn parse_payload(body: &[u8]) -> serde_json::Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body)
}
