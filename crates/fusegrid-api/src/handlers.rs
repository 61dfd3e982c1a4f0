//! REST API handlers.
//!
//! Each handler calls one `GroupMapper` operation and wraps the result in
//! the response envelope.

use std::collections::BTreeSet;
use std::path::PathBuf;

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fuse_core::{DeploymentHandle, DesiredSetup, GroupKey, TaskName};
use fusegrid_mapper::{MapperError, Transition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, warn};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn mapper_error(e: MapperError) -> Response {
    let status = match &e {
        MapperError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        MapperError::InvalidBundle(_) | MapperError::InvalidSetup(_) | MapperError::Core(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        MapperError::DeployFailure { .. } | MapperError::DeleteFailure { .. } | MapperError::Driver(_) => {
            StatusCode::BAD_GATEWAY
        }
        MapperError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, status = status.as_u16(), "API request failed");
    } else {
        warn!(error = %e, status = status.as_u16(), "API request rejected");
    }
    error_response(&e.to_string(), status)
}

fn task_name(raw: &str) -> Result<TaskName, Response> {
    TaskName::parse(raw).map_err(|e| error_response(&e.to_string(), StatusCode::UNPROCESSABLE_ENTITY))
}

fn rejected(rejection: JsonRejection) -> Response {
    error_response(&rejection.body_text(), rejection.status())
}

// ── Tasks ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TaskSummary {
    pub task: TaskName,
    pub group: Option<GroupKey>,
    pub content_hash: String,
}

/// What the read endpoint answers: where a task runs right now.
#[derive(Debug, Serialize)]
pub struct TaskLocation {
    pub task: TaskName,
    pub group: GroupKey,
    pub members: BTreeSet<TaskName>,
    pub handle: Option<DeploymentHandle>,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Bundle directory on the control plane's filesystem.
    pub path: PathBuf,
}

/// GET /api/v1/tasks
pub async fn list_tasks(State(state): State<ApiState>) -> Response {
    let setup = state.mapper.setup().await;
    let tasks: Vec<TaskSummary> = state
        .mapper
        .tasks()
        .await
        .into_iter()
        .map(|t| TaskSummary {
            group: setup.group_of(&t.name).map(|g| g.key.clone()),
            task: t.name,
            content_hash: t.content_hash,
        })
        .collect();
    ApiResponse::ok(tasks).into_response()
}

/// GET /api/v1/tasks/{name}
pub async fn get_task(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let name = match task_name(&name) {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match state.mapper.get(&name).await {
        Ok(group) => ApiResponse::ok(TaskLocation {
            task: name,
            group: group.key,
            members: group.members,
            handle: group.handle,
        })
        .into_response(),
        Err(e) => mapper_error(e),
    }
}

/// PUT /api/v1/tasks/{name}
pub async fn deploy_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Response {
    let name = match task_name(&name) {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    let Json(req) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    match state.mapper.deploy_from_path(name, &req.path).await {
        Ok(group) => ApiResponse::ok(group).into_response(),
        Err(e) => mapper_error(e),
    }
}

/// DELETE /api/v1/tasks/{name}
pub async fn delete_task(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let name = match task_name(&name) {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match state.mapper.delete(&name).await {
        Ok(()) => ApiResponse::ok("deleted").into_response(),
        Err(e) => mapper_error(e),
    }
}

/// POST /api/v1/tasks/{name}/invoke
///
/// The body is the payload; an empty body invokes with `null`.
pub async fn invoke_task(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let name = match task_name(&name) {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => return error_response(&format!("invalid JSON payload: {e}"), StatusCode::BAD_REQUEST),
        }
    };
    match state.mapper.invoke(&name, payload).await {
        Ok(result) => ApiResponse::ok(result).into_response(),
        Err(e) => mapper_error(e),
    }
}

/// GET /api/v1/tasks/{name}/info
pub async fn task_info(State(state): State<ApiState>, Path(name): Path<String>) -> Response {
    let name = match task_name(&name) {
        Ok(name) => name,
        Err(resp) => return resp,
    };
    match state.mapper.describe(&name).await {
        Ok(info) => ApiResponse::ok(info).into_response(),
        Err(e) => mapper_error(e),
    }
}

// ── Groups and setup ───────────────────────────────────────────

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.mapper.list().await).into_response()
}

#[derive(Debug, Serialize)]
pub struct SetupView {
    pub partition: DesiredSetup,
    pub transition: Option<Transition>,
}

/// GET /api/v1/setup
pub async fn get_setup(State(state): State<ApiState>) -> Response {
    let view = SetupView {
        partition: state.mapper.setup().await.partition(),
        transition: state.mapper.transition().await,
    };
    ApiResponse::ok(view).into_response()
}

/// PUT /api/v1/setup
pub async fn update_setup(
    State(state): State<ApiState>,
    body: Result<Json<DesiredSetup>, JsonRejection>,
) -> Response {
    let Json(desired) = match body {
        Ok(body) => body,
        Err(rejection) => return rejected(rejection),
    };
    match state.mapper.update(desired).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => mapper_error(e),
    }
}
