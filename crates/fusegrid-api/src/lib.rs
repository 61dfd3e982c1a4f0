//! fusegrid-api: REST API for FuseGrid.
//!
//! Thin axum layer over the [`GroupMapper`]. Every response uses the
//! `{ success, data, error }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/tasks` | List tasks with their group |
//! | PUT | `/api/v1/tasks/{name}` | Upload and deploy a task bundle |
//! | GET | `/api/v1/tasks/{name}` | Where a task runs (read endpoint) |
//! | DELETE | `/api/v1/tasks/{name}` | Delete a task |
//! | POST | `/api/v1/tasks/{name}/invoke` | Invoke a task |
//! | GET | `/api/v1/tasks/{name}/info` | Task, group and platform status |
//! | GET | `/api/v1/groups` | List fusion groups |
//! | GET | `/api/v1/setup` | Current partition and any in-flight transition |
//! | PUT | `/api/v1/setup` | Move to a new partition |

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use fusegrid_mapper::GroupMapper;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub mapper: Arc<GroupMapper>,
}

/// Build the API router.
pub fn build_router(mapper: Arc<GroupMapper>) -> Router {
    let state = ApiState { mapper };

    let api_routes = Router::new()
        .route("/tasks", get(handlers::list_tasks))
        .route(
            "/tasks/{name}",
            get(handlers::get_task)
                .put(handlers::deploy_task)
                .delete(handlers::delete_task),
        )
        .route("/tasks/{name}/invoke", post(handlers::invoke_task))
        .route("/tasks/{name}/info", get(handlers::task_info))
        .route("/groups", get(handlers::list_groups))
        .route("/setup", get(handlers::get_setup).put(handlers::update_setup))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
