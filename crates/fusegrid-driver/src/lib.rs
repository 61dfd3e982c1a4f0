//! fusegrid-driver: the seam between the control plane and the
//! function platform.
//!
//! The mapper only ever talks to a [`PlatformDriver`]. Two drivers ship:
//!
//! ```text
//! PlatformDriver
//!   ├── NuctlDriver       (Nuclio, via the nuctl CLI + HTTP invoke)
//!   └── InMemoryPlatform  (records every call, failures injectable)
//! ```

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuse_core::{DeploymentHandle, TaskName};
use fuse_pack::DeployableBundle;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod error;
pub mod http;
pub mod memory;
pub mod nuctl;

pub use error::{DriverError, DriverResult};
pub use memory::{GroupRuntime, InMemoryPlatform, PlatformEvent};
pub use nuctl::NuctlDriver;

/// State of a function as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionStatus {
    /// Platform state string, e.g. `ready`, `building`, `error`.
    pub state: String,
    pub address: Option<String>,
}

/// A group found deployed on the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedFunction {
    pub handle: DeploymentHandle,
    /// Membership the group was built with.
    pub members: BTreeSet<TaskName>,
    pub deployed_at: DateTime<Utc>,
}

/// Deploys, deletes, invokes and inspects fused groups on a platform.
///
/// Every call is a remote side effect and may fail; callers decide how to
/// react. Drivers never retry.
#[async_trait]
pub trait PlatformDriver: Send + Sync {
    /// Driver name, for logs.
    fn name(&self) -> &str;

    /// Deploy (or redeploy in place) a built bundle under its group key.
    async fn deploy(&self, bundle: &DeployableBundle) -> DriverResult<DeploymentHandle>;

    async fn delete(&self, handle: &DeploymentHandle) -> DriverResult<()>;

    /// Run `task` inside the deployed group.
    async fn invoke(
        &self,
        handle: &DeploymentHandle,
        task: &TaskName,
        payload: Value,
    ) -> DriverResult<Value>;

    async fn describe(&self, handle: &DeploymentHandle) -> DriverResult<FunctionStatus>;

    /// Every group this control plane has deployed.
    async fn list(&self) -> DriverResult<Vec<DeployedFunction>>;
}
