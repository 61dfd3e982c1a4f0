//! In-process platform: keeps deployed groups in memory and records every
//! call in order, so callers can assert on the exact sequence of side
//! effects. Deploy and delete failures can be injected per function.
//!
//! Without a [`GroupRuntime`] an invocation is echoed back. With one, each
//! deployed bundle is loaded into the runtime and invocations run its code.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuse_core::{DeploymentHandle, TaskName};
use fuse_pack::{DeployableBundle, FUNCTION_FILE};
use serde_json::{Value, json};
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::{DeployedFunction, FunctionStatus, PlatformDriver};

/// One recorded platform call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformEvent {
    Deploy { name: String, members: BTreeSet<TaskName> },
    Delete { name: String },
    Invoke { name: String, task: TaskName },
}

impl PlatformEvent {
    pub fn name(&self) -> &str {
        match self {
            PlatformEvent::Deploy { name, .. }
            | PlatformEvent::Delete { name }
            | PlatformEvent::Invoke { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
struct Function {
    members: BTreeSet<TaskName>,
    digest: String,
    deployed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct State {
    functions: BTreeMap<String, Function>,
    events: Vec<PlatformEvent>,
    fail_deploy: BTreeSet<String>,
    fail_delete: BTreeSet<String>,
    fail_all_deploys: bool,
}

/// Runs the code of groups deployed on an [`InMemoryPlatform`].
#[async_trait]
pub trait GroupRuntime: Send + Sync {
    /// Load a bundle under `name`, replacing any earlier load.
    fn start(&self, name: &str, bundle: &DeployableBundle) -> DriverResult<()>;

    fn stop(&self, name: &str);

    async fn invoke(&self, name: &str, task: &TaskName, payload: Value) -> DriverResult<Value>;
}

#[derive(Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
    runtime: Option<Arc<dyn GroupRuntime>>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run deployed bundles in `runtime` instead of echoing invocations.
    pub fn with_runtime(mut self, runtime: Arc<dyn GroupRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every call so far, oldest first. Failed calls are recorded too.
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.state().events.clone()
    }

    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Names of the functions currently deployed.
    pub fn deployed(&self) -> BTreeSet<String> {
        self.state().functions.keys().cloned().collect()
    }

    pub fn members_of(&self, name: &str) -> Option<BTreeSet<TaskName>> {
        self.state().functions.get(name).map(|f| f.members.clone())
    }

    /// Digest of the bundle last deployed under `name`.
    pub fn digest_of(&self, name: &str) -> Option<String> {
        self.state().functions.get(name).map(|f| f.digest.clone())
    }

    /// Make deploys of `name` fail until cleared.
    pub fn fail_deploy(&self, name: impl Into<String>) {
        self.state().fail_deploy.insert(name.into());
    }

    pub fn fail_all_deploys(&self, fail: bool) {
        self.state().fail_all_deploys = fail;
    }

    /// Make deletes of `name` fail until cleared.
    pub fn fail_delete(&self, name: impl Into<String>) {
        self.state().fail_delete.insert(name.into());
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_deploy.clear();
        state.fail_delete.clear();
        state.fail_all_deploys = false;
    }

    /// Place a function on the platform without recording a call, as if a
    /// previous control plane had deployed it.
    pub fn seed(&self, name: impl Into<String>, members: BTreeSet<TaskName>, deployed_at: DateTime<Utc>) {
        self.state().functions.insert(
            name.into(),
            Function {
                members,
                digest: String::new(),
                deployed_at,
            },
        );
    }
}

#[async_trait]
impl PlatformDriver for InMemoryPlatform {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deploy(&self, bundle: &DeployableBundle) -> DriverResult<DeploymentHandle> {
        let name = bundle.key.to_string();
        let mut state = self.state();
        state.events.push(PlatformEvent::Deploy {
            name: name.clone(),
            members: bundle.members.clone(),
        });

        if state.fail_all_deploys || state.fail_deploy.contains(&name) {
            return Err(DriverError::Injected(format!("deploy of {name}")));
        }
        if !bundle.dir.join(FUNCTION_FILE).is_file() {
            return Err(DriverError::InvalidResponse(format!(
                "{} has no {FUNCTION_FILE}",
                bundle.dir.display()
            )));
        }
        if let Some(runtime) = &self.runtime {
            runtime.start(&name, bundle)?;
        }

        state.functions.insert(
            name.clone(),
            Function {
                members: bundle.members.clone(),
                digest: bundle.digest.clone(),
                deployed_at: Utc::now(),
            },
        );
        debug!(function = %name, "Deployed in memory");
        Ok(DeploymentHandle::new(name.clone()).with_address(format!("memory://{name}")))
    }

    async fn delete(&self, handle: &DeploymentHandle) -> DriverResult<()> {
        let mut state = self.state();
        state.events.push(PlatformEvent::Delete {
            name: handle.name.clone(),
        });

        if state.fail_delete.contains(&handle.name) {
            return Err(DriverError::Injected(format!("delete of {}", handle.name)));
        }
        state.functions.remove(&handle.name);
        if let Some(runtime) = &self.runtime {
            runtime.stop(&handle.name);
        }
        debug!(function = %handle.name, "Deleted in memory");
        Ok(())
    }

    /// Hands the call to the runtime, or echoes it back: which function
    /// ran which task with what.
    async fn invoke(
        &self,
        handle: &DeploymentHandle,
        task: &TaskName,
        payload: Value,
    ) -> DriverResult<Value> {
        {
            let mut state = self.state();
            state.events.push(PlatformEvent::Invoke {
                name: handle.name.clone(),
                task: task.clone(),
            });

            let function = state
                .functions
                .get(&handle.name)
                .ok_or_else(|| DriverError::NotFound(handle.name.clone()))?;
            if self.runtime.is_none() && !function.members.contains(task) {
                return Err(DriverError::NotFound(format!("{task} in {}", handle.name)));
            }
        }

        if let Some(runtime) = &self.runtime {
            return runtime.invoke(&handle.name, task, payload).await;
        }
        Ok(json!({
            "function": handle.name,
            "task": task,
            "payload": payload,
        }))
    }

    async fn describe(&self, handle: &DeploymentHandle) -> DriverResult<FunctionStatus> {
        let state = self.state();
        if !state.functions.contains_key(&handle.name) {
            return Err(DriverError::NotFound(handle.name.clone()));
        }
        Ok(FunctionStatus {
            state: "ready".to_string(),
            address: Some(format!("memory://{}", handle.name)),
        })
    }

    async fn list(&self) -> DriverResult<Vec<DeployedFunction>> {
        let state = self.state();
        Ok(state
            .functions
            .iter()
            .map(|(name, f)| DeployedFunction {
                handle: DeploymentHandle::new(name.clone()).with_address(format!("memory://{name}")),
                members: f.members.clone(),
                deployed_at: f.deployed_at,
            })
            .collect())
    }
}
