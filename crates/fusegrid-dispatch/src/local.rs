//! In-process group hosting for the in-memory platform.
//!
//! Every deployed bundle gets its own [`Dispatcher`] built from the bundle's
//! routing manifest. Forwarding between groups stays in process: an address
//! `memory://<function>` names the dispatcher loaded under that function.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use fuse_core::TaskName;
use fuse_pack::{DeployableBundle, ENTRY_MODULE_FILE};
use fusegrid_driver::{DriverError, DriverResult, GroupRuntime};
use serde_json::{Value, json};
use tracing::debug;

use crate::dispatcher::{
    Dispatcher, Forwarder, HandlerRegistry, Invocation, TaskContext, TaskHandler, TaskResolver,
};
use crate::error::{DispatchError, DispatchResult};
use crate::http::status_for;

const ADDRESS_SCHEME: &str = "memory://";

/// Answers with the function, task and payload it was called with.
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    async fn call(&self, ctx: TaskContext<'_>, payload: Value) -> DispatchResult<Value> {
        Ok(json!({
            "function": ctx.group(),
            "task": ctx.task().as_str(),
            "payload": payload,
        }))
    }
}

#[derive(Default)]
struct Groups {
    running: RwLock<BTreeMap<String, Arc<Dispatcher>>>,
    /// `(function, task)` of every invocation forwarded between groups.
    forwarded: Mutex<Vec<(String, TaskName)>>,
}

impl Groups {
    fn get(&self, name: &str) -> Option<Arc<Dispatcher>> {
        self.running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// Runs deployed bundles through their dispatchers.
pub struct LocalRuntime {
    groups: Arc<Groups>,
    handlers: HandlerRegistry,
    resolver: Arc<dyn TaskResolver>,
}

impl LocalRuntime {
    pub fn new(handlers: HandlerRegistry, resolver: Arc<dyn TaskResolver>) -> Self {
        Self {
            groups: Arc::new(Groups::default()),
            handlers,
            resolver,
        }
    }

    /// Functions with a loaded dispatcher.
    pub fn running(&self) -> Vec<String> {
        self.groups
            .running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Invocations forwarded from one group to another, oldest first.
    pub fn forwarded(&self) -> Vec<(String, TaskName)> {
        self.groups
            .forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl GroupRuntime for LocalRuntime {
    fn start(&self, name: &str, bundle: &DeployableBundle) -> DriverResult<()> {
        if !bundle.dir.join(ENTRY_MODULE_FILE).is_file() {
            return Err(DriverError::InvalidResponse(format!(
                "{name} has no entry module {ENTRY_MODULE_FILE}"
            )));
        }

        let forwarder = Arc::new(LocalForwarder {
            groups: Arc::downgrade(&self.groups),
        });
        let dispatcher = Dispatcher::from_bundle(&bundle.dir, &self.handlers, self.resolver.clone(), forwarder)
            .map_err(|e| DriverError::InvalidResponse(format!("{name}: {e}")))?;
        self.groups
            .running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), Arc::new(dispatcher));
        debug!(function = name, "Dispatcher loaded");
        Ok(())
    }

    fn stop(&self, name: &str) {
        self.groups
            .running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    async fn invoke(&self, name: &str, task: &TaskName, payload: Value) -> DriverResult<Value> {
        let dispatcher = self
            .groups
            .get(name)
            .ok_or_else(|| DriverError::NotFound(name.to_string()))?;
        dispatcher
            .dispatch(Invocation::new(task.clone(), payload))
            .await
            .map_err(|e| DriverError::Status {
                uri: format!("{ADDRESS_SCHEME}{name}"),
                status: status_for(&e).as_u16(),
                body: e.to_string(),
            })
    }
}

/// Hands forwarded invocations to the dispatcher loaded at the address.
struct LocalForwarder {
    groups: Weak<Groups>,
}

#[async_trait]
impl Forwarder for LocalForwarder {
    async fn forward(&self, address: &str, invocation: &Invocation) -> DispatchResult<Value> {
        let name = address.strip_prefix(ADDRESS_SCHEME).unwrap_or(address);
        let Some(groups) = self.groups.upgrade() else {
            return Err(DispatchError::unresolvable(&invocation.task, "runtime stopped"));
        };
        let Some(dispatcher) = groups.get(name) else {
            return Err(DispatchError::unresolvable(
                &invocation.task,
                format!("no group at {address}"),
            ));
        };
        groups
            .forwarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.to_string(), invocation.task.clone()));
        dispatcher.dispatch(invocation.clone()).await
    }
}
