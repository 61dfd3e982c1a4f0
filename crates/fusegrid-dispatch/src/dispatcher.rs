//! The group-side dispatcher.
//!
//! Every built group has one entry point. Calls for a member run in
//! process; calls for anything else are looked up against the control
//! plane and forwarded once to whichever group hosts the task now.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fuse_core::{RoutingManifest, TaskName};
use fuse_pack::EntryPoint;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{DispatchError, DispatchResult};

/// One call into the group.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub task: TaskName,
    pub payload: Value,
    /// Redirects already taken on the way here.
    pub hops: u32,
}

impl Invocation {
    pub fn new(task: TaskName, payload: Value) -> Self {
        Self {
            task,
            payload,
            hops: 0,
        }
    }
}

/// A member task's code, bound in process.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: TaskContext<'_>, payload: Value) -> DispatchResult<Value>;
}

/// Handed to a running handler so it can call other tasks.
pub struct TaskContext<'a> {
    dispatcher: &'a Dispatcher,
    task: TaskName,
}

impl TaskContext<'_> {
    /// The task being run.
    pub fn task(&self) -> &TaskName {
        &self.task
    }

    pub fn group(&self) -> &str {
        self.dispatcher.manifest.group.as_str()
    }

    /// Call another task. Members of this group never leave the process.
    pub fn invoke(&self, task: TaskName, payload: Value) -> BoxFuture<'_, DispatchResult<Value>> {
        let dispatcher = self.dispatcher;
        Box::pin(async move { dispatcher.dispatch(Invocation::new(task, payload)).await })
    }
}

/// Where a non-local task currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub group: String,
    pub address: Option<String>,
}

/// Looks up the current group of a task.
#[async_trait]
pub trait TaskResolver: Send + Sync {
    async fn resolve(&self, task: &TaskName) -> DispatchResult<Option<ResolvedTask>>;
}

/// Sends an invocation to another group.
#[async_trait]
pub trait Forwarder: Send + Sync {
    async fn forward(&self, address: &str, invocation: &Invocation) -> DispatchResult<Value>;
}

/// Handlers by entry (`<task>/<module>:<function>`).
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(entry.into(), handler);
    }

    pub fn with(mut self, entry: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.register(entry, handler);
        self
    }

    /// Bind entries nothing was registered for to `handler`.
    pub fn with_fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Resolve every task of an entry point to its handler.
    pub fn bind(&self, entrypoint: &EntryPoint) -> DispatchResult<BTreeMap<TaskName, Arc<dyn TaskHandler>>> {
        entrypoint
            .tasks
            .iter()
            .map(|(task, entry)| {
                self.handlers
                    .get(entry)
                    .or(self.fallback.as_ref())
                    .map(|h| (task.clone(), h.clone()))
                    .ok_or_else(|| DispatchError::MissingHandler {
                        task: task.clone(),
                        entry: entry.clone(),
                    })
            })
            .collect()
    }
}

pub struct Dispatcher {
    manifest: RoutingManifest,
    local: BTreeMap<TaskName, Arc<dyn TaskHandler>>,
    resolver: Arc<dyn TaskResolver>,
    forwarder: Arc<dyn Forwarder>,
}

impl Dispatcher {
    pub fn new(
        manifest: RoutingManifest,
        handlers: &HandlerRegistry,
        resolver: Arc<dyn TaskResolver>,
        forwarder: Arc<dyn Forwarder>,
    ) -> DispatchResult<Self> {
        let local = handlers.bind(&EntryPoint::for_manifest(&manifest))?;
        debug!(group = %manifest.group, tasks = local.len(), "Dispatcher ready");
        Ok(Self {
            manifest,
            local,
            resolver,
            forwarder,
        })
    }

    /// Build from a bundle directory produced by the fuser.
    pub fn from_bundle(
        dir: &Path,
        handlers: &HandlerRegistry,
        resolver: Arc<dyn TaskResolver>,
        forwarder: Arc<dyn Forwarder>,
    ) -> DispatchResult<Self> {
        let manifest = fuse_pack::load_manifest(dir)?;
        Self::new(manifest, handlers, resolver, forwarder)
    }

    pub fn manifest(&self) -> &RoutingManifest {
        &self.manifest
    }

    pub async fn dispatch(&self, invocation: Invocation) -> DispatchResult<Value> {
        let Invocation { task, payload, hops } = invocation;

        if let Some(handler) = self.local.get(&task) {
            debug!(task = %task, group = %self.manifest.group, "Running task locally");
            let ctx = TaskContext {
                dispatcher: self,
                task: task.clone(),
            };
            return handler.call(ctx, payload).await.map_err(|e| match e {
                DispatchError::Handler { .. } => e,
                other => DispatchError::handler(&task, other.to_string()),
            });
        }

        if hops >= 1 {
            warn!(task = %task, hops, "Redirected task is not local here");
            return Err(DispatchError::unresolvable(&task, "already redirected once"));
        }

        let Some(resolved) = self.resolver.resolve(&task).await? else {
            return Err(DispatchError::unresolvable(&task, "unknown to the control plane"));
        };
        if resolved.group == self.manifest.group.as_str() || resolved.group == self.manifest.handle {
            return Err(DispatchError::unresolvable(
                &task,
                "resolves to this group but is not a member",
            ));
        }
        let Some(address) = resolved.address else {
            return Err(DispatchError::unresolvable(
                &task,
                format!("group {} has no address", resolved.group),
            ));
        };

        debug!(task = %task, to = %resolved.group, %address, "Forwarding task");
        let forwarded = Invocation {
            task,
            payload,
            hops: hops + 1,
        };
        self.forwarder.forward(&address, &forwarded).await
    }
}
