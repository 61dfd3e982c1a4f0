//! Shared fixture for mapper tests: task bundles in a temp dir and a
//! mapper over the in-memory platform.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use fuse_core::{DeploymentHandle, DesiredSetup, MergePolicy, Task, TaskName};
use fuse_pack::{DeployableBundle, Fuser};
use fusegrid_driver::{
    DeployedFunction, DriverResult, FunctionStatus, InMemoryPlatform, PlatformDriver,
};
use serde_json::Value;
use tempfile::TempDir;
use tokio::sync::Notify;

use crate::GroupMapper;

pub(crate) struct Fixture {
    dir: TempDir,
    names: Vec<String>,
    pub platform: Arc<InMemoryPlatform>,
    pub gate: Arc<GatedDriver>,
    pub mapper: Arc<GroupMapper>,
}

impl Fixture {
    pub fn new(names: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            write_bundle(&dir.path().join("src").join(name), name, "return 'v1'");
        }
        let platform = Arc::new(InMemoryPlatform::new());
        let gate = Arc::new(GatedDriver::new(platform.clone()));
        let mapper = GroupMapper::new(
            Fuser::new(dir.path().join("build"), MergePolicy::Max),
            gate.clone(),
        );
        Self {
            dir,
            names: names.iter().map(|n| n.to_string()).collect(),
            platform,
            gate,
            mapper: Arc::new(mapper),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Another mapper over the same platform and work dir.
    pub fn fresh_mapper(&self) -> GroupMapper {
        GroupMapper::new(
            Fuser::new(self.root().join("build"), MergePolicy::Max),
            self.platform.clone(),
        )
    }

    pub fn mapper_with_tasks_dir(&self, tasks_dir: &Path) -> GroupMapper {
        self.fresh_mapper().with_tasks_dir(tasks_dir)
    }

    pub fn name(&self, raw: &str) -> TaskName {
        TaskName::parse(raw).unwrap()
    }

    pub fn names(&self, raw: &[&str]) -> BTreeSet<TaskName> {
        raw.iter().map(|n| self.name(n)).collect()
    }

    pub fn task(&self, raw: &str) -> Task {
        fuse_pack::load_task(self.name(raw), &self.root().join("src").join(raw)).unwrap()
    }

    /// A task whose bundle has no `function.yaml`.
    pub fn broken_task(&self, raw: &str) -> Task {
        let dir = self.root().join("broken").join(raw);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("main.py"), "pass\n").unwrap();
        Task {
            name: self.name(raw),
            source_dir: dir,
            content_hash: String::new(),
        }
    }

    /// Change a task's handler body and reload it.
    pub fn rewrite_task(&self, raw: &str, body: &str) -> Task {
        write_bundle(&self.root().join("src").join(raw), raw, body);
        self.task(raw)
    }

    /// Stage a bundle under `tasks_dir/<name>` as an earlier run would have.
    pub fn stage(&self, tasks_dir: &Path, raw: &str) {
        write_bundle(&tasks_dir.join(raw), raw, "return 'v1'");
    }

    pub async fn deploy_all(&self) {
        for name in &self.names {
            self.mapper.deploy_single(self.task(name)).await.unwrap();
        }
    }

    pub fn desired(&self, groups: &[&[&str]]) -> DesiredSetup {
        DesiredSetup::from_names(groups.iter().map(|g| g.iter().copied())).unwrap()
    }

    /// Merged spec of every bundle in the work dir, by directory name.
    pub fn build_dirs(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let Ok(entries) = fs::read_dir(self.root().join("build")) else {
            return out;
        };
        for entry in entries {
            let entry = entry.unwrap();
            let spec = fs::read_to_string(entry.path().join("function.yaml")).unwrap_or_default();
            out.insert(entry.file_name().to_string_lossy().into_owned(), spec);
        }
        out
    }
}

fn write_bundle(dir: &Path, name: &str, body: &str) {
    fs::create_dir_all(dir).unwrap();
    fs::write(
        dir.join("function.yaml"),
        format!("metadata:\n  name: {name}\nspec:\n  runtime: python:3.9\n  handler: main:handler\n"),
    )
    .unwrap();
    fs::write(
        dir.join("main.py"),
        format!("def handler(context, event):\n    {body}\n"),
    )
    .unwrap();
}

/// Platform wrapper that, once armed, parks every deploy until released.
pub(crate) struct GatedDriver {
    inner: Arc<InMemoryPlatform>,
    armed: AtomicBool,
    pub entered: Notify,
    release: Notify,
}

impl GatedDriver {
    fn new(inner: Arc<InMemoryPlatform>) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Disarm and let the parked deploy through.
    pub fn open(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.release.notify_one();
    }
}

#[async_trait]
impl PlatformDriver for GatedDriver {
    fn name(&self) -> &str {
        "gated"
    }

    async fn deploy(&self, bundle: &DeployableBundle) -> DriverResult<DeploymentHandle> {
        if self.armed.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.deploy(bundle).await
    }

    async fn delete(&self, handle: &DeploymentHandle) -> DriverResult<()> {
        self.inner.delete(handle).await
    }

    async fn invoke(
        &self,
        handle: &DeploymentHandle,
        task: &TaskName,
        payload: Value,
    ) -> DriverResult<Value> {
        self.inner.invoke(handle, task, payload).await
    }

    async fn describe(&self, handle: &DeploymentHandle) -> DriverResult<FunctionStatus> {
        self.inner.describe(handle).await
    }

    async fn list(&self) -> DriverResult<Vec<DeployedFunction>> {
        self.inner.list().await
    }
}
