//! fuse pack: build one deployable function bundle out of several tasks.
//!
//! A bundle directory holds every member's source tree under its own
//! name, a merged `function.yaml` whose handler is the dispatcher, and
//! the routing manifest plus entry point the dispatcher loads at startup:
//!
//! ```text
//! <work_dir>/<group key>/
//!     function.yaml
//!     dispatcher.py
//!     routing.json
//!     entrypoint.json
//!     taska/...
//!     taskb/...
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fuse_core::{GroupKey, MergePolicy, Route, RoutingManifest, Task, TaskName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

pub mod entry;
pub mod error;
pub mod function;
pub mod hash;
pub mod quantity;

pub use entry::ENTRY_MODULE_FILE;
pub use error::{FuseError, FuseResult};
pub use function::{DISPATCHER_HANDLER, FUNCTION_FILE, TaskSpec};
pub use hash::hash_tree;

pub const MANIFEST_FILE: &str = "routing.json";
pub const ENTRYPOINT_FILE: &str = "entrypoint.json";

/// A built group, ready to hand to a platform driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployableBundle {
    pub key: GroupKey,
    pub dir: PathBuf,
    pub manifest: RoutingManifest,
    pub members: BTreeSet<TaskName>,
    /// SHA-256 over member content hashes and the merged spec.
    pub digest: String,
}

/// Entry-point descriptor: the group's single handler and the member
/// handler each task name is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    pub handler: String,
    pub tasks: BTreeMap<TaskName, String>,
}

impl EntryPoint {
    pub fn for_manifest(manifest: &RoutingManifest) -> Self {
        let tasks = manifest
            .tasks
            .iter()
            .map(|(name, route)| match route {
                Route::Local { entry } => (name.clone(), entry.clone()),
            })
            .collect();
        Self {
            handler: DISPATCHER_HANDLER.to_string(),
            tasks,
        }
    }

    pub fn load(bundle_dir: &Path) -> FuseResult<Self> {
        let content = fs::read(bundle_dir.join(ENTRYPOINT_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Read the routing manifest of a built bundle.
pub fn load_manifest(bundle_dir: &Path) -> FuseResult<RoutingManifest> {
    let content = fs::read(bundle_dir.join(MANIFEST_FILE))?;
    Ok(serde_json::from_slice(&content)?)
}

/// Validate the bundle at `dir` and describe it as a task.
pub fn load_task(name: TaskName, dir: &Path) -> FuseResult<Task> {
    TaskSpec::load(&name, dir)?;
    let content_hash = hash_tree(dir)?;
    debug!(task = %name, dir = %dir.display(), %content_hash, "Loaded task bundle");
    Ok(Task {
        name,
        source_dir: dir.to_path_buf(),
        content_hash,
    })
}

/// Validate the bundle at `src` and copy it to `dest`, replacing whatever
/// was there.
pub fn stage_task(name: TaskName, src: &Path, dest: &Path) -> FuseResult<Task> {
    TaskSpec::load(&name, src)?;
    let same_dir = match (src.canonicalize(), dest.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    };
    if !same_dir {
        if dest.exists() {
            fs::remove_dir_all(dest)?;
        }
        let bytes = hash::copy_tree(src, dest)?;
        debug!(task = %name, dest = %dest.display(), bytes, "Staged task bundle");
    }
    load_task(name, dest)
}

/// Builds fused bundles under a work directory.
#[derive(Debug, Clone)]
pub struct Fuser {
    work_dir: PathBuf,
    policy: MergePolicy,
}

impl Fuser {
    pub fn new(work_dir: impl Into<PathBuf>, policy: MergePolicy) -> Self {
        Self {
            work_dir: work_dir.into(),
            policy,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Check a task bundle without building anything.
    pub fn validate(&self, task: &Task) -> FuseResult<TaskSpec> {
        TaskSpec::load(&task.name, &task.source_dir)
    }

    /// Fuse `tasks` into one bundle at `<work_dir>/<key>`.
    ///
    /// Input order does not matter: the same member set always yields the
    /// same key, digest and files, apart from the build timestamp.
    pub fn build(&self, tasks: &[Task]) -> FuseResult<DeployableBundle> {
        let mut sorted: Vec<&Task> = tasks.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));
        if sorted.is_empty() {
            return Err(FuseError::EmptyGroup);
        }
        if let Some(pair) = sorted.windows(2).find(|w| w[0].name == w[1].name) {
            return Err(FuseError::DuplicateTask(pair[0].name.clone()));
        }

        let members: BTreeSet<TaskName> = sorted.iter().map(|t| t.name.clone()).collect();
        let key = GroupKey::for_members(&members);
        debug!(group = %key, members = members.len(), "Building fusion bundle");

        let specs = sorted
            .iter()
            .map(|t| TaskSpec::load(&t.name, &t.source_dir))
            .collect::<FuseResult<Vec<_>>>()?;
        if let Some(runtime) = function::common_runtime(&specs)?.filter(|r| !entry::supports(r)) {
            return Err(FuseError::UnsupportedRuntime(runtime));
        }
        let mut doc = function::merge(&specs, &key, self.policy)?;

        let manifest = RoutingManifest {
            group: key.clone(),
            handle: key.to_string(),
            tasks: specs
                .iter()
                .map(|s| (s.name.clone(), Route::Local { entry: s.entry() }))
                .collect(),
        };
        let entrypoint = EntryPoint::for_manifest(&manifest);
        let digest = bundle_digest(&sorted, &doc)?;

        let dir = self.work_dir.join(key.as_str());
        if dir.exists() {
            debug!(group = %key, "Removing previous build");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        for task in &sorted {
            hash::copy_tree(&task.source_dir, &dir.join(task.name.as_str()))?;
        }

        let built_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        function::stamp_built_at(&mut doc, &built_at);
        fs::write(dir.join(FUNCTION_FILE), serde_yaml::to_string(&doc)?)?;
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)?;
        fs::write(dir.join(ENTRYPOINT_FILE), serde_json::to_vec_pretty(&entrypoint)?)?;
        entry::write(&dir)?;

        info!(group = %key, %digest, dir = %dir.display(), "Fusion bundle built");

        Ok(DeployableBundle {
            key,
            dir,
            manifest,
            members,
            digest,
        })
    }
}

fn bundle_digest(tasks: &[&Task], merged: &serde_yaml::Mapping) -> FuseResult<String> {
    let mut hasher = Sha256::new();
    for task in tasks {
        hasher.update(task.name.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(task.content_hash.as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(serde_yaml::to_string(merged)?.as_bytes());
    hasher.update(entry::module_source().as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
