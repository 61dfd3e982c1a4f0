//! GroupMapper: the authoritative fusion setup and the reconciliation
//! protocol that moves the platform from one setup to another.
//!
//! Every mutating operation holds the reconcile lock for its whole
//! duration, so at most one reconciliation touches the platform at a time.
//! Reads only take the setup lock long enough to clone.
//!
//! New groups are always deployed before the groups they replace are
//! deleted, so every task stays reachable while the setup changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuse_core::{
    DeploymentHandle, DesiredSetup, FusionGroup, FusionSetup, GroupKey, GroupStatus, Task,
    TaskName,
};
use fuse_pack::{DeployableBundle, Fuser};
use fusegrid_driver::PlatformDriver;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{MapperError, MapperResult};
use crate::report::{TaskInfo, Transition, UpdateReport};

pub struct GroupMapper {
    pub(crate) fuser: Fuser,
    pub(crate) driver: Arc<dyn PlatformDriver>,
    /// Committed setup.
    pub(crate) setup: RwLock<FusionSetup>,
    /// Bundles of every known task.
    pub(crate) tasks: RwLock<BTreeMap<TaskName, Task>>,
    pub(crate) transition: RwLock<Option<Transition>>,
    /// Held for the whole of every mutating operation.
    pub(crate) reconcile: Mutex<()>,
    /// Where uploaded bundles are kept, one directory per task.
    tasks_dir: Option<PathBuf>,
}

impl GroupMapper {
    pub fn new(fuser: Fuser, driver: Arc<dyn PlatformDriver>) -> Self {
        Self {
            fuser,
            driver,
            setup: RwLock::new(FusionSetup::new()),
            tasks: RwLock::new(BTreeMap::new()),
            transition: RwLock::new(None),
            reconcile: Mutex::new(()),
            tasks_dir: None,
        }
    }

    /// Keep uploaded bundles under `dir/<task>`.
    pub fn with_tasks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tasks_dir = Some(dir.into());
        self
    }

    pub fn tasks_dir(&self) -> Option<&Path> {
        self.tasks_dir.as_deref()
    }

    pub fn driver_name(&self) -> &str {
        self.driver.name()
    }

    // ── Reads ─────────────────────────────────────────────────────

    /// The group currently hosting `name`.
    pub async fn get(&self, name: &TaskName) -> MapperResult<FusionGroup> {
        self.setup
            .read()
            .await
            .group_of(name)
            .cloned()
            .ok_or_else(|| MapperError::TaskNotFound(name.clone()))
    }

    pub async fn list(&self) -> Vec<FusionGroup> {
        self.setup.read().await.groups().cloned().collect()
    }

    /// Snapshot of the committed setup.
    pub async fn setup(&self) -> FusionSetup {
        self.setup.read().await.clone()
    }

    /// The reconciliation in progress, if any.
    pub async fn transition(&self) -> Option<Transition> {
        self.transition.read().await.clone()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    pub async fn task(&self, name: &TaskName) -> MapperResult<Task> {
        self.tasks
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| MapperError::TaskNotFound(name.clone()))
    }

    /// Run `name` in whichever group hosts it.
    pub async fn invoke(&self, name: &TaskName, payload: Value) -> MapperResult<Value> {
        let group = self.get(name).await?;
        let handle = handle_of(&group);
        debug!(task = %name, group = %group.key, "Invoking task");
        Ok(self.driver.invoke(&handle, name, payload).await?)
    }

    /// The task, its group and the platform's view of that group.
    pub async fn describe(&self, name: &TaskName) -> MapperResult<TaskInfo> {
        let task = self.task(name).await?;
        let group = self.get(name).await?;
        let handle = handle_of(&group);
        let platform = self.driver.describe(&handle).await?;
        Ok(TaskInfo {
            task,
            group: group.key,
            members: group.members,
            handle: group.handle,
            platform,
        })
    }

    // ── Single-task operations ────────────────────────────────────

    /// Upload the bundle at `path` as task `name` and deploy it.
    ///
    /// With a tasks directory configured the bundle is copied there and
    /// only replaces the previous upload once the deploy succeeded.
    pub async fn deploy_from_path(&self, name: TaskName, path: &Path) -> MapperResult<FusionGroup> {
        let _guard = self.reconcile.lock().await;

        let Some(tasks_dir) = &self.tasks_dir else {
            let task = fuse_pack::load_task(name, path)?;
            return self.deploy_single_locked(task).await;
        };

        std::fs::create_dir_all(tasks_dir)?;
        let incoming = tasks_dir.join(format!("{name}.incoming"));
        let staged = fuse_pack::stage_task(name.clone(), path, &incoming)?;
        let result = self.deploy_single_locked(staged).await;
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&incoming);
            return result;
        }

        // The platform already runs the new bundle; a failed move keeps it
        // in the staging directory, which the registry then points at.
        let dest = tasks_dir.join(name.as_str());
        if let Err(e) = replace_dir(&incoming, &dest) {
            warn!(task = %name, error = %e, "Upload left in {}", incoming.display());
            return result;
        }
        if let Some(task) = self.tasks.write().await.get_mut(&name) {
            task.source_dir = dest;
        }
        result
    }

    /// Deploy a new task as a singleton group, or redeploy the group of an
    /// existing task with the new bundle.
    pub async fn deploy_single(&self, task: Task) -> MapperResult<FusionGroup> {
        let _guard = self.reconcile.lock().await;
        self.deploy_single_locked(task).await
    }

    async fn deploy_single_locked(&self, task: Task) -> MapperResult<FusionGroup> {
        self.fuser.validate(&task)?;

        let current = self.setup.read().await.group_of(&task.name).cloned();
        let mut registry = self.tasks.read().await.clone();
        registry.insert(task.name.clone(), task.clone());

        let members = match &current {
            Some(group) => {
                info!(task = %task.name, group = %group.key, "Updating task content in place");
                group.members.clone()
            }
            None => {
                info!(task = %task.name, "Deploying new task as singleton group");
                BTreeSet::from([task.name.clone()])
            }
        };

        let pending = FusionGroup::new(members)?;
        self.begin_transition([pending.clone()]).await;
        let result = self.build_and_deploy(&pending, &registry).await;
        self.end_transition().await;
        let group = result?;

        // Published under both locks, setup first, so a reader that finds
        // the task also finds its group.
        let mut setup = self.setup.write().await;
        let mut tasks = self.tasks.write().await;
        setup.insert(group.clone())?;
        tasks.insert(task.name.clone(), task);
        Ok(group)
    }

    /// Remove a task, rebuilding the rest of its group without it.
    pub async fn delete(&self, name: &TaskName) -> MapperResult<()> {
        let _guard = self.reconcile.lock().await;

        let group = self
            .setup
            .read()
            .await
            .group_of(name)
            .cloned()
            .ok_or_else(|| MapperError::TaskNotFound(name.clone()))?;
        let old_handle = handle_of(&group);

        if group.members.len() == 1 {
            info!(task = %name, group = %group.key, "Deleting singleton group");
            self.begin_transition([group.clone()]).await;
            self.mark(&group.key, GroupStatus::Deleting).await;
            let deleted = self.driver.delete(&old_handle).await;
            self.end_transition().await;
            deleted.map_err(|source| MapperError::DeleteFailure {
                function: old_handle.name.clone(),
                source,
            })?;
            self.setup.write().await.remove(&group.key);
        } else {
            let mut remaining = group.members.clone();
            remaining.remove(name);
            let pending = FusionGroup::new(remaining)?;
            info!(
                task = %name,
                from = %group.key,
                to = %pending.key,
                "Splitting task out of its group"
            );

            let registry = self.tasks.read().await.clone();
            self.begin_transition([pending.clone(), group.clone()]).await;
            let deployed = self.build_and_deploy(&pending, &registry).await;
            let replacement = match deployed {
                Ok(replacement) => replacement,
                Err(e) => {
                    self.end_transition().await;
                    return Err(e);
                }
            };

            self.mark(&group.key, GroupStatus::Deleting).await;
            if let Err(e) = self.driver.delete(&old_handle).await {
                warn!(group = %group.key, error = %e, "Old group left running after split");
                self.mark(&group.key, GroupStatus::Failed).await;
            }
            self.end_transition().await;

            let mut setup = self.setup.write().await;
            setup.remove(&group.key);
            setup.insert(replacement)?;
        }

        self.tasks.write().await.remove(name);
        if let Some(dir) = &self.tasks_dir {
            let bundle = dir.join(name.as_str());
            if bundle.is_dir() {
                if let Err(e) = std::fs::remove_dir_all(&bundle) {
                    warn!(task = %name, error = %e, "Bundle left in {}", bundle.display());
                }
            }
        }
        info!(task = %name, "Task deleted");
        Ok(())
    }

    // ── Setup updates ─────────────────────────────────────────────

    /// Move to a new partition of the known tasks.
    ///
    /// Groups present in both setups are left alone. New groups are built
    /// and deployed first; the first failure aborts with the committed
    /// setup unchanged and removes the groups already deployed. Old groups
    /// are deleted afterwards, and a failed delete only leaves residue
    /// behind.
    pub async fn update(&self, desired: DesiredSetup) -> MapperResult<UpdateReport> {
        let _guard = self.reconcile.lock().await;
        self.update_locked(desired).await
    }

    pub(crate) async fn update_locked(&self, desired: DesiredSetup) -> MapperResult<UpdateReport> {
        let current = self.setup.read().await.clone();
        let registry = self.tasks.read().await.clone();
        let target = normalize(&desired, &registry)?;

        let mut report = UpdateReport::default();
        let current_keys = current.keys();
        let target_keys: BTreeSet<GroupKey> = target.keys().cloned().collect();
        report.intact = current_keys.intersection(&target_keys).cloned().collect();
        let to_deploy: Vec<&GroupKey> = target_keys.difference(&report.intact).collect();
        let to_delete: Vec<&GroupKey> = current_keys.difference(&report.intact).collect();

        if to_deploy.is_empty() && to_delete.is_empty() {
            debug!(groups = current.len(), "Setup already matches, nothing to do");
            return Ok(report);
        }
        info!(
            intact = report.intact.len(),
            deploy = to_deploy.len(),
            delete = to_delete.len(),
            "Reconciling fusion setup"
        );

        let mut tracked: Vec<FusionGroup> = Vec::new();
        for key in &to_deploy {
            tracked.push(target[*key].clone());
        }
        for key in report.intact.iter().chain(to_delete.iter().copied()) {
            if let Some(group) = current.group(key) {
                tracked.push(group.clone());
            }
        }
        self.begin_transition(tracked).await;

        // Deploy everything new before deleting anything old.
        let mut deployed = Vec::with_capacity(to_deploy.len());
        for key in &to_deploy {
            match self.build_and_deploy(&target[*key], &registry).await {
                Ok(group) => {
                    report.deployed.insert(group.key.clone());
                    deployed.push(group);
                }
                Err(e) => {
                    warn!(
                        group = %key,
                        already_deployed = report.deployed.len(),
                        error = %e,
                        "Update aborted before any delete"
                    );
                    self.roll_back(&deployed).await;
                    self.end_transition().await;
                    return Err(e);
                }
            }
        }

        for key in &to_delete {
            let Some(group) = current.group(key) else {
                continue;
            };
            self.mark(key, GroupStatus::Deleting).await;
            match self.driver.delete(&handle_of(group)).await {
                Ok(()) => {
                    report.deleted.insert((*key).clone());
                }
                Err(e) => {
                    warn!(group = %key, error = %e, "Delete failed, leaving residue");
                    self.mark(key, GroupStatus::Failed).await;
                    report.residue.insert((*key).clone());
                }
            }
        }

        let mut next = FusionSetup::new();
        for key in &report.intact {
            if let Some(group) = current.group(key) {
                next.insert(group.clone())?;
            }
        }
        for group in deployed {
            next.insert(group)?;
        }
        info!(setup = %next, residue = report.residue.len(), "Fusion setup committed");
        *self.setup.write().await = next;
        self.end_transition().await;

        Ok(report)
    }

    // ── Helpers ───────────────────────────────────────────────────

    /// Remove groups an aborted update had already deployed, so the
    /// platform only holds the committed setup again.
    async fn roll_back(&self, deployed: &[FusionGroup]) {
        for group in deployed {
            self.mark(&group.key, GroupStatus::Deleting).await;
            match self.driver.delete(&handle_of(group)).await {
                Ok(()) => info!(group = %group.key, "Rolled back group of aborted update"),
                Err(e) => {
                    warn!(group = %group.key, error = %e, "Group of aborted update left running");
                    self.mark(&group.key, GroupStatus::Failed).await;
                }
            }
        }
    }

    /// Build the bundle for `group` and deploy it under its key.
    async fn build_and_deploy(
        &self,
        group: &FusionGroup,
        registry: &BTreeMap<TaskName, Task>,
    ) -> MapperResult<FusionGroup> {
        self.mark(&group.key, GroupStatus::Deploying).await;
        let bundle = match self.bundle_for(group, registry) {
            Ok(bundle) => bundle,
            Err(e) => {
                self.mark(&group.key, GroupStatus::Failed).await;
                return Err(e);
            }
        };

        let handle = match self.driver.deploy(&bundle).await {
            Ok(handle) => handle,
            Err(source) => {
                self.mark(&group.key, GroupStatus::Failed).await;
                return Err(MapperError::DeployFailure {
                    group: group.key.clone(),
                    source,
                });
            }
        };
        self.mark(&group.key, GroupStatus::Deployed).await;
        info!(group = %group.key, members = %group.member_list(), "Group deployed");

        Ok(FusionGroup {
            key: bundle.key,
            members: bundle.members,
            status: GroupStatus::Deployed,
            handle: Some(handle),
            digest: Some(bundle.digest),
        })
    }

    fn bundle_for(
        &self,
        group: &FusionGroup,
        registry: &BTreeMap<TaskName, Task>,
    ) -> MapperResult<DeployableBundle> {
        let tasks = group
            .members
            .iter()
            .map(|name| {
                registry.get(name).cloned().ok_or_else(|| {
                    MapperError::InvalidSetup(format!("no bundle registered for task {name}"))
                })
            })
            .collect::<MapperResult<Vec<_>>>()?;
        Ok(self.fuser.build(&tasks)?)
    }

    pub(crate) async fn begin_transition(&self, groups: impl IntoIterator<Item = FusionGroup>) {
        let mut transition = Transition::new();
        for group in groups {
            transition.track(group);
        }
        *self.transition.write().await = Some(transition);
    }

    pub(crate) async fn mark(&self, key: &GroupKey, status: GroupStatus) {
        if let Some(transition) = self.transition.write().await.as_mut() {
            transition.set_status(key, status);
        }
    }

    pub(crate) async fn end_transition(&self) {
        *self.transition.write().await = None;
    }
}

/// The handle a committed group is reachable under.
/// Move `from` to `to`, replacing whatever is at `to`.
fn replace_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    if to.exists() {
        std::fs::remove_dir_all(to)?;
    }
    std::fs::rename(from, to)
}

pub(crate) fn handle_of(group: &FusionGroup) -> DeploymentHandle {
    group
        .handle
        .clone()
        .unwrap_or_else(|| DeploymentHandle::new(group.key.as_str()))
}

/// Turn a proposed partition into complete, disjoint groups of known tasks.
///
/// A task named twice is an error. Unknown tasks and groups left empty are
/// dropped. Known tasks the proposal does not mention keep running as
/// singletons.
fn normalize(
    desired: &DesiredSetup,
    registry: &BTreeMap<TaskName, Task>,
) -> MapperResult<BTreeMap<GroupKey, FusionGroup>> {
    let mut seen = BTreeSet::new();
    for name in desired.groups().iter().flatten() {
        if !seen.insert(name) {
            return Err(MapperError::InvalidSetup(format!(
                "task {name} appears in more than one group"
            )));
        }
    }

    let mut groups = BTreeMap::new();
    let mut placed = BTreeSet::new();
    for proposed in desired.groups() {
        let members: BTreeSet<TaskName> = proposed
            .iter()
            .filter(|name| {
                let known = registry.contains_key(*name);
                if !known {
                    warn!(task = %name, "Ignoring unknown task in proposed setup");
                }
                known
            })
            .cloned()
            .collect();
        if members.is_empty() {
            continue;
        }
        placed.extend(members.iter().cloned());
        let group = FusionGroup::new(members)?;
        groups.insert(group.key.clone(), group);
    }

    for name in registry.keys().filter(|name| !placed.contains(*name)) {
        debug!(task = %name, "Task missing from proposed setup, keeping it as a singleton");
        let group = FusionGroup::singleton(name.clone());
        groups.insert(group.key.clone(), group);
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use fusegrid_driver::PlatformEvent;

    #[tokio::test]
    async fn deploy_single_creates_singleton() {
        let fx = Fixture::new(&["taska"]);
        let group = fx.mapper.deploy_single(fx.task("taska")).await.unwrap();

        assert_eq!(group.members, fx.names(&["taska"]));
        assert_eq!(group.status, GroupStatus::Deployed);
        assert!(group.handle.is_some());
        assert_eq!(fx.mapper.get(&fx.name("taska")).await.unwrap().key, group.key);
        assert_eq!(fx.platform.deployed(), BTreeSet::from([group.key.to_string()]));
    }

    #[tokio::test]
    async fn invalid_bundle_never_reaches_platform() {
        let fx = Fixture::new(&["taska"]);
        let broken = fx.broken_task("broken");

        let err = fx.mapper.deploy_single(broken).await.unwrap_err();
        assert!(matches!(err, MapperError::InvalidBundle(_)));
        assert!(fx.platform.events().is_empty());
        assert!(fx.mapper.list().await.is_empty());
    }

    #[tokio::test]
    async fn redeploy_updates_group_in_place() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        fx.mapper
            .update(fx.desired(&[&["taska", "taskb"]]))
            .await
            .unwrap();
        let before = fx.mapper.get(&fx.name("taska")).await.unwrap();
        fx.platform.clear_events();

        let changed = fx.rewrite_task("taska", "return 'v2'");
        let after = fx.mapper.deploy_single(changed).await.unwrap();

        assert_eq!(after.key, before.key);
        assert_eq!(after.members, before.members);
        assert_ne!(after.digest, before.digest);
        assert_eq!(
            fx.platform.events(),
            vec![PlatformEvent::Deploy {
                name: before.key.to_string(),
                members: before.members.clone(),
            }]
        );
    }

    #[tokio::test]
    async fn update_fuses_without_gaps() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        let old: BTreeSet<String> = fx.platform.deployed();
        fx.platform.clear_events();

        let report = fx
            .mapper
            .update(fx.desired(&[&["taska", "taskb"]]))
            .await
            .unwrap();

        let fused = GroupKey::for_members(&fx.names(&["taska", "taskb"]));
        assert_eq!(report.deployed, BTreeSet::from([fused.clone()]));
        assert_eq!(report.deleted.len(), 2);
        assert!(report.residue.is_empty());

        // Deploy strictly precedes every delete.
        let events = fx.platform.events();
        assert!(matches!(&events[0], PlatformEvent::Deploy { name, .. } if name == fused.as_str()));
        let deleted: BTreeSet<String> = events[1..]
            .iter()
            .map(|e| match e {
                PlatformEvent::Delete { name } => name.clone(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(deleted, old);

        let setup = fx.mapper.setup().await;
        assert_eq!(setup.len(), 1);
        assert_eq!(setup.group_of(&fx.name("taskb")).unwrap().key, fused);
    }

    #[tokio::test]
    async fn identical_update_is_a_noop() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        fx.mapper
            .update(fx.desired(&[&["taska", "taskb"]]))
            .await
            .unwrap();
        fx.platform.clear_events();
        let work_before = fx.build_dirs();

        let report = fx
            .mapper
            .update(fx.desired(&[&["taskb", "TaskA"]]))
            .await
            .unwrap();

        assert!(report.is_noop());
        assert_eq!(report.intact.len(), 1);
        assert!(fx.platform.events().is_empty());
        assert_eq!(fx.build_dirs(), work_before);
    }

    #[tokio::test]
    async fn partition_invariant_holds_for_partial_proposals() {
        let fx = Fixture::new(&["taska", "taskb", "taskc"]);
        fx.deploy_all().await;

        // taskc is not mentioned, ghost is unknown, the empty group vanishes.
        let desired = DesiredSetup::from_names([vec!["taska", "taskb", "ghost"], vec![]]).unwrap();
        fx.mapper.update(desired).await.unwrap();

        let setup = fx.mapper.setup().await;
        assert_eq!(setup.task_count(), 3);
        assert_eq!(setup.len(), 2);
        assert_eq!(
            setup.group_of(&fx.name("taskc")).unwrap().members,
            fx.names(&["taskc"])
        );
        assert!(!setup.contains_task(&fx.name("ghost")));
    }

    #[tokio::test]
    async fn duplicate_task_in_proposal_is_rejected() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        fx.platform.clear_events();

        let err = fx
            .mapper
            .update(fx.desired(&[&["taska", "taskb"], &["taska"]]))
            .await
            .unwrap_err();
        assert!(matches!(err, MapperError::InvalidSetup(_)));
        assert!(fx.platform.events().is_empty());
    }

    #[tokio::test]
    async fn failed_deploy_rolls_nothing_forward() {
        let fx = Fixture::new(&["taska", "taskb", "taskc"]);
        fx.deploy_all().await;
        let before = fx.mapper.setup().await;
        fx.platform.clear_events();

        let fused = GroupKey::for_members(&fx.names(&["taskb", "taskc"]));
        fx.platform.fail_deploy(fused.as_str());
        let err = fx
            .mapper
            .update(fx.desired(&[&["taska"], &["taskb", "taskc"]]))
            .await
            .unwrap_err();

        assert!(matches!(err, MapperError::DeployFailure { group, .. } if group == fused));
        assert_eq!(fx.mapper.setup().await, before);
        assert!(
            fx.platform
                .events()
                .iter()
                .all(|e| !matches!(e, PlatformEvent::Delete { .. }))
        );
        assert!(fx.mapper.transition().await.is_none());
    }

    #[tokio::test]
    async fn aborted_update_removes_what_it_deployed() {
        let fx = Fixture::new(&["taska", "taskb", "taskc", "taskd"]);
        fx.deploy_all().await;
        let before = fx.mapper.setup().await;
        let running = fx.platform.deployed();
        fx.platform.clear_events();

        let ab = GroupKey::for_members(&fx.names(&["taska", "taskb"]));
        let cd = GroupKey::for_members(&fx.names(&["taskc", "taskd"]));
        fx.platform.fail_deploy(cd.as_str());
        let err = fx
            .mapper
            .update(fx.desired(&[&["taska", "taskb"], &["taskc", "taskd"]]))
            .await
            .unwrap_err();

        assert!(matches!(err, MapperError::DeployFailure { group, .. } if group == cd));
        assert_eq!(fx.mapper.setup().await, before);
        assert_eq!(fx.platform.deployed(), running);
        assert_eq!(
            fx.platform.events(),
            vec![
                PlatformEvent::Deploy {
                    name: ab.to_string(),
                    members: fx.names(&["taska", "taskb"]),
                },
                PlatformEvent::Deploy {
                    name: cd.to_string(),
                    members: fx.names(&["taskc", "taskd"]),
                },
                PlatformEvent::Delete { name: ab.to_string() },
            ]
        );
        assert!(fx.mapper.transition().await.is_none());
    }

    #[tokio::test]
    async fn failed_rollback_still_reports_the_deploy_failure() {
        let fx = Fixture::new(&["taska", "taskb", "taskc", "taskd"]);
        fx.deploy_all().await;
        let before = fx.mapper.setup().await;

        let ab = GroupKey::for_members(&fx.names(&["taska", "taskb"]));
        let cd = GroupKey::for_members(&fx.names(&["taskc", "taskd"]));
        fx.platform.fail_deploy(cd.as_str());
        fx.platform.fail_delete(ab.as_str());
        let err = fx
            .mapper
            .update(fx.desired(&[&["taska", "taskb"], &["taskc", "taskd"]]))
            .await
            .unwrap_err();

        assert!(matches!(err, MapperError::DeployFailure { group, .. } if group == cd));
        assert_eq!(fx.mapper.setup().await, before);
        assert!(fx.platform.deployed().contains(ab.as_str()));
    }

    #[tokio::test]
    async fn failed_delete_leaves_residue_but_commits() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        let single_a = fx.mapper.get(&fx.name("taska")).await.unwrap().key;
        fx.platform.fail_delete(single_a.as_str());

        let report = fx
            .mapper
            .update(fx.desired(&[&["taska", "taskb"]]))
            .await
            .unwrap();

        assert_eq!(report.residue, BTreeSet::from([single_a.clone()]));
        assert_eq!(report.deleted.len(), 1);
        assert_eq!(fx.mapper.setup().await.len(), 1);
        assert!(fx.platform.deployed().contains(single_a.as_str()));
    }

    #[tokio::test]
    async fn delete_splits_fused_group() {
        let fx = Fixture::new(&["taska", "taskb", "taskc"]);
        fx.deploy_all().await;
        fx.mapper
            .update(fx.desired(&[&["taska", "taskb", "taskc"]]))
            .await
            .unwrap();
        let old = fx.mapper.get(&fx.name("taska")).await.unwrap().key;
        fx.platform.clear_events();

        fx.mapper.delete(&fx.name("taskb")).await.unwrap();

        let rest = GroupKey::for_members(&fx.names(&["taska", "taskc"]));
        let events = fx.platform.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], PlatformEvent::Deploy { name, .. } if name == rest.as_str()));
        assert!(matches!(&events[1], PlatformEvent::Delete { name } if name == old.as_str()));

        assert!(matches!(
            fx.mapper.get(&fx.name("taskb")).await,
            Err(MapperError::TaskNotFound(_))
        ));
        assert_eq!(fx.mapper.get(&fx.name("taskc")).await.unwrap().key, rest);
        assert_eq!(fx.mapper.tasks().await.len(), 2);
    }

    #[tokio::test]
    async fn failed_singleton_delete_keeps_task() {
        let fx = Fixture::new(&["taska"]);
        fx.deploy_all().await;
        let key = fx.mapper.get(&fx.name("taska")).await.unwrap().key;
        fx.platform.fail_delete(key.as_str());

        let err = fx.mapper.delete(&fx.name("taska")).await.unwrap_err();
        assert!(matches!(err, MapperError::DeleteFailure { .. }));
        assert_eq!(fx.mapper.get(&fx.name("taska")).await.unwrap().key, key);
        assert_eq!(fx.mapper.tasks().await.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_is_single_writer_and_visible() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        let before = fx.mapper.setup().await;

        fx.gate.arm();
        let mapper = fx.mapper.clone();
        let desired = fx.desired(&[&["taska", "taskb"]]);
        let update = tokio::spawn(async move { mapper.update(desired).await });
        fx.gate.entered.notified().await;

        let fused = GroupKey::for_members(&fx.names(&["taska", "taskb"]));
        let transition = fx.mapper.transition().await.unwrap();
        assert_eq!(transition.status(&fused), Some(GroupStatus::Deploying));
        assert_eq!(fx.mapper.setup().await, before);

        // A second writer queues behind the first.
        let mapper = fx.mapper.clone();
        let taska = fx.name("taska");
        let delete = tokio::spawn(async move { mapper.delete(&taska).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!delete.is_finished());

        fx.gate.open();
        update.await.unwrap().unwrap();
        delete.await.unwrap().unwrap();

        let setup = fx.mapper.setup().await;
        assert_eq!(setup.partition().0, vec![fx.names(&["taskb"])]);
        assert!(fx.mapper.transition().await.is_none());
    }

    #[tokio::test]
    async fn delete_unknown_task_is_not_found() {
        let fx = Fixture::new(&[]);
        assert!(matches!(
            fx.mapper.delete(&fx.name("nobody")).await,
            Err(MapperError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn invoke_routes_to_hosting_group() {
        let fx = Fixture::new(&["taska", "taskb"]);
        fx.deploy_all().await;
        fx.mapper
            .update(fx.desired(&[&["taska", "taskb"]]))
            .await
            .unwrap();

        let out = fx
            .mapper
            .invoke(&fx.name("taskb"), serde_json::json!({"n": 3}))
            .await
            .unwrap();
        let fused = GroupKey::for_members(&fx.names(&["taska", "taskb"]));
        assert_eq!(out["function"], fused.as_str());
        assert_eq!(out["task"], "taskb");

        let info = fx.mapper.describe(&fx.name("taskb")).await.unwrap();
        assert_eq!(info.group, fused);
        assert_eq!(info.platform.state, "ready");
    }

    #[tokio::test]
    async fn deploy_from_path_stages_bundle() {
        let fx = Fixture::new(&["taska"]);
        let tasks_dir = fx.root().join("tasks");
        let mapper = fx.mapper_with_tasks_dir(&tasks_dir);

        let source = fx.task("taska").source_dir;
        mapper.deploy_from_path(fx.name("taska"), &source).await.unwrap();

        let task = mapper.task(&fx.name("taska")).await.unwrap();
        assert_eq!(task.source_dir, tasks_dir.join("taska"));
        assert!(tasks_dir.join("taska/function.yaml").is_file());
        assert!(!tasks_dir.join("taska.incoming").exists());

        mapper.delete(&fx.name("taska")).await.unwrap();
        assert!(!tasks_dir.join("taska").exists());
    }

    #[tokio::test]
    async fn failed_upload_keeps_previous_bundle() {
        let fx = Fixture::new(&["taska"]);
        let tasks_dir = fx.root().join("tasks");
        let mapper = fx.mapper_with_tasks_dir(&tasks_dir);
        let source = fx.task("taska").source_dir;
        mapper.deploy_from_path(fx.name("taska"), &source).await.unwrap();
        let before = mapper.task(&fx.name("taska")).await.unwrap();

        fx.platform.fail_all_deploys(true);
        let changed = fx.rewrite_task("taska", "return 'v2'");
        assert!(
            mapper
                .deploy_from_path(fx.name("taska"), &changed.source_dir)
                .await
                .is_err()
        );

        let after = mapper.task(&fx.name("taska")).await.unwrap();
        assert_eq!(after, before);
        assert_eq!(fuse_pack::hash_tree(&after.source_dir).unwrap(), before.content_hash);
    }

    #[tokio::test]
    async fn upload_committed_even_if_bundle_cannot_move() {
        let fx = Fixture::new(&["taska"]);
        let tasks_dir = fx.root().join("tasks");
        std::fs::create_dir_all(&tasks_dir).unwrap();
        // A plain file where the bundle directory belongs cannot be replaced.
        std::fs::write(tasks_dir.join("taska"), "not a bundle").unwrap();
        let mapper = fx.mapper_with_tasks_dir(&tasks_dir);

        let source = fx.task("taska").source_dir;
        let group = mapper.deploy_from_path(fx.name("taska"), &source).await.unwrap();

        assert_eq!(mapper.get(&fx.name("taska")).await.unwrap(), group);
        assert_eq!(fx.platform.deployed().len(), 1);
        let task = mapper.task(&fx.name("taska")).await.unwrap();
        assert_eq!(task.source_dir, tasks_dir.join("taska.incoming"));
        assert!(task.source_dir.join("function.yaml").is_file());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn registered_tasks_always_have_a_group() {
        let names: Vec<String> = (0..16).map(|i| format!("task{i}")).collect();
        let raw: Vec<&str> = names.iter().map(String::as_str).collect();
        let fx = Fixture::new(&raw);
        let tasks: Vec<Task> = raw.iter().map(|n| fx.task(n)).collect();

        let mapper = fx.mapper.clone();
        let writer = tokio::spawn(async move {
            for task in tasks {
                mapper.deploy_single(task).await.unwrap();
            }
        });
        while !writer.is_finished() {
            for task in fx.mapper.tasks().await {
                assert!(
                    fx.mapper.get(&task.name).await.is_ok(),
                    "{} registered without a group",
                    task.name
                );
            }
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
        assert_eq!(fx.mapper.list().await.len(), names.len());
    }
}
