//! Views and reports returned by the mapper.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use fuse_core::{DeploymentHandle, FusionGroup, GroupKey, GroupStatus, Task, TaskName};
use fusegrid_driver::FunctionStatus;
use serde::Serialize;

/// Groups touched by an in-flight reconciliation, with their progress.
///
/// Committed groups are always `deployed`; the other statuses only show up
/// here while the reconcile lock is held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub started_at: DateTime<Utc>,
    pub groups: BTreeMap<GroupKey, FusionGroup>,
}

impl Transition {
    pub(crate) fn new() -> Self {
        Self {
            started_at: Utc::now(),
            groups: BTreeMap::new(),
        }
    }

    pub(crate) fn track(&mut self, group: FusionGroup) {
        self.groups.insert(group.key.clone(), group);
    }

    pub(crate) fn set_status(&mut self, key: &GroupKey, status: GroupStatus) {
        if let Some(group) = self.groups.get_mut(key) {
            group.status = status;
        }
    }

    pub fn status(&self, key: &GroupKey) -> Option<GroupStatus> {
        self.groups.get(key).map(|g| g.status)
    }
}

/// Outcome of an `update`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Groups present before and after, left alone.
    pub intact: BTreeSet<GroupKey>,
    pub deployed: BTreeSet<GroupKey>,
    pub deleted: BTreeSet<GroupKey>,
    /// Old groups whose delete failed; still running on the platform.
    pub residue: BTreeSet<GroupKey>,
}

impl UpdateReport {
    /// True when the update changed nothing on the platform.
    pub fn is_noop(&self) -> bool {
        self.deployed.is_empty() && self.deleted.is_empty() && self.residue.is_empty()
    }
}

/// Where a task lives and what the platform says about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskInfo {
    pub task: Task,
    pub group: GroupKey,
    pub members: BTreeSet<TaskName>,
    pub handle: Option<DeploymentHandle>,
    pub platform: FunctionStatus,
}

/// Outcome of the startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Groups taken over as they were deployed.
    pub adopted: BTreeSet<GroupKey>,
    /// Groups rebuilt because part of their membership was lost.
    pub rebuilt: UpdateReport,
    /// Functions with no surviving member, deleted.
    pub residue_deleted: BTreeSet<String>,
    /// Functions with no surviving member whose delete failed.
    pub residue_failed: BTreeSet<String>,
    /// Members whose bundle could not be loaded.
    pub dropped_tasks: BTreeSet<TaskName>,
}
