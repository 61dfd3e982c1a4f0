//! Startup recovery: rebuild the in-memory setup from what is deployed.
//!
//! The platform is the only durable record of the setup. Each deployed
//! group carries the membership it was built with; bundles are reloaded
//! from the tasks directory. A task claimed by several groups (an update
//! interrupted between deploy and delete) belongs to the newest one.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use fuse_core::{FusionGroup, FusionSetup, GroupKey, GroupStatus, Task, TaskName};
use tracing::{info, warn};

use crate::error::MapperResult;
use crate::mapper::GroupMapper;
use crate::report::RecoveryReport;

impl GroupMapper {
    /// Replace the in-memory state with the groups found on the platform.
    pub async fn recover(&self, tasks_dir: &Path) -> MapperResult<RecoveryReport> {
        let _guard = self.reconcile.lock().await;
        let mut report = RecoveryReport::default();

        let mut listed = self.driver.list().await?;
        listed.sort_by(|a, b| {
            b.deployed_at
                .cmp(&a.deployed_at)
                .then_with(|| a.handle.name.cmp(&b.handle.name))
        });
        info!(functions = listed.len(), tasks_dir = %tasks_dir.display(), "Recovering fusion setup");

        // Newest group first: each task goes to the first group claiming it.
        let mut registry: BTreeMap<TaskName, Task> = BTreeMap::new();
        let mut claims: Vec<BTreeSet<TaskName>> = Vec::with_capacity(listed.len());
        for function in &listed {
            let mut claimed = BTreeSet::new();
            for member in &function.members {
                if registry.contains_key(member) || report.dropped_tasks.contains(member) {
                    continue;
                }
                match fuse_pack::load_task(member.clone(), &tasks_dir.join(member.as_str())) {
                    Ok(task) => {
                        registry.insert(member.clone(), task);
                        claimed.insert(member.clone());
                    }
                    Err(e) => {
                        warn!(task = %member, function = %function.handle.name, error = %e, "Dropping task without a usable bundle");
                        report.dropped_tasks.insert(member.clone());
                    }
                }
            }
            claims.push(claimed);
        }

        let mut setup = FusionSetup::new();
        let mut needs_rebuild = false;
        for (function, claimed) in listed.iter().zip(claims) {
            if claimed.is_empty() {
                match self.driver.delete(&function.handle).await {
                    Ok(()) => {
                        info!(function = %function.handle.name, "Deleted residue group");
                        report.residue_deleted.insert(function.handle.name.clone());
                    }
                    Err(e) => {
                        warn!(function = %function.handle.name, error = %e, "Residue group could not be deleted");
                        report.residue_failed.insert(function.handle.name.clone());
                    }
                }
                continue;
            }

            let key = GroupKey::for_members(&claimed);
            let intact = claimed == function.members && key.as_str() == function.handle.name;
            let key = if intact {
                report.adopted.insert(key.clone());
                key
            } else {
                needs_rebuild = true;
                GroupKey::from_raw(function.handle.name.clone())
            };
            setup.insert(FusionGroup {
                key,
                members: claimed,
                status: GroupStatus::Deployed,
                handle: Some(function.handle.clone()),
                digest: None,
            })?;
        }

        info!(
            groups = setup.len(),
            tasks = registry.len(),
            adopted = report.adopted.len(),
            "Recovered setup {setup}"
        );
        let partition = setup.partition();
        {
            let mut committed = self.setup.write().await;
            let mut tasks = self.tasks.write().await;
            *committed = setup;
            *tasks = registry;
        }

        if needs_rebuild {
            report.rebuilt = self.update_locked(partition).await?;
        }
        Ok(report)
    }
}
