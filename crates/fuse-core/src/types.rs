//! Shared types used across FuseGrid crates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Longest accepted task name. Keeps every group key under the
/// 63-character function name limit of the platform.
pub const MAX_TASK_NAME_LEN: usize = 40;

/// Length of the readable prefix of a group key.
const GROUP_PREFIX_LEN: usize = 40;

// ── Task ──────────────────────────────────────────────────────────

/// Case-insensitive task name, stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TaskName(String);

impl TaskName {
    /// Normalize and validate a raw name.
    ///
    /// Valid names are DNS-label shaped: lowercase alphanumerics and `-`,
    /// not starting or ending with `-`.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let name = raw.to_ascii_lowercase();
        let valid = !name.is_empty()
            && name.len() <= MAX_TASK_NAME_LEN
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
            && !name.starts_with('-')
            && !name.ends_with('-');

        if !valid {
            return Err(CoreError::InvalidTaskName(raw.to_string()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for TaskName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for TaskName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TaskName::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A single named unit of user code and its source bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub name: TaskName,
    /// Directory holding the handler code and `function.yaml`.
    pub source_dir: PathBuf,
    /// Hex SHA-256 over the bundle tree.
    pub content_hash: String,
}

// ── Fusion Group ──────────────────────────────────────────────────

/// Deterministic deployment identity of a fusion group.
///
/// Derived from the sorted member names: a readable prefix plus a short
/// hash, so two groups with identical membership always share a key and
/// `{ab, c}` never collides with `{a, bc}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn for_members<'a>(members: impl IntoIterator<Item = &'a TaskName>) -> Self {
        let mut names: Vec<&str> = members.into_iter().map(TaskName::as_str).collect();
        names.sort_unstable();
        names.dedup();

        let mut prefix: String = names.join("-").chars().take(GROUP_PREFIX_LEN).collect();
        while prefix.ends_with('-') {
            prefix.pop();
        }

        let digest = Sha256::digest(names.join("\n").as_bytes());
        Self(format!("{prefix}-{}", &hex::encode(digest)[..8]))
    }

    /// Wrap a key reported by the platform.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform-assigned identity of a deployed group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentHandle {
    /// Function name on the platform (the group key).
    pub name: String,
    /// Invocation address (`host:port`), once the platform reports one.
    pub address: Option<String>,
}

impl DeploymentHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
        }
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// Lifecycle status of a fusion group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Deploying,
    Deployed,
    Deleting,
    Failed,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Deploying => "deploying",
            GroupStatus::Deployed => "deployed",
            GroupStatus::Deleting => "deleting",
            GroupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A non-empty set of tasks deployed as one function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FusionGroup {
    pub key: GroupKey,
    pub members: BTreeSet<TaskName>,
    pub status: GroupStatus,
    pub handle: Option<DeploymentHandle>,
    /// Digest of the last bundle built for this group.
    pub digest: Option<String>,
}

impl FusionGroup {
    pub fn new(members: BTreeSet<TaskName>) -> Result<Self, CoreError> {
        if members.is_empty() {
            return Err(CoreError::EmptyGroup);
        }
        Ok(Self {
            key: GroupKey::for_members(&members),
            members,
            status: GroupStatus::Pending,
            handle: None,
            digest: None,
        })
    }

    pub fn singleton(name: TaskName) -> Self {
        let members = BTreeSet::from([name]);
        Self {
            key: GroupKey::for_members(&members),
            members,
            status: GroupStatus::Pending,
            handle: None,
            digest: None,
        }
    }

    pub fn contains(&self, name: &TaskName) -> bool {
        self.members.contains(name)
    }

    /// Members rendered as `[a, b]` for logs and descriptions.
    pub fn member_list(&self) -> String {
        let names: Vec<&str> = self.members.iter().map(TaskName::as_str).collect();
        format!("[{}]", names.join(", "))
    }
}

// ── Fusion Setup ──────────────────────────────────────────────────

/// A partition of all known tasks into disjoint fusion groups.
///
/// Every task is indexed to exactly one group; `insert` refuses a group
/// that would place a task in two groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusionSetup {
    groups: BTreeMap<GroupKey, FusionGroup>,
    #[serde(skip)]
    index: BTreeMap<TaskName, GroupKey>,
}

impl FusionSetup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a group, replacing any group stored under the same key.
    pub fn insert(&mut self, group: FusionGroup) -> Result<(), CoreError> {
        for member in &group.members {
            if let Some(owner) = self.index.get(member)
                && owner != &group.key
            {
                return Err(CoreError::DuplicateMember {
                    task: member.to_string(),
                    group: owner.to_string(),
                });
            }
        }

        self.remove(&group.key);
        for member in &group.members {
            self.index.insert(member.clone(), group.key.clone());
        }
        self.groups.insert(group.key.clone(), group);
        Ok(())
    }

    pub fn remove(&mut self, key: &GroupKey) -> Option<FusionGroup> {
        let group = self.groups.remove(key)?;
        for member in &group.members {
            self.index.remove(member);
        }
        Some(group)
    }

    pub fn group(&self, key: &GroupKey) -> Option<&FusionGroup> {
        self.groups.get(key)
    }

    /// The group currently hosting `task`.
    pub fn group_of(&self, task: &TaskName) -> Option<&FusionGroup> {
        let key = self.index.get(task)?;
        self.groups.get(key)
    }

    pub fn contains_task(&self, task: &TaskName) -> bool {
        self.index.contains_key(task)
    }

    pub fn groups(&self) -> impl Iterator<Item = &FusionGroup> {
        self.groups.values()
    }

    pub fn keys(&self) -> BTreeSet<GroupKey> {
        self.groups.keys().cloned().collect()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskName> {
        self.index.keys()
    }

    pub fn task_count(&self) -> usize {
        self.index.len()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The membership of every group, without deployment state.
    pub fn partition(&self) -> DesiredSetup {
        DesiredSetup(self.groups.values().map(|g| g.members.clone()).collect())
    }
}

impl fmt::Display for FusionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self.groups.values().map(FusionGroup::member_list).collect();
        write!(f, "[{}]", groups.join(", "))
    }
}

/// A proposed partition, as submitted by an optimizer or an operator.
///
/// Serialized as a list of lists of task names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DesiredSetup(pub Vec<BTreeSet<TaskName>>);

impl DesiredSetup {
    pub fn new(groups: Vec<BTreeSet<TaskName>>) -> Self {
        Self(groups)
    }

    /// Build from raw names, validating each one.
    pub fn from_names<I, J, S>(groups: I) -> Result<Self, CoreError>
    where
        I: IntoIterator<Item = J>,
        J: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for group in groups {
            let members = group
                .into_iter()
                .map(|name| TaskName::parse(name.as_ref()))
                .collect::<Result<BTreeSet<_>, _>>()?;
            out.push(members);
        }
        Ok(Self(out))
    }

    pub fn groups(&self) -> &[BTreeSet<TaskName>] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ── Routing Manifest ──────────────────────────────────────────────

/// How the dispatcher of a group reaches a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Route {
    /// In-process: `entry` is the member handler, `<task>/<module>:<function>`.
    Local { entry: String },
}

/// Per-group routing table embedded into every built bundle.
///
/// Lists each member as local; anything absent is resolved live against
/// the mapper's read endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingManifest {
    pub group: GroupKey,
    /// Function name the group is deployed under.
    pub handle: String,
    pub tasks: BTreeMap<TaskName, Route>,
}

impl RoutingManifest {
    pub fn route(&self, task: &TaskName) -> Option<&Route> {
        self.tasks.get(task)
    }

    pub fn is_local(&self, task: &TaskName) -> bool {
        self.tasks.contains_key(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> TaskName {
        TaskName::parse(s).unwrap()
    }

    #[test]
    fn task_names_are_case_insensitive() {
        assert_eq!(name("TaskA"), name("taska"));
        assert_eq!(name("TASK-b").as_str(), "task-b");
    }

    #[test]
    fn rejects_invalid_task_names() {
        for raw in ["", "-a", "a-", "a_b", "a.b", "with space"] {
            assert!(TaskName::parse(raw).is_err(), "{raw:?} should be invalid");
        }
        assert!(TaskName::parse(&"a".repeat(MAX_TASK_NAME_LEN + 1)).is_err());
        assert!(TaskName::parse(&"a".repeat(MAX_TASK_NAME_LEN)).is_ok());
    }

    #[test]
    fn task_name_deserialization_normalizes() {
        let parsed: TaskName = serde_json::from_str("\"TaskA\"").unwrap();
        assert_eq!(parsed.as_str(), "taska");
        assert!(serde_json::from_str::<TaskName>("\"bad_name\"").is_err());
    }

    #[test]
    fn group_key_is_order_independent() {
        let ab = GroupKey::for_members([&name("taska"), &name("taskb")]);
        let ba = GroupKey::for_members([&name("taskb"), &name("taska")]);
        assert_eq!(ab, ba);
        assert!(ab.as_str().starts_with("taska-taskb-"));
    }

    #[test]
    fn group_key_distinguishes_concatenation_collisions() {
        let left = GroupKey::for_members([&name("ab"), &name("c")]);
        let right = GroupKey::for_members([&name("a"), &name("bc")]);
        assert_ne!(left, right);
    }

    #[test]
    fn group_key_fits_platform_name_limit() {
        let members: Vec<TaskName> = (0..10)
            .map(|i| name(&format!("{}{i}", "x".repeat(MAX_TASK_NAME_LEN - 1))))
            .collect();
        let key = GroupKey::for_members(&members);
        assert!(key.as_str().len() <= 63);
        assert!(!key.as_str().contains("--"));
    }

    #[test]
    fn empty_group_is_rejected() {
        assert!(matches!(
            FusionGroup::new(BTreeSet::new()),
            Err(CoreError::EmptyGroup)
        ));
    }

    #[test]
    fn setup_keeps_tasks_in_one_group() {
        let mut setup = FusionSetup::new();
        setup.insert(FusionGroup::singleton(name("taska"))).unwrap();

        let fused = FusionGroup::new(BTreeSet::from([name("taska"), name("taskb")])).unwrap();
        assert!(matches!(
            setup.insert(fused.clone()),
            Err(CoreError::DuplicateMember { .. })
        ));

        let single = setup.group_of(&name("taska")).unwrap().key.clone();
        setup.remove(&single);
        setup.insert(fused.clone()).unwrap();

        assert_eq!(setup.len(), 1);
        assert_eq!(setup.task_count(), 2);
        assert_eq!(setup.group_of(&name("taskb")).unwrap().key, fused.key);
    }

    #[test]
    fn reinserting_same_key_replaces_group() {
        let mut setup = FusionSetup::new();
        let mut group = FusionGroup::singleton(name("taska"));
        setup.insert(group.clone()).unwrap();

        group.status = GroupStatus::Deployed;
        group.handle = Some(DeploymentHandle::new(group.key.as_str()));
        setup.insert(group.clone()).unwrap();

        assert_eq!(setup.len(), 1);
        assert_eq!(setup.group(&group.key).unwrap().status, GroupStatus::Deployed);
    }

    #[test]
    fn partition_round_trips_membership() {
        let mut setup = FusionSetup::new();
        setup
            .insert(FusionGroup::new(BTreeSet::from([name("taska"), name("taskb")])).unwrap())
            .unwrap();
        setup.insert(FusionGroup::singleton(name("taskc"))).unwrap();

        let desired = DesiredSetup::from_names([vec!["taskb", "TaskA"], vec!["taskc"]]).unwrap();
        let mut got = setup.partition().0;
        let mut want = desired.0;
        got.sort();
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn desired_setup_parses_list_of_lists() {
        let desired: DesiredSetup =
            serde_json::from_str(r#"[["taska", "taskb"], ["taskc"]]"#).unwrap();
        assert_eq!(desired.groups().len(), 2);
        assert!(desired.groups()[0].contains(&name("taskb")));
    }

    #[test]
    fn setup_display_lists_groups() {
        let mut setup = FusionSetup::new();
        setup
            .insert(FusionGroup::new(BTreeSet::from([name("taskb"), name("taska")])).unwrap())
            .unwrap();
        assert_eq!(setup.to_string(), "[[taska, taskb]]");
    }
}
