//! `function.yaml` loading and merging.
//!
//! Each member bundle carries a Nuclio function spec. A fused group is
//! deployed with one merged spec whose handler is the dispatcher.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use fuse_core::{GroupKey, MergePolicy, TaskName};
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{FuseError, FuseResult};
use crate::quantity::Quantity;

pub const FUNCTION_FILE: &str = "function.yaml";

/// Handler every fused group is deployed with.
pub const DISPATCHER_HANDLER: &str = "dispatcher:handler";

pub const GROUP_LABEL: &str = "fusegrid/group";
pub const TASKS_ANNOTATION: &str = "fusegrid/tasks";
pub const BUILT_AT_ANNOTATION: &str = "fusegrid/built-at";

/// A member's validated function spec.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: TaskName,
    pub handler_module: String,
    pub handler_function: String,
    pub runtime: Option<String>,
    doc: Mapping,
}

impl TaskSpec {
    /// Read and validate `function.yaml` from a task bundle.
    pub fn load(name: &TaskName, dir: &Path) -> FuseResult<Self> {
        let path = dir.join(FUNCTION_FILE);
        if !path.is_file() {
            return Err(FuseError::invalid(name, format!("missing {FUNCTION_FILE}")));
        }
        let content = fs::read_to_string(&path)?;
        let parsed: Value = serde_yaml::from_str(&content)
            .map_err(|e| FuseError::invalid(name, format!("{FUNCTION_FILE} does not parse: {e}")))?;
        let Value::Mapping(doc) = parsed else {
            return Err(FuseError::invalid(name, format!("{FUNCTION_FILE} is not a mapping")));
        };

        let spec = doc
            .get("spec")
            .and_then(Value::as_mapping)
            .ok_or_else(|| FuseError::invalid(name, "missing spec section"))?;
        let handler = spec
            .get("handler")
            .and_then(Value::as_str)
            .ok_or_else(|| FuseError::invalid(name, "missing spec.handler"))?;
        let (module, function) = handler
            .split_once(':')
            .filter(|(m, f)| !m.is_empty() && !f.is_empty() && !f.contains(':'))
            .ok_or_else(|| {
                FuseError::invalid(name, format!("handler {handler:?} is not module:function"))
            })?;

        if !has_module(dir, module)? {
            return Err(FuseError::invalid(
                name,
                format!("handler module {module:?} not found in bundle"),
            ));
        }

        let runtime = spec.get("runtime").and_then(Value::as_str).map(String::from);

        Ok(Self {
            name: name.clone(),
            handler_module: module.to_string(),
            handler_function: function.to_string(),
            runtime,
            doc,
        })
    }

    /// Member handler as addressed inside the fused bundle.
    pub fn entry(&self) -> String {
        format!("{}/{}:{}", self.name, self.handler_module, self.handler_function)
    }

    fn metadata(&self) -> Option<&Mapping> {
        self.doc.get("metadata").and_then(Value::as_mapping)
    }

    fn spec(&self) -> Option<&Mapping> {
        self.doc.get("spec").and_then(Value::as_mapping)
    }
}

fn has_module(dir: &Path, module: &str) -> FuseResult<bool> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.file_stem().is_some_and(|stem| stem == module) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// The runtime shared by all members, if any declares one.
pub(crate) fn common_runtime(specs: &[TaskSpec]) -> FuseResult<Option<String>> {
    let declared: BTreeSet<&str> = specs.iter().filter_map(|s| s.runtime.as_deref()).collect();
    if declared.len() > 1 {
        let detail: Vec<String> = specs
            .iter()
            .filter_map(|s| s.runtime.as_ref().map(|r| format!("{}={r}", s.name)))
            .collect();
        return Err(FuseError::IncompatibleRuntimes(detail.join(", ")));
    }
    Ok(declared.into_iter().next().map(String::from))
}

// ── Merge ─────────────────────────────────────────────────────────

/// Merge member specs (sorted by name) into one group spec.
///
/// The result carries no timestamp; see [`stamp_built_at`].
pub(crate) fn merge(specs: &[TaskSpec], key: &GroupKey, policy: MergePolicy) -> FuseResult<Mapping> {
    let runtime = common_runtime(specs)?;
    let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();

    let mut doc = Mapping::new();
    for member in specs {
        for (k, v) in &member.doc {
            if matches!(k.as_str(), Some("metadata" | "spec")) || doc.contains_key(k) {
                continue;
            }
            doc.insert(k.clone(), v.clone());
        }
    }

    // metadata
    let mut metadata = Mapping::new();
    metadata.insert("name".into(), key.as_str().into());
    let mut labels = Mapping::new();
    let mut annotations = Mapping::new();
    for member in specs {
        let Some(meta) = member.metadata() else {
            continue;
        };
        for (k, v) in meta {
            match k.as_str() {
                Some("name") => {}
                Some("labels") => union_first_wins(&mut labels, v),
                Some("annotations") => union_first_wins(&mut annotations, v),
                _ => {
                    if !metadata.contains_key(k) {
                        metadata.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }
    labels.insert(GROUP_LABEL.into(), key.as_str().into());
    annotations.insert(TASKS_ANNOTATION.into(), names.join(",").into());
    metadata.insert("labels".into(), Value::Mapping(labels));
    metadata.insert("annotations".into(), Value::Mapping(annotations));

    // spec
    let mut spec = Mapping::new();
    spec.insert("handler".into(), DISPATCHER_HANDLER.into());
    if let Some(runtime) = runtime {
        spec.insert("runtime".into(), runtime.into());
    }
    spec.insert(
        "description".into(),
        format!("Fusion Group of Tasks [{}]", names.join(", ")).into(),
    );

    for member in specs {
        let Some(member_spec) = member.spec() else {
            continue;
        };
        for (k, v) in member_spec {
            let Some(field) = k.as_str() else {
                continue;
            };
            match field {
                "handler" | "runtime" | "description" => {}
                "build" => merge_build(slot(&mut spec, field), v),
                "env" => merge_env(&member.name, slot_seq(&mut spec, field), v)?,
                "triggers" => merge_triggers(&member.name, slot(&mut spec, field), v),
                "resources" => merge_resources(&member.name, slot(&mut spec, field), v, policy)?,
                "minReplicas" | "maxReplicas" => {
                    merge_count(&member.name, &mut spec, field, v, policy)?
                }
                _ => {
                    if !spec.contains_key(k) {
                        spec.insert(k.clone(), v.clone());
                    }
                }
            }
        }
    }

    doc.insert("metadata".into(), Value::Mapping(metadata));
    doc.insert("spec".into(), Value::Mapping(spec));
    Ok(doc)
}

/// Record the build time on a merged spec.
pub(crate) fn stamp_built_at(doc: &mut Mapping, built_at: &str) {
    let annotations = doc
        .get_mut("metadata")
        .and_then(Value::as_mapping_mut)
        .and_then(|meta| meta.get_mut("annotations"))
        .and_then(Value::as_mapping_mut);
    if let Some(annotations) = annotations {
        annotations.insert(BUILT_AT_ANNOTATION.into(), built_at.into());
    }
}

fn slot<'a>(map: &'a mut Mapping, field: &str) -> &'a mut Mapping {
    let value = map
        .entry(field.into())
        .or_insert(Value::Mapping(Mapping::new()));
    if !value.is_mapping() {
        *value = Value::Mapping(Mapping::new());
    }
    match value {
        Value::Mapping(inner) => inner,
        _ => unreachable!("slot was just set to a mapping"),
    }
}

fn slot_seq<'a>(map: &'a mut Mapping, field: &str) -> &'a mut Vec<Value> {
    let value = map.entry(field.into()).or_insert(Value::Sequence(Vec::new()));
    if !value.is_sequence() {
        *value = Value::Sequence(Vec::new());
    }
    match value {
        Value::Sequence(inner) => inner,
        _ => unreachable!("slot was just set to a sequence"),
    }
}

fn union_first_wins(dst: &mut Mapping, src: &Value) {
    let Some(src) = src.as_mapping() else {
        return;
    };
    for (k, v) in src {
        if !dst.contains_key(k) {
            dst.insert(k.clone(), v.clone());
        }
    }
}

/// Build commands are unioned in order without repeats; other build
/// settings come from the first member that sets them.
fn merge_build(dst: &mut Mapping, src: &Value) {
    let Some(src) = src.as_mapping() else {
        return;
    };
    for (k, v) in src {
        if k.as_str() == Some("commands") {
            let commands = slot_seq(dst, "commands");
            for command in v.as_sequence().into_iter().flatten() {
                if !commands.contains(command) {
                    commands.push(command.clone());
                }
            }
        } else if !dst.contains_key(k) {
            dst.insert(k.clone(), v.clone());
        }
    }
}

fn merge_env(task: &TaskName, dst: &mut Vec<Value>, src: &Value) -> FuseResult<()> {
    for var in src.as_sequence().into_iter().flatten() {
        let name = var
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| FuseError::invalid(task, "env entry without a name"))?;
        let existing = dst
            .iter()
            .position(|e| e.get("name").and_then(Value::as_str) == Some(name));
        match existing {
            Some(i) if &dst[i] != var => {
                warn!(task = %task, env = name, "conflicting env var, keeping the first member's value");
            }
            Some(_) => {}
            None => dst.push(var.clone()),
        }
    }
    Ok(())
}

fn merge_triggers(task: &TaskName, dst: &mut Mapping, src: &Value) {
    let Some(src) = src.as_mapping() else {
        return;
    };
    for (k, v) in src {
        match dst.get(k) {
            Some(existing) if existing != v => {
                warn!(
                    task = %task,
                    trigger = k.as_str().unwrap_or_default(),
                    "conflicting trigger, keeping the first member's definition"
                );
            }
            Some(_) => {}
            None => {
                dst.insert(k.clone(), v.clone());
            }
        }
    }
}

fn merge_resources(
    task: &TaskName,
    dst: &mut Mapping,
    src: &Value,
    policy: MergePolicy,
) -> FuseResult<()> {
    let Some(src) = src.as_mapping() else {
        return Ok(());
    };
    for (section_key, section) in src {
        let Some(section_name) = section_key.as_str() else {
            continue;
        };
        if !matches!(section_name, "requests" | "limits") {
            if !dst.contains_key(section_key) {
                dst.insert(section_key.clone(), section.clone());
            }
            continue;
        }

        let dst_section = slot(dst, section_name);
        for (resource, value) in section.as_mapping().into_iter().flatten() {
            let label = format!("{section_name}.{}", resource.as_str().unwrap_or_default());
            let incoming = quantity(task, &label, value)?;
            let merged = match dst_section.get(resource) {
                None => value.clone(),
                Some(current) => {
                    let current_q = quantity(task, &label, current)?;
                    match policy {
                        MergePolicy::Max if incoming > current_q => value.clone(),
                        MergePolicy::Max => current.clone(),
                        MergePolicy::Sum => current_q.saturating_add(incoming).render().into(),
                    }
                }
            };
            dst_section.insert(resource.clone(), merged);
        }
    }
    Ok(())
}

fn merge_count(
    task: &TaskName,
    spec: &mut Mapping,
    field: &str,
    value: &Value,
    policy: MergePolicy,
) -> FuseResult<()> {
    let incoming = value
        .as_u64()
        .ok_or_else(|| FuseError::invalid(task, format!("{field} is not a non-negative integer")))?;
    let merged = match spec.get(field).and_then(Value::as_u64) {
        None => incoming,
        Some(current) => match policy {
            MergePolicy::Max => current.max(incoming),
            MergePolicy::Sum => current.saturating_add(incoming),
        },
    };
    spec.insert(field.into(), merged.into());
    Ok(())
}

fn quantity(task: &TaskName, label: &str, value: &Value) -> FuseResult<Quantity> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    };
    Quantity::parse(&text)
        .ok_or_else(|| FuseError::invalid(task, format!("{label} has an unparseable quantity {text:?}")))
}
