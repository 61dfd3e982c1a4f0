//! Nuclio driver built on the `nuctl` CLI.
//!
//! Deploy, delete and inspection shell out to `nuctl`; invocations go
//! straight to the function's HTTP address.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuse_core::{DeploymentHandle, PlatformConfig, TaskName};
use fuse_pack::DeployableBundle;
use fuse_pack::function::{BUILT_AT_ANNOTATION, GROUP_LABEL, TASKS_ANNOTATION};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{DriverError, DriverResult};
use crate::http::{self, InvokeHeaders};
use crate::{DeployedFunction, FunctionStatus, PlatformDriver};

pub struct NuctlDriver {
    binary: String,
    namespace: Option<String>,
    kubeconfig: Option<String>,
    platform: String,
    registry: Option<String>,
    run_registry: Option<String>,
    server_address: Option<String>,
    invoke_timeout: Duration,
    command_timeout: Duration,
}

impl NuctlDriver {
    /// `server_address` is handed to every group so its dispatcher can
    /// reach the control plane's read endpoint.
    pub fn from_config(config: &PlatformConfig, server_address: Option<String>) -> Self {
        Self {
            binary: "nuctl".to_string(),
            namespace: config.namespace.clone(),
            kubeconfig: config.kubeconfig.clone(),
            platform: config.platform.clone(),
            registry: config.registry.clone(),
            run_registry: config.run_registry.clone(),
            server_address,
            invoke_timeout: Duration::from_secs(config.invoke_timeout_secs),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Check that `nuctl` can be run at all.
    pub async fn connect(self) -> DriverResult<Self> {
        let output = Command::new(&self.binary)
            .arg("version")
            .output()
            .await
            .map_err(|e| DriverError::Unavailable(format!("cannot run {}: {e}", self.binary)))?;
        if !output.status.success() {
            return Err(DriverError::Unavailable(format!(
                "{} version exited with {}",
                self.binary, output.status
            )));
        }
        info!(
            binary = %self.binary,
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "nuctl available"
        );
        Ok(self)
    }

    fn global_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(namespace) = &self.namespace {
            args.extend(["--namespace".to_string(), namespace.clone()]);
        }
        if let Some(kubeconfig) = &self.kubeconfig {
            args.extend(["--kubeconfig".to_string(), kubeconfig.clone()]);
        }
        args.extend(["--platform".to_string(), self.platform.clone()]);
        args
    }

    pub(crate) fn deploy_args(&self, bundle: &DeployableBundle) -> Vec<String> {
        let mut args = vec![
            "deploy".to_string(),
            bundle.key.to_string(),
            "--path".to_string(),
            bundle.dir.display().to_string(),
        ];
        if let Some(registry) = &self.registry {
            args.extend(["--registry".to_string(), registry.clone()]);
        }
        if let Some(run_registry) = &self.run_registry {
            args.extend(["--run-registry".to_string(), run_registry.clone()]);
        }
        args
    }

    async fn run(&self, mut args: Vec<String>) -> DriverResult<String> {
        args.extend(self.global_args());
        let command = format!("{} {}", self.binary, args.join(" "));
        debug!(%command, "Running nuctl");

        let output = tokio::time::timeout(
            self.command_timeout,
            Command::new(&self.binary).args(&args).output(),
        )
        .await
        .map_err(|_| DriverError::Command {
            command: command.clone(),
            message: format!("timed out after {:?}", self.command_timeout),
        })?
        .map_err(|e| DriverError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        Err(failure(command, message))
    }

    async fn address_of(&self, handle: &DeploymentHandle) -> DriverResult<String> {
        if let Some(address) = &handle.address {
            return Ok(address.clone());
        }
        self.describe(handle)
            .await?
            .address
            .ok_or_else(|| DriverError::InvalidResponse(format!("{} has no invocation address", handle.name)))
    }
}

#[async_trait]
impl PlatformDriver for NuctlDriver {
    fn name(&self) -> &str {
        "nuctl"
    }

    async fn deploy(&self, bundle: &DeployableBundle) -> DriverResult<DeploymentHandle> {
        info!(group = %bundle.key, dir = %bundle.dir.display(), "Deploying function");
        self.run(self.deploy_args(bundle)).await?;

        let handle = DeploymentHandle::new(bundle.key.as_str());
        match self.describe(&handle).await {
            Ok(FunctionStatus {
                address: Some(address),
                ..
            }) => Ok(handle.with_address(address)),
            Ok(_) => Ok(handle),
            Err(e) => {
                warn!(group = %bundle.key, error = %e, "Deployed function could not be described");
                Ok(handle)
            }
        }
    }

    async fn delete(&self, handle: &DeploymentHandle) -> DriverResult<()> {
        info!(function = %handle.name, "Deleting function");
        let args = vec!["delete".to_string(), "function".to_string(), handle.name.clone()];
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(DriverError::NotFound(_)) => {
                debug!(function = %handle.name, "Function already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn invoke(
        &self,
        handle: &DeploymentHandle,
        task: &TaskName,
        payload: Value,
    ) -> DriverResult<Value> {
        let address = self.address_of(handle).await?;
        let headers = InvokeHeaders {
            task: task.to_string(),
            server_address: self.server_address.clone(),
            hops: 0,
        };
        debug!(function = %handle.name, %task, %address, "Invoking task");
        http::invoke_group(&address, &headers, &payload, self.invoke_timeout).await
    }

    async fn describe(&self, handle: &DeploymentHandle) -> DriverResult<FunctionStatus> {
        let args = vec![
            "get".to_string(),
            "function".to_string(),
            handle.name.clone(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run(args).await?;
        let doc = parse_documents(&stdout)?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::NotFound(handle.name.clone()))?;
        Ok(parse_status(&doc))
    }

    async fn list(&self) -> DriverResult<Vec<DeployedFunction>> {
        let args = vec![
            "get".to_string(),
            "function".to_string(),
            "--output".to_string(),
            "json".to_string(),
        ];
        let stdout = self.run(args).await?;
        Ok(parse_documents(&stdout)?
            .iter()
            .filter_map(parse_deployed)
            .collect())
    }
}

// ── Output parsing ────────────────────────────────────────────────

/// Messages nuctl prints when the named function does not exist.
const MISSING_FUNCTION: [&str; 2] = ["function not found", "no functions found"];

/// Map a failed nuctl run to an error. Only nuctl's own missing-function
/// messages become `NotFound`; a missing kubeconfig or namespace does not.
fn failure(command: String, message: String) -> DriverError {
    let lower = message.to_ascii_lowercase();
    if MISSING_FUNCTION.iter().any(|m| lower.contains(m)) {
        DriverError::NotFound(message)
    } else {
        DriverError::Command { command, message }
    }
}

/// `nuctl --output json` prints one object, an array, or a stream of
/// objects depending on the version; flatten all of them.
fn parse_documents(stdout: &str) -> DriverResult<Vec<Value>> {
    let mut docs = Vec::new();
    for value in serde_json::Deserializer::from_str(stdout).into_iter::<Value>() {
        match value.map_err(|e| DriverError::InvalidResponse(e.to_string()))? {
            Value::Array(items) => docs.extend(items),
            other => docs.push(other),
        }
    }
    Ok(docs)
}

fn parse_status(doc: &Value) -> FunctionStatus {
    let status = &doc["status"];
    let state = status["state"].as_str().unwrap_or("unknown").to_string();
    let address = status["internalInvocationUrls"][0]
        .as_str()
        .or_else(|| status["externalInvocationUrls"][0].as_str())
        .map(String::from)
        .or_else(|| status["httpPort"].as_u64().filter(|p| *p > 0).map(|p| format!("localhost:{p}")));
    FunctionStatus { state, address }
}

/// A listed function, if it carries this control plane's group label.
fn parse_deployed(doc: &Value) -> Option<DeployedFunction> {
    let metadata = &doc["metadata"];
    metadata["labels"][GROUP_LABEL].as_str()?;
    let name = metadata["name"].as_str()?;

    let annotations = &metadata["annotations"];
    let mut members = BTreeSet::new();
    for raw in annotations[TASKS_ANNOTATION].as_str().unwrap_or_default().split(',') {
        if raw.is_empty() {
            continue;
        }
        match TaskName::parse(raw) {
            Ok(task) => {
                members.insert(task);
            }
            Err(e) => warn!(function = name, error = %e, "Ignoring unparseable member"),
        }
    }
    let deployed_at = annotations[BUILT_AT_ANNOTATION]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH);

    let mut handle = DeploymentHandle::new(name);
    handle.address = parse_status(doc).address;
    Some(DeployedFunction {
        handle,
        members,
        deployed_at,
    })
}
