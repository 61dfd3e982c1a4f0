use fuse_core::TaskName;

/// Errors raised while validating or fusing task bundles.
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    #[error("invalid bundle for task {task}: {reason}")]
    InvalidBundle { task: TaskName, reason: String },

    #[error("cannot build an empty group")]
    EmptyGroup,

    #[error("task {0} appears more than once in the group")]
    DuplicateTask(TaskName),

    #[error("tasks declare incompatible runtimes: {0}")]
    IncompatibleRuntimes(String),

    #[error("runtime {0} has no group entry module")]
    UnsupportedRuntime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FuseError {
    pub(crate) fn invalid(task: &TaskName, reason: impl Into<String>) -> Self {
        FuseError::InvalidBundle {
            task: task.clone(),
            reason: reason.into(),
        }
    }
}

pub type FuseResult<T> = Result<T, FuseError>;
