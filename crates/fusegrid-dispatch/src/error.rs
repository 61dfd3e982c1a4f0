use fuse_core::TaskName;
use fuse_pack::FuseError;
use fusegrid_driver::DriverError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Not local, and no other group can take it.
    #[error("task {task} cannot be resolved: {reason}")]
    TaskUnresolvable { task: TaskName, reason: String },

    #[error("no handler registered for {task} ({entry})")]
    MissingHandler { task: TaskName, entry: String },

    #[error("handler for {task} failed: {message}")]
    Handler { task: TaskName, message: String },

    #[error("forwarding {task} failed: {source}")]
    Forward {
        task: TaskName,
        #[source]
        source: DriverError,
    },

    #[error("resolving {task} failed: {source}")]
    Resolve {
        task: TaskName,
        #[source]
        source: DriverError,
    },

    #[error(transparent)]
    Bundle(#[from] FuseError),
}

impl DispatchError {
    pub fn unresolvable(task: &TaskName, reason: impl Into<String>) -> Self {
        Self::TaskUnresolvable {
            task: task.clone(),
            reason: reason.into(),
        }
    }

    pub fn handler(task: &TaskName, message: impl Into<String>) -> Self {
        Self::Handler {
            task: task.clone(),
            message: message.into(),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
