//! Mapper error types.

use fuse_core::{CoreError, GroupKey, TaskName};
use fuse_pack::FuseError;
use fusegrid_driver::DriverError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("invalid bundle: {0}")]
    InvalidBundle(#[from] FuseError),

    #[error("deploying group {group} failed: {source}")]
    DeployFailure {
        group: GroupKey,
        #[source]
        source: DriverError,
    },

    #[error("deleting function {function} failed: {source}")]
    DeleteFailure {
        function: String,
        #[source]
        source: DriverError,
    },

    #[error("task not found: {0}")]
    TaskNotFound(TaskName),

    #[error("invalid setup: {0}")]
    InvalidSetup(String),

    #[error("platform error: {0}")]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type MapperResult<T> = Result<T, MapperError>;
