//! Error types for FuseGrid core types and configuration.

use thiserror::Error;

/// Errors raised while constructing core types or loading configuration.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid task name: {0:?} (expected lowercase letters, digits and '-', at most 40 characters)")]
    InvalidTaskName(String),

    #[error("a fusion group needs at least one task")]
    EmptyGroup,

    #[error("task {task} already belongs to group {group}")]
    DuplicateMember { task: String, group: String },

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("failed to parse schedule: {0}")]
    ScheduleParse(#[from] serde_json::Error),
}
