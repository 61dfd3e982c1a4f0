//! Core types shared by the FuseGrid control plane.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BuildConfig, FusionConfig, MergePolicy, OptimizerConfig, PlatformConfig, PlatformKind,
    ScheduleEntry, ServerConfig, StaticScheduleConfig,
};
pub use error::CoreError;
pub use types::*;
