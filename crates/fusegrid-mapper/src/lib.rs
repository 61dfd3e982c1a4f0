//! fusegrid-mapper: the group mapper.
//!
//! Owns the authoritative fusion setup (which task runs in which group)
//! and reconciles the platform towards a requested partition.
//!
//! # Architecture
//!
//! ```text
//! GroupMapper
//!   ├── reconcile lock (one mutating operation at a time)
//!   ├── FusionSetup    (committed groups, read via snapshots)
//!   ├── task registry  (bundle + content hash per task)
//!   ├── Fuser          (build one bundle per group)
//!   └── PlatformDriver (deploy / delete / invoke / list)
//! ```
//!
//! An update plans by group key: groups present on both sides stay
//! untouched, new groups are deployed, then old groups are deleted.

pub mod error;
pub mod mapper;
pub mod recovery;
pub mod report;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{MapperError, MapperResult};
pub use mapper::GroupMapper;
pub use report::{RecoveryReport, TaskInfo, Transition, UpdateReport};
