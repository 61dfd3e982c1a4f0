//! fusegrid-optimizer: periodically asks a fusion strategy for a better
//! partition and hands it to the group mapper.
//!
//! ```text
//! loop {
//!     wait strategy.sleep()        (or stop on shutdown)
//!     current = mapper.setup()
//!     desired = strategy.optimize(current)
//!     mapper.update(desired)       (errors logged, loop continues)
//! }
//! ```
//!
//! The optimizer never touches the platform itself; everything goes
//! through `setup()` and `update()`.

pub mod optimizer;
pub mod strategy;

pub use optimizer::Optimizer;
pub use strategy::{StaticSchedule, Strategy, build_strategy};
