//! The group entry module.
//!
//! Nuclio loads a fused group through [`DISPATCHER_HANDLER`]; the module it
//! names is written next to `routing.json` and `entrypoint.json`, which it
//! reads at import time to bind member handlers.

use std::fs;
use std::path::Path;

use crate::error::FuseResult;
use crate::function::DISPATCHER_HANDLER;

/// File the entry module is written to inside a bundle.
pub const ENTRY_MODULE_FILE: &str = "dispatcher.py";

const ENTRY_MODULE: &str = include_str!("../assets/dispatcher.py");

/// Whether a group of this runtime can be given an entry module.
pub fn supports(runtime: &str) -> bool {
    runtime.starts_with("python")
}

/// Source of the entry module.
pub fn module_source() -> &'static str {
    ENTRY_MODULE
}

pub(crate) fn write(bundle_dir: &Path) -> FuseResult<()> {
    fs::write(bundle_dir.join(ENTRY_MODULE_FILE), ENTRY_MODULE)?;
    Ok(())
}
