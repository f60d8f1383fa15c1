//! Domain types for the abx-dl hook engine.
//!
//! Everything here is pure: no process spawning and no event log I/O.
//!
//! - [`plugin`]: plugin and hook descriptors.
//! - [`records`]: `Snapshot`, `Process` and `ArchiveResult` log records.
//! - [`language`]: the closed mapping from hook language to interpreter.
//! - [`directives`]: the structured-directive protocol on hook stdout.
//! - [`config`]: shared run configuration and hook environments.
//! - [`output_files`]: output artifact detection.

pub mod config;
pub mod directives;
pub mod error;
pub mod language;
pub mod output_files;
pub mod plugin;
pub mod records;
pub mod types;

pub use error::CoreError;
