//! Hook execution engine.
//!
//! - [`subprocess`]: spawning hooks, draining their output, signals.
//! - [`runner`]: runs a single hook and resolves its records.
//! - [`reconciler`]: terminates and finalizes background hooks at shutdown.
//! - [`dependencies`]: the [`DependencyGate`] seam and the search-path gate.
//! - [`orchestrator`]: [`download`], which runs a whole set of plugins
//!   against one URL.

pub mod dependencies;
pub mod error;
pub mod orchestrator;
pub mod reconciler;
pub mod runner;
pub mod subprocess;

pub use dependencies::{check_plugin_dependencies, DependencyGate, EnvGate};
pub use error::PipelineError;
pub use orchestrator::{download, Download, DownloadOptions, DownloadReport, SkipReason, SkippedPlugin};
pub use reconciler::BackgroundReconciler;
pub use runner::{run_hook, BackgroundHook, HookOutcome};
