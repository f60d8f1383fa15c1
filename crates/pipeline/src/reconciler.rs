//! Shutdown handling for background hooks.
//!
//! Background hooks keep running while later foreground hooks execute. When
//! iteration ends, [`BackgroundReconciler::cleanup`] stops every one of them
//! and writes each hook's final [`Process`] and [`ArchiveResult`] to the
//! event log:
//!
//! 1. `SIGTERM` is sent to every tracked child that is still running, so
//!    they all shut down in parallel.
//! 2. Each child is then waited on for up to the grace period. A child that
//!    outlives it is killed and recorded as failed.
//!
//! Every tracked hook is finalized and logged exactly once. Errors on one
//! hook are logged and never keep the others from being reconciled.

use std::time::Duration;

use abx_core::records::{ArchiveResult, ArchiveStatus};
use abx_events::IndexWriter;

use crate::runner::{apply_internal_failure, apply_process_outcome, scan_files, BackgroundHook};
use crate::subprocess;

/// How long a background hook gets to exit after `SIGTERM`.
pub const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Diagnostic recorded for a background hook that ignored `SIGTERM`.
pub const TERMINATION_TIMEOUT_DIAGNOSTIC: &str = "Background hook did not exit after SIGTERM";

/// Set of in-flight background hooks for one run.
pub struct BackgroundReconciler {
    tracked: Vec<BackgroundHook>,
    grace: Duration,
}

impl Default for BackgroundReconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundReconciler {
    pub fn new() -> Self {
        Self {
            tracked: Vec::new(),
            grace: TERMINATION_GRACE_PERIOD,
        }
    }

    /// Override the post-`SIGTERM` grace period.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn track(&mut self, hook: BackgroundHook) {
        tracing::debug!(
            plugin = %hook.result.plugin,
            hook = %hook.result.hook_name,
            "Tracking background hook",
        );
        self.tracked.push(hook);
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    /// Terminate and finalize every tracked hook, appending their records to
    /// `log`.
    ///
    /// Returns the final results in tracking order. The tracked set is
    /// drained, so calling this again is a no-op.
    pub async fn cleanup(&mut self, log: &mut IndexWriter) -> Vec<ArchiveResult> {
        let hooks = std::mem::take(&mut self.tracked);
        if hooks.is_empty() {
            return Vec::new();
        }

        tracing::info!(count = hooks.len(), "Stopping background hooks");

        for hook in &hooks {
            match subprocess::terminate(&hook.spawned.child) {
                Ok(true) => {}
                Ok(false) => tracing::debug!(
                    hook = %hook.result.hook_name,
                    "Background hook already exited",
                ),
                Err(e) => tracing::warn!(
                    hook = %hook.result.hook_name,
                    error = %e,
                    "Failed to send SIGTERM to background hook",
                ),
            }
        }

        let mut finished = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let result = self.finalize(hook, log).await;
            finished.push(result);
        }
        finished
    }

    async fn finalize(&self, hook: BackgroundHook, log: &mut IndexWriter) -> ArchiveResult {
        let BackgroundHook {
            mut process,
            mut result,
            spawned,
            output_dir,
        } = hook;
        let subprocess::SpawnedProcess { mut child, output } = spawned;

        let waited = tokio::time::timeout(self.grace, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                let (stdout, stderr) = output.collect().await;
                process.finish(subprocess::exit_code(status), stdout, stderr);
                let files = scan_files(&output_dir).await.into_iter().collect();
                apply_process_outcome(&mut result, &process, files, false);
            }
            Ok(Err(e)) => {
                let (stdout, _) = output.abort();
                process.stdout = stdout;
                result.output_files = scan_files(&output_dir).await.into_iter().collect();
                apply_internal_failure(&mut result, &mut process, e.to_string());
            }
            Err(_elapsed) => {
                tracing::warn!(
                    plugin = %result.plugin,
                    hook = %result.hook_name,
                    grace_secs = self.grace.as_secs(),
                    "Background hook ignored SIGTERM, killing it",
                );
                if let Err(e) = child.kill().await {
                    tracing::debug!(error = %e, "Failed to kill background hook");
                }
                let (stdout, _) = output.abort();
                process.stdout = stdout;
                result.output_files = scan_files(&output_dir).await.into_iter().collect();
                apply_internal_failure(&mut result, &mut process, TERMINATION_TIMEOUT_DIAGNOSTIC.to_string());
            }
        }

        debug_assert!(result.status != ArchiveStatus::Started);
        tracing::info!(
            plugin = %result.plugin,
            hook = %result.hook_name,
            status = %result.status,
            exit_code = ?process.exit_code,
            "Background hook finalized",
        );

        if let Err(e) = log.append(&process).and_then(|()| log.append(&result)) {
            tracing::error!(
                hook = %result.hook_name,
                error = %e,
                "Failed to record background hook result",
            );
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
