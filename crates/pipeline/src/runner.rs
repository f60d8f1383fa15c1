//! Single-hook execution.
//!
//! [`run_hook`] launches one hook against one URL and turns whatever happens
//! into records: a [`Process`] describing the invocation and an
//! [`ArchiveResult`] describing the outcome. It never fails and never writes
//! the event log; the caller persists the records it gets back.
//!
//! Foreground hooks are waited on up to their timeout. Background hooks are
//! given [`BACKGROUND_FAST_FAIL_WINDOW`] to crash; if they are still alive
//! after that they are handed back as a [`BackgroundHook`] for the
//! [`BackgroundReconciler`](crate::reconciler::BackgroundReconciler). The
//! window only short-cuts obvious crashes; reconciliation is what decides a
//! background hook's final status.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use abx_core::config::HookEnv;
use abx_core::directives::declared_result;
use abx_core::language::Language;
use abx_core::output_files;
use abx_core::plugin::Hook;
use abx_core::records::{ArchiveResult, ArchiveStatus, Process};
use abx_core::types::RecordId;

use crate::subprocess::{self, SpawnedProcess};

/// How long a freshly spawned background hook is watched for an immediate
/// exit before it is treated as long-running.
pub const BACKGROUND_FAST_FAIL_WINDOW: Duration = Duration::from_millis(300);

/// Diagnostic recorded when a foreground hook exceeds its timeout.
pub fn timeout_diagnostic(timeout: Duration) -> String {
    format!("Timed out after {}s", timeout.as_secs())
}

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// What running a hook produced.
pub enum HookOutcome {
    /// The hook has exited (or never started); both records are final.
    Finished {
        process: Process,
        result: ArchiveResult,
    },
    /// A background hook that is still running.
    Background(BackgroundHook),
}

impl HookOutcome {
    /// The hook's current result; `started` for a running background hook.
    pub fn result(&self) -> &ArchiveResult {
        match self {
            Self::Finished { result, .. } => result,
            Self::Background(hook) => &hook.result,
        }
    }

    pub fn is_background(&self) -> bool {
        matches!(self, Self::Background(_))
    }
}

/// A live background hook awaiting reconciliation.
///
/// Owns the child process and the `started` records that reconciliation
/// will finalize.
pub struct BackgroundHook {
    pub(crate) process: Process,
    pub(crate) result: ArchiveResult,
    pub(crate) spawned: SpawnedProcess,
    pub(crate) output_dir: PathBuf,
}

impl BackgroundHook {
    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn result(&self) -> &ArchiveResult {
        &self.result
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// OS process id, while the child has not been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.spawned.child.id()
    }
}

// ---------------------------------------------------------------------------
// Status resolution
// ---------------------------------------------------------------------------

/// Resolve a finished hook's status and summary from its exit code and the
/// directives on its stdout.
///
/// The exit code gives the default; an `ArchiveResult` directive overrides
/// it.
pub fn resolve_status(exit_code: i32, stdout: &str) -> (ArchiveStatus, String) {
    let mut status = ArchiveStatus::from_exit_code(exit_code);
    let mut output_str = String::new();
    if let Some(declared) = declared_result(stdout) {
        if let Some(declared_status) = declared.status {
            status = declared_status;
        }
        if let Some(summary) = declared.output_str {
            output_str = summary;
        }
    }
    (status, output_str)
}

/// A clean exit that succeeded without producing any file is a no-op.
pub fn downgrade_empty_success(
    status: ArchiveStatus,
    exit_code: i32,
    new_files: &[String],
) -> ArchiveStatus {
    if exit_code == 0 && status == ArchiveStatus::Succeeded && new_files.is_empty() {
        ArchiveStatus::Skipped
    } else {
        status
    }
}

/// Fill a result from a finalized process: status, summary, files, error.
pub(crate) fn apply_process_outcome(
    result: &mut ArchiveResult,
    process: &Process,
    output_files: Vec<String>,
    downgrade_empty: bool,
) {
    let exit_code = process
        .exit_code
        .unwrap_or(abx_core::records::INTERNAL_FAILURE_EXIT_CODE);
    let (mut status, output_str) = resolve_status(exit_code, &process.stdout);
    if downgrade_empty {
        status = downgrade_empty_success(status, exit_code, &output_files);
    }

    result.status = status;
    result.output_str = output_str;
    result.output_files = output_files;
    result.process_id = Some(process.id);
    result.start_ts = process.started_at;
    result.end_ts = process.ended_at;
    result.error = (exit_code != 0).then(|| abx_core::records::truncate_error(&process.stderr));
}

/// Record an engine-side failure on both records.
pub(crate) fn apply_internal_failure(
    result: &mut ArchiveResult,
    process: &mut Process,
    diagnostic: String,
) {
    process.fail_internal(diagnostic);
    result.status = ArchiveStatus::Failed;
    result.process_id = Some(process.id);
    result.start_ts = process.started_at;
    result.end_ts = process.ended_at;
    result.error = Some(abx_core::records::truncate_error(&process.stderr));
}

/// List the files under `dir` without blocking the runtime.
///
/// Unreadable entries are skipped by the listing itself; only a failed scan
/// task yields an empty set.
pub(crate) async fn scan_files(dir: &Path) -> BTreeSet<String> {
    let dir = dir.to_path_buf();
    match tokio::task::spawn_blocking(move || output_files::list_files(&dir)).await {
        Ok(files) => files,
        Err(e) => {
            tracing::warn!(error = %e, "Output directory scan task failed");
            BTreeSet::new()
        }
    }
}

// ---------------------------------------------------------------------------
// run_hook
// ---------------------------------------------------------------------------

/// Build the command line for a hook.
pub fn hook_command(language: Language, hook: &Hook, url: &str, snapshot_id: RecordId) -> Vec<String> {
    language
        .interpreter()
        .iter()
        .map(|s| s.to_string())
        .chain([
            hook.path.to_string_lossy().into_owned(),
            format!("--url={url}"),
            format!("--snapshot-id={snapshot_id}"),
        ])
        .collect()
}

/// Run one hook against `url`, with `output_dir` as its working directory.
pub async fn run_hook(
    hook: &Hook,
    url: &str,
    snapshot_id: RecordId,
    output_dir: &Path,
    env: &HookEnv,
    timeout: Duration,
) -> HookOutcome {
    let mut result = ArchiveResult::new(
        snapshot_id,
        &hook.plugin_name,
        &hook.name,
        ArchiveStatus::Failed,
    );

    let language = match Language::from_tag(&hook.language) {
        Ok(language) => language,
        Err(e) => {
            tracing::warn!(
                plugin = %hook.plugin_name,
                hook = %hook.name,
                language = %hook.language,
                "Hook language is not supported",
            );
            let mut process = Process::new(Vec::new(), output_dir, timeout.as_secs());
            process.mark_started();
            apply_internal_failure(&mut result, &mut process, e.to_string());
            return HookOutcome::Finished { process, result };
        }
    };

    let files_before = scan_files(output_dir).await;

    let cmd = hook_command(language, hook, url, snapshot_id);
    let mut process = Process::new(cmd, output_dir, timeout.as_secs());
    process.mark_started();

    tracing::info!(
        plugin = %hook.plugin_name,
        hook = %hook.name,
        background = hook.is_background,
        timeout_secs = timeout.as_secs(),
        "Running hook",
    );

    let mut spawned = match subprocess::spawn(&process.cmd, output_dir, env) {
        Ok(spawned) => spawned,
        Err(e) => {
            let diagnostic = format!("Failed to launch {}: {e}", process.cmd[0]);
            tracing::warn!(plugin = %hook.plugin_name, hook = %hook.name, error = %e, "Hook failed to launch");
            apply_internal_failure(&mut result, &mut process, diagnostic);
            return HookOutcome::Finished { process, result };
        }
    };

    if hook.is_background {
        tokio::time::sleep(BACKGROUND_FAST_FAIL_WINDOW).await;
        match spawned.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(
                    plugin = %hook.plugin_name,
                    hook = %hook.name,
                    "Background hook exited within the fast-fail window",
                );
                let (stdout, stderr) = spawned.output.collect().await;
                process.finish(subprocess::exit_code(status), stdout, stderr);
                let after = scan_files(output_dir).await;
                let new_files = output_files::new_files(&files_before, &after);
                apply_process_outcome(&mut result, &process, new_files, true);
                return HookOutcome::Finished { process, result };
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, hook = %hook.name, "Could not poll background hook, tracking it anyway");
            }
        }

        result.status = ArchiveStatus::Started;
        result.process_id = Some(process.id);
        result.start_ts = process.started_at;
        return HookOutcome::Background(BackgroundHook {
            process,
            result,
            spawned,
            output_dir: output_dir.to_path_buf(),
        });
    }

    let waited = tokio::time::timeout(timeout, spawned.child.wait()).await;
    match waited {
        Ok(Ok(status)) => {
            let (stdout, stderr) = spawned.output.collect().await;
            process.finish(subprocess::exit_code(status), stdout, stderr);
            let after = scan_files(output_dir).await;
            let new_files = output_files::new_files(&files_before, &after);
            apply_process_outcome(&mut result, &process, new_files, true);
        }
        Ok(Err(e)) => {
            let (stdout, _) = spawned.output.abort();
            process.stdout = stdout;
            apply_internal_failure(&mut result, &mut process, format!("Failed to wait for hook: {e}"));
        }
        Err(_elapsed) => {
            tracing::warn!(
                plugin = %hook.plugin_name,
                hook = %hook.name,
                timeout_secs = timeout.as_secs(),
                "Hook timed out, killing it",
            );
            if let Err(e) = spawned.child.kill().await {
                tracing::debug!(error = %e, "Failed to kill timed-out hook");
            }
            let (stdout, _) = spawned.output.abort();
            process.stdout = stdout;
            apply_internal_failure(&mut result, &mut process, timeout_diagnostic(timeout));
        }
    }

    tracing::info!(
        plugin = %hook.plugin_name,
        hook = %hook.name,
        status = %result.status,
        exit_code = ?process.exit_code,
        files = result.output_files.len(),
        "Hook finished",
    );
    HookOutcome::Finished { process, result }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
