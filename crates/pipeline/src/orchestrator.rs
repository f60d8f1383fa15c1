//! Runs every hook of the selected plugins against one URL.
//!
//! [`download`] sets up the run (output directory, event log, snapshot) and
//! then hands iteration to a single control task. The task owns the shared
//! configuration and the event log and runs hooks one at a time. It only
//! starts a hook once the returned [`Download`] asks for the next result, so
//! a consumer that stops pulling also stops the run. Background hooks are
//! reconciled when iteration ends, however it ends.
//!
//! ```text
//! plugins -> select -> dependency gate -> crawl hooks (by sort_key)
//!                                      -> snapshot hooks (by sort_key)
//!         -> wait for request -> run_hook -> log + reply -> merge directives
//! end     -> BackgroundReconciler::cleanup
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io::IsTerminal;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use abx_core::config::{build_env_for_plugin, resolve_timeout, HookEnv, LibPaths, SharedConfig};
use abx_core::plugin::{Hook, Plugin};
use abx_core::records::{ArchiveResult, Snapshot};
use abx_events::IndexWriter;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::dependencies::{check_plugin_dependencies, DependencyGate};
use crate::error::PipelineError;
use crate::reconciler::{BackgroundReconciler, TERMINATION_GRACE_PERIOD};
use crate::runner::{run_hook, HookOutcome};
use crate::subprocess;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-run options for [`download`].
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Plugin names to run, matched case-insensitively. `None` or an empty
    /// list runs every plugin.
    pub selected_plugins: Option<Vec<String>>,
    /// Initial shared configuration.
    pub config_overrides: BTreeMap<String, Value>,
    /// Install missing binaries instead of skipping the plugin.
    pub auto_install: bool,
    pub lib_paths: LibPaths,
    /// Environment every hook environment is layered on top of.
    pub base_env: HookEnv,
    /// Force event log echoing on or off. `None` echoes when stdout is not
    /// a terminal.
    pub echo: Option<bool>,
    /// Grace period between `SIGTERM` and `SIGKILL` for background hooks.
    pub termination_grace: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            selected_plugins: None,
            config_overrides: BTreeMap::new(),
            auto_install: true,
            lib_paths: LibPaths::from_env(),
            base_env: std::env::vars().collect(),
            echo: None,
            termination_grace: TERMINATION_GRACE_PERIOD,
        }
    }
}

// ---------------------------------------------------------------------------
// Download handle
// ---------------------------------------------------------------------------

/// Why a plugin was left out of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Declared binaries that could not be loaded or installed.
    MissingBinaries(Vec<String>),
    /// The plugin descriptor failed validation.
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPlugin {
    pub name: String,
    pub reason: SkipReason,
}

/// Summary returned once a run has fully completed.
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub snapshot: Snapshot,
    /// Final results of background hooks, as written by reconciliation.
    pub reconciled: Vec<ArchiveResult>,
    pub skipped_plugins: Vec<SkippedPlugin>,
}

/// A request for one more result. The control task answers on the enclosed
/// sender once the next hook has run.
type ResultRequest = oneshot::Sender<ArchiveResult>;

/// Pids of background hooks that are tracked but not yet reaped.
type LivePids = Arc<Mutex<BTreeSet<u32>>>;

/// A run in progress.
///
/// Yields one [`ArchiveResult`] per attempted hook, in execution order.
/// Background hooks appear with status `started`; their final results are in
/// the [`DownloadReport`]. Each hook starts only when the next result is
/// requested.
///
/// To stop early, call [`close`](Self::close): no further hooks start, and
/// it returns once background hooks have been reconciled and logged. Dropping
/// the handle instead sends `SIGTERM` to running background hooks and leaves
/// reconciliation to the control task, which is only recorded if the runtime
/// outlives it.
pub struct Download {
    snapshot: Snapshot,
    requests: Option<mpsc::Sender<ResultRequest>>,
    pending: Option<oneshot::Receiver<ArchiveResult>>,
    task: Option<JoinHandle<Result<DownloadReport, PipelineError>>>,
    live: LivePids,
}

impl Download {
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Run the next hook and return its result, or `None` once every hook
    /// has run and background hooks have been reconciled.
    pub async fn next(&mut self) -> Option<ArchiveResult> {
        std::future::poll_fn(|cx| futures::Stream::poll_next(Pin::new(&mut *self), cx)).await
    }

    /// Run every remaining hook and wait for the run to complete.
    pub async fn finish(mut self) -> Result<DownloadReport, PipelineError> {
        while self.next().await.is_some() {}
        self.join().await
    }

    /// Stop after the hook currently running, if any, and wait for
    /// background hooks to be reconciled.
    ///
    /// A result that was still being produced is discarded; its records are
    /// in the event log.
    pub async fn close(mut self) -> Result<DownloadReport, PipelineError> {
        self.requests = None;
        self.pending = None;
        self.join().await
    }

    async fn join(&mut self) -> Result<DownloadReport, PipelineError> {
        let Some(task) = self.task.take() else {
            return Err(PipelineError::Closed);
        };
        match task.await {
            Ok(report) => report,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(e.into()),
        }
    }
}

impl futures::Stream for Download {
    type Item = ArchiveResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.pending.is_none() {
            let Some(requests) = &this.requests else {
                return Poll::Ready(None);
            };
            let (reply, pending) = oneshot::channel();
            // At most one request is ever outstanding, so the slot is free
            // unless the control task has gone.
            if requests.try_send(reply).is_err() {
                this.requests = None;
                return Poll::Ready(None);
            }
            this.pending = Some(pending);
        }

        let Some(pending) = this.pending.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(pending).poll(cx) {
            Poll::Ready(Ok(result)) => {
                this.pending = None;
                Poll::Ready(Some(result))
            }
            Poll::Ready(Err(_)) => {
                // Iteration ended and the control task dropped the request.
                this.pending = None;
                this.requests = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Download {
    fn drop(&mut self) {
        let Some(task) = &self.task else {
            return;
        };
        if task.is_finished() {
            return;
        }

        // Held while signalling so the control task cannot reap a child
        // (and free its pid) in between.
        let live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        tracing::warn!(
            snapshot_id = %self.snapshot.id,
            background_hooks = live.len(),
            "Download dropped before completion, use close() to wait for reconciliation",
        );
        for &pid in live.iter() {
            if let Err(e) = subprocess::terminate_pid(pid) {
                tracing::debug!(pid, error = %e, "Failed to send SIGTERM to background hook");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// download
// ---------------------------------------------------------------------------

/// Start archiving `url` with `plugins`, writing into `output_dir`.
///
/// Creating the output directory, opening the event log and recording the
/// [`Snapshot`] happen before this returns; failures there are returned
/// directly. Everything after runs on a spawned control task.
pub async fn download<G>(
    url: &str,
    plugins: Vec<Plugin>,
    output_dir: &Path,
    options: DownloadOptions,
    gate: G,
) -> Result<Download, PipelineError>
where
    G: DependencyGate + 'static,
{
    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|source| PipelineError::OutputDir {
            path: output_dir.to_path_buf(),
            source,
        })?;

    let mut log = IndexWriter::open_in(output_dir)?;
    if let Some(echo) = options.echo {
        log = log.with_echo(echo);
    }

    let snapshot = Snapshot::new(url);
    log.append(&snapshot)?;
    tracing::info!(
        snapshot_id = %snapshot.id,
        url = %url,
        output_dir = %output_dir.display(),
        "Snapshot created",
    );

    let (tx, rx) = mpsc::channel(1);
    let live = LivePids::default();
    let run = Run {
        snapshot: snapshot.clone(),
        output_dir: output_dir.to_path_buf(),
        options,
        live: Arc::clone(&live),
    };
    let task = tokio::spawn(run.drive(plugins, gate, log, rx));

    Ok(Download {
        snapshot,
        requests: Some(tx),
        pending: None,
        task: Some(task),
        live,
    })
}

struct Run {
    snapshot: Snapshot,
    output_dir: PathBuf,
    options: DownloadOptions,
    live: LivePids,
}

impl Run {
    /// Control task body: iterate, then always reconcile.
    async fn drive<G: DependencyGate>(
        self,
        plugins: Vec<Plugin>,
        gate: G,
        mut log: IndexWriter,
        mut requests: mpsc::Receiver<ResultRequest>,
    ) -> Result<DownloadReport, PipelineError> {
        let mut reconciler = BackgroundReconciler::new().with_grace_period(self.options.termination_grace);

        let outcome = AssertUnwindSafe(self.iterate(plugins, &gate, &mut log, &mut reconciler, &mut requests))
            .catch_unwind()
            .await;

        self.live.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let reconciled = reconciler.cleanup(&mut log).await;
        // Answers a request still waiting for a result with end of stream.
        drop(requests);

        match outcome {
            Ok(Ok(skipped_plugins)) => {
                tracing::info!(
                    snapshot_id = %self.snapshot.id,
                    records = log.written(),
                    "Download complete",
                );
                Ok(DownloadReport {
                    snapshot: self.snapshot,
                    reconciled,
                    skipped_plugins,
                })
            }
            Ok(Err(e)) => {
                tracing::error!(snapshot_id = %self.snapshot.id, error = %e, "Download aborted");
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn iterate<G: DependencyGate>(
        &self,
        plugins: Vec<Plugin>,
        gate: &G,
        log: &mut IndexWriter,
        reconciler: &mut BackgroundReconciler,
        requests: &mut mpsc::Receiver<ResultRequest>,
    ) -> Result<Vec<SkippedPlugin>, PipelineError> {
        let selected = select_plugins(plugins, self.options.selected_plugins.as_deref());
        let (available, skipped) = self.gate_plugins(selected, gate).await;
        report_skipped(&skipped, self.options.auto_install);

        let ordered = order_hooks(&available);
        tracing::info!(
            plugins = available.len(),
            hooks = ordered.len(),
            skipped = skipped.len(),
            "Hook order resolved",
        );

        let mut shared = SharedConfig::from_overrides(self.options.config_overrides.clone());

        for (plugin, hook) in ordered {
            let Some(reply) = requests.recv().await else {
                tracing::info!(next_hook = %hook.name, "Result consumer went away, stopping early");
                break;
            };

            let env = build_env_for_plugin(
                plugin,
                &shared,
                &self.options.lib_paths,
                self.options.base_env.clone(),
            );
            let timeout = resolve_timeout(&env, &plugin.name);

            let plugin_dir = self.output_dir.join(&plugin.name);
            tokio::fs::create_dir_all(&plugin_dir)
                .await
                .map_err(|source| PipelineError::OutputDir {
                    path: plugin_dir.clone(),
                    source,
                })?;

            let outcome = run_hook(hook, &self.snapshot.url, self.snapshot.id, &plugin_dir, &env, timeout).await;
            let result = match outcome {
                HookOutcome::Finished { process, result } => {
                    log.append(&process)?;
                    log.append(&result)?;
                    let merged = shared.merge_stdout(&process.stdout);
                    if !merged.is_empty() {
                        tracing::info!(hook = %hook.name, keys = ?merged, "Shared configuration updated");
                    }
                    result
                }
                HookOutcome::Background(handle) => {
                    let started = handle.result().clone();
                    if let Some(pid) = handle.pid() {
                        self.live.lock().unwrap_or_else(PoisonError::into_inner).insert(pid);
                    }
                    reconciler.track(handle);
                    started
                }
            };

            if reply.send(result).is_err() {
                tracing::info!(hook = %hook.name, "Result consumer went away, stopping early");
                break;
            }
        }

        Ok(skipped)
    }

    /// Split plugins into runnable and skipped.
    async fn gate_plugins<G: DependencyGate>(
        &self,
        plugins: Vec<Plugin>,
        gate: &G,
    ) -> (Vec<Plugin>, Vec<SkippedPlugin>) {
        let mut available = Vec::with_capacity(plugins.len());
        let mut skipped = Vec::new();
        for plugin in plugins {
            let plugin = plugin.bind_hooks();
            if let Err(e) = plugin.validate() {
                skipped.push(SkippedPlugin {
                    name: plugin.name.clone(),
                    reason: SkipReason::Invalid(e.to_string()),
                });
                continue;
            }
            if !plugin.binaries.is_empty() {
                let missing = check_plugin_dependencies(gate, &plugin, self.options.auto_install).await;
                if !missing.is_empty() {
                    skipped.push(SkippedPlugin {
                        name: plugin.name.clone(),
                        reason: SkipReason::MissingBinaries(missing),
                    });
                    continue;
                }
            }
            available.push(plugin);
        }
        (available, skipped)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep the plugins named in `selected`, matched case-insensitively.
pub fn select_plugins(plugins: Vec<Plugin>, selected: Option<&[String]>) -> Vec<Plugin> {
    match selected {
        Some(names) if !names.is_empty() => {
            let wanted: Vec<String> = names.iter().map(|n| n.to_lowercase()).collect();
            plugins
                .into_iter()
                .filter(|p| wanted.contains(&p.name.to_lowercase()))
                .collect()
        }
        _ => plugins,
    }
}

/// Crawl hooks of every plugin, then snapshot hooks, each group sorted by
/// `sort_key`. Ties keep plugin order.
pub fn order_hooks(plugins: &[Plugin]) -> Vec<(&Plugin, &Hook)> {
    let mut crawl: Vec<(&Plugin, &Hook)> = plugins
        .iter()
        .flat_map(|p| p.crawl_hooks().map(move |h| (p, h)))
        .collect();
    let mut snapshot: Vec<(&Plugin, &Hook)> = plugins
        .iter()
        .flat_map(|p| p.snapshot_hooks().map(move |h| (p, h)))
        .collect();
    crawl.sort_by_key(|(_, h)| h.sort_key);
    snapshot.sort_by_key(|(_, h)| h.sort_key);
    crawl.extend(snapshot);
    crawl
}

fn report_skipped(skipped: &[SkippedPlugin], auto_install: bool) {
    if skipped.is_empty() {
        return;
    }
    let interactive = std::io::stdout().is_terminal();
    for plugin in skipped {
        match &plugin.reason {
            SkipReason::MissingBinaries(missing) => {
                tracing::warn!(plugin = %plugin.name, missing = ?missing, "Skipping plugin with missing dependencies");
                if interactive {
                    eprintln!(
                        "Warning: Skipping plugin '{}' - missing dependencies: {}",
                        plugin.name,
                        missing.join(", ")
                    );
                }
            }
            SkipReason::Invalid(reason) => {
                tracing::warn!(plugin = %plugin.name, reason = %reason, "Skipping invalid plugin");
            }
        }
    }
    let any_missing = skipped
        .iter()
        .any(|p| matches!(p.reason, SkipReason::MissingBinaries(_)));
    if interactive && any_missing && !auto_install {
        eprintln!("Hint: enable auto-install (ABX_AUTO_INSTALL=true) to install missing dependencies");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
