//! Records written to the run's event log.
//!
//! - [`Snapshot`]: one archiving attempt for one URL.
//! - [`Process`]: one subprocess invocation and what it printed.
//! - [`ArchiveResult`]: the semantic outcome of one hook run.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{new_record_id, now, RecordId, Timestamp};

/// Maximum number of characters of stderr kept in [`ArchiveResult::error`].
pub const MAX_ERROR_CHARS: usize = 500;

/// Exit code reserved for failures inside the engine (timeout, launch error,
/// forced kill), as opposed to a code the hook returned itself.
pub const INTERNAL_FAILURE_EXIT_CODE: i32 = -1;

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// One archiving attempt for one URL. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: RecordId,
    pub url: String,
    pub created_at: Timestamp,
}

impl Snapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: new_record_id(),
            url: url.into(),
            created_at: now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// One subprocess invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: RecordId,
    pub cmd: Vec<String>,
    pub pwd: String,
    /// Timeout bound in seconds.
    pub timeout: u64,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// `None` while running.
    pub exit_code: Option<i32>,
}

impl Process {
    pub fn new(cmd: Vec<String>, pwd: &Path, timeout: u64) -> Self {
        Self {
            id: new_record_id(),
            cmd,
            pwd: pwd.to_string_lossy().into_owned(),
            timeout,
            started_at: None,
            ended_at: None,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.started_at = Some(now());
    }

    /// Record the final exit code and output.
    pub fn finish(&mut self, exit_code: i32, stdout: String, stderr: String) {
        self.exit_code = Some(exit_code);
        self.stdout = stdout;
        self.stderr = stderr;
        self.ended_at = Some(now());
    }

    /// Record an engine-side failure: exit code `-1` and a diagnostic in
    /// place of stderr.
    pub fn fail_internal(&mut self, diagnostic: impl Into<String>) {
        self.exit_code = Some(INTERNAL_FAILURE_EXIT_CODE);
        self.stderr = diagnostic.into();
        self.ended_at = Some(now());
    }
}

// ---------------------------------------------------------------------------
// ArchiveStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of an [`ArchiveResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveStatus {
    /// A background hook is still running.
    Started,
    Succeeded,
    Failed,
    /// The hook exited cleanly but produced nothing.
    Skipped,
}

impl ArchiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "started" => Some(Self::Started),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }

    /// Default status for a process exit code, before any directive.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Succeeded
        } else {
            Self::Failed
        }
    }
}

impl std::fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ArchiveResult
// ---------------------------------------------------------------------------

/// The semantic outcome of one hook execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveResult {
    pub id: RecordId,
    pub snapshot_id: RecordId,
    pub plugin: String,
    pub hook_name: String,
    pub status: ArchiveStatus,
    pub process_id: Option<RecordId>,
    #[serde(default)]
    pub output_str: String,
    /// Paths relative to the plugin's output directory.
    #[serde(default)]
    pub output_files: Vec<String>,
    pub start_ts: Option<Timestamp>,
    pub end_ts: Option<Timestamp>,
    pub error: Option<String>,
}

impl ArchiveResult {
    pub fn new(
        snapshot_id: RecordId,
        plugin: impl Into<String>,
        hook_name: impl Into<String>,
        status: ArchiveStatus,
    ) -> Self {
        Self {
            id: new_record_id(),
            snapshot_id,
            plugin: plugin.into(),
            hook_name: hook_name.into(),
            status,
            process_id: None,
            output_str: String::new(),
            output_files: Vec::new(),
            start_ts: None,
            end_ts: None,
            error: None,
        }
    }

    /// Link this result to its process and copy its timing.
    pub fn for_process(mut self, process: &Process) -> Self {
        self.process_id = Some(process.id);
        self.start_ts = process.started_at;
        self.end_ts = process.ended_at;
        self
    }

    pub fn with_error(mut self, error: impl AsRef<str>) -> Self {
        self.error = Some(truncate_error(error.as_ref()));
        self
    }
}

/// Truncate an error message to [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
