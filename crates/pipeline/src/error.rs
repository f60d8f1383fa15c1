use std::path::PathBuf;

use abx_events::EventLogError;

/// Orchestration-level failures.
///
/// Hook failures are never errors here; they become `failed` results. These
/// variants are for problems that stop the run itself.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Failed to create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    EventLog(#[from] EventLogError),

    #[error("Download has already completed")]
    Closed,

    #[error("Download control task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}
