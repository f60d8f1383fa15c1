//! Append-only writer for a run's `index.jsonl`.
//!
//! [`IndexWriter`] serializes each record to one JSON line and flushes
//! after every write, so a concurrent [`IndexReader`](crate::IndexReader)
//! tailing the file never waits on buffered bytes. When the engine's stdout
//! is not an interactive terminal every line is also echoed there, which
//! lets a parent process consume the run as a JSONL stream.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};

use crate::record::RecordRef;

/// File name of the event log inside a run's output directory.
pub const INDEX_FILE_NAME: &str = "index.jsonl";

/// Errors raised while appending to the event log.
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Event log I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize event log record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Append-only JSONL event log writer.
///
/// There is exactly one writer per run. It is owned by whichever phase is
/// currently producing records and handed over by `&mut`, so writes never
/// interleave.
pub struct IndexWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    echo: bool,
    written: usize,
}

impl IndexWriter {
    /// Open (or create) `<output_dir>/index.jsonl` for appending.
    ///
    /// Echoing to stdout is enabled when stdout is not a terminal.
    pub fn open_in(output_dir: &Path) -> Result<Self, EventLogError> {
        Self::open(output_dir.join(INDEX_FILE_NAME))
    }

    /// Open (or create) the log file at `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EventLogError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| EventLogError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            echo: !std::io::stdout().is_terminal(),
            written: 0,
        })
    }

    /// Override stdout echoing.
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Append one record as a JSON line and flush it to disk.
    pub fn append<'a>(&mut self, record: impl Into<RecordRef<'a>>) -> Result<(), EventLogError> {
        let mut line = serde_json::to_vec(&record.into())?;
        line.push(b'\n');

        self.writer
            .write_all(&line)
            .and_then(|()| self.writer.flush())
            .map_err(|source| EventLogError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.written += 1;

        if self.echo {
            let mut stdout = std::io::stdout().lock();
            if let Err(e) = stdout.write_all(&line).and_then(|()| stdout.flush()) {
                tracing::debug!(error = %e, "Failed to echo event log line to stdout");
            }
        }
        Ok(())
    }

    /// Path of the underlying log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether lines are echoed to stdout.
    pub fn echoes(&self) -> bool {
        self.echo
    }

    /// Number of records appended through this writer.
    pub fn written(&self) -> usize {
        self.written
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
