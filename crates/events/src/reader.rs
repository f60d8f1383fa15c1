//! Streaming reader for `index.jsonl`.
//!
//! [`IndexReader`] remembers how far into the file it has read, so calling
//! [`read_new`](IndexReader::read_new) repeatedly tails the log as a run
//! appends to it. A trailing line without its newline is held back until it
//! is complete.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::record::IndexRecord;
use crate::writer::EventLogError;

/// Incremental reader over an append-only event log.
pub struct IndexReader {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl IndexReader {
    /// Create a reader positioned at the start of `path`.
    ///
    /// The file does not need to exist yet.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
            partial: Vec::new(),
        }
    }

    /// Read every complete record appended since the previous call.
    ///
    /// Lines that are not valid records are logged and skipped.
    pub fn read_new(&mut self) -> Result<Vec<IndexRecord>, EventLogError> {
        let io_err = |source| EventLogError::Io {
            path: self.path.clone(),
            source,
        };

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };
        file.seek(SeekFrom::Start(self.offset)).map_err(io_err)?;

        let mut chunk = Vec::new();
        let read = file.read_to_end(&mut chunk).map_err(io_err)?;
        self.offset += read as u64;
        self.partial.extend_from_slice(&chunk);

        let Some(last_newline) = self.partial.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        let complete: Vec<u8> = self.partial.drain(..=last_newline).collect();

        let records = complete
            .split(|&b| b == b'\n')
            .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
            .filter_map(|line| match serde_json::from_slice::<IndexRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "Skipping unreadable event log line"
                    );
                    None
                }
            })
            .collect();
        Ok(records)
    }

    /// Path of the log file being read.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read an entire event log in one pass.
pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<IndexRecord>, EventLogError> {
    IndexReader::new(path).read_new()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
