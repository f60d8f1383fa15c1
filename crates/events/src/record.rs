//! Typed lines of `index.jsonl`.
//!
//! Every line is a JSON object whose `type` field names the record kind, so
//! readers can dispatch without knowing the order records were written in.

use abx_core::records::{ArchiveResult, ArchiveStatus, Process, Snapshot};
use serde::{Deserialize, Serialize};

/// One owned record read back from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IndexRecord {
    Snapshot(Snapshot),
    Process(Process),
    ArchiveResult(ArchiveResult),
}

impl IndexRecord {
    /// The value of the record's `type` discriminator.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Snapshot(_) => "Snapshot",
            Self::Process(_) => "Process",
            Self::ArchiveResult(_) => "ArchiveResult",
        }
    }

    pub fn as_archive_result(&self) -> Option<&ArchiveResult> {
        match self {
            Self::ArchiveResult(result) => Some(result),
            _ => None,
        }
    }

    /// Status of an `ArchiveResult` record, `None` for other kinds.
    pub fn status(&self) -> Option<ArchiveStatus> {
        self.as_archive_result().map(|r| r.status)
    }
}

/// A borrowed record, serialized with the same layout as [`IndexRecord`].
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "type")]
pub enum RecordRef<'a> {
    Snapshot(&'a Snapshot),
    Process(&'a Process),
    ArchiveResult(&'a ArchiveResult),
}

impl<'a> From<&'a Snapshot> for RecordRef<'a> {
    fn from(snapshot: &'a Snapshot) -> Self {
        Self::Snapshot(snapshot)
    }
}

impl<'a> From<&'a Process> for RecordRef<'a> {
    fn from(process: &'a Process) -> Self {
        Self::Process(process)
    }
}

impl<'a> From<&'a ArchiveResult> for RecordRef<'a> {
    fn from(result: &'a ArchiveResult) -> Self {
        Self::ArchiveResult(result)
    }
}

impl<'a> From<&'a IndexRecord> for RecordRef<'a> {
    fn from(record: &'a IndexRecord) -> Self {
        match record {
            IndexRecord::Snapshot(s) => Self::Snapshot(s),
            IndexRecord::Process(p) => Self::Process(p),
            IndexRecord::ArchiveResult(r) => Self::ArchiveResult(r),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
