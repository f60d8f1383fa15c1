//! Durable event log for abx-dl runs.
//!
//! - [`IndexWriter`]: append-only `index.jsonl` writer with optional stdout
//!   echo.
//! - [`IndexReader`]: incremental reader that tails the same file.
//! - [`IndexRecord`] / [`RecordRef`]: the `type`-tagged line format.

pub mod reader;
pub mod record;
pub mod writer;

pub use reader::{read_all, IndexReader};
pub use record::{IndexRecord, RecordRef};
pub use writer::{EventLogError, IndexWriter, INDEX_FILE_NAME};
