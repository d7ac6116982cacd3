//! Append-only benchmark log: tagged blocks of the form
//!
//! ```text
//! [producer] subject_id: {
//!   "street_number": "221",
//!   ...
//! }
//! ```
//!
//! Entries are appended once per extraction attempt and replayed with
//! last-write-wins per `(producer, subject_id)`.

pub mod aggregate;
pub mod resume;
pub mod scanner;
pub mod writer;

use serde_json::{Map, Value};

use crate::extract::ExtractionResult;

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub producer: String,
    pub subject_id: String,
    pub payload: Map<String, Value>,
}

impl LogEntry {
    pub fn key(&self) -> (&str, &str) {
        (&self.producer, &self.subject_id)
    }

    pub fn is_failure(&self) -> bool {
        self.payload.get("error").is_some_and(|e| !e.is_null())
    }

    pub fn result(&self) -> ExtractionResult {
        ExtractionResult::from_payload(&self.subject_id, &self.payload)
    }
}

pub use aggregate::{ProducerStats, ResultAggregator};
pub use resume::{ResumeIndex, ResumePolicy};
pub use scanner::{scan_file, scan_reader, scan_str, BlockScanner, ScanOutcome, ScanStats};
pub use writer::{compact_log, format_result_block, CompactSummary, LogWriter};
