use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::Path;

use tracing::info;

use super::scanner::scan_reader_with;
use super::LogEntry;
use crate::error::LogError;

/// Which logged attempts count as done when resuming a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Any logged entry, failures included.
    #[default]
    All,
    /// Only keys whose last entry has no error, so failures get retried.
    SuccessfulOnly,
}

/// Set of `(producer, subject_id)` pairs already present in a log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumeIndex {
    done: HashMap<String, HashSet<String>>,
}

impl ResumeIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries<'a, I>(entries: I, policy: ResumePolicy) -> Self
    where
        I: IntoIterator<Item = &'a LogEntry>,
    {
        let mut index = Self::default();
        for entry in entries {
            index.record(entry, policy);
        }
        index
    }

    /// Replay the log at `path`. A log that does not exist yet is an empty
    /// index; any other read failure is an error.
    pub fn from_log(path: &Path, policy: ResumePolicy) -> Result<Self, LogError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(log = %path.display(), "no existing log, starting fresh");
                return Ok(Self::default());
            }
            Err(e) => return Err(LogError::io(path, e)),
        };

        let mut index = Self::default();
        let stats = scan_reader_with(BufReader::new(file), |entry| index.record(&entry, policy))
            .map_err(|e| LogError::io(path, e))?;
        info!(
            log = %path.display(),
            entries = stats.emitted,
            malformed = stats.malformed,
            done = index.len(),
            "resume index loaded"
        );
        Ok(index)
    }

    fn record(&mut self, entry: &LogEntry, policy: ResumePolicy) {
        if policy == ResumePolicy::SuccessfulOnly && entry.is_failure() {
            if let Some(subjects) = self.done.get_mut(&entry.producer) {
                subjects.remove(&entry.subject_id);
            }
            return;
        }
        self.done
            .entry(entry.producer.clone())
            .or_default()
            .insert(entry.subject_id.clone());
    }

    pub fn contains(&self, producer: &str, subject_id: &str) -> bool {
        self.done.get(producer).is_some_and(|s| s.contains(subject_id))
    }

    pub fn len(&self) -> usize {
        self.done.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchlog::scanner::scan_str;

    const LOG: &str = "[A] pod_1.jpg: {\"error\": \"timeout\"}\n\
                       [A] pod_2.jpg: {\"street_number\": \"4\"}\n\
                       [B] pod_1.jpg: {\"street_number\": \"9\"}\n\
                       [B] pod_2.jpg: {\"street_number\": \"9\"}\n\
                       [B] pod_2.jpg: {\"error\": \"backend\"}\n";

    #[test]
    fn all_policy_counts_failures() {
        let out = scan_str(LOG);
        let index = ResumeIndex::from_entries(&out.entries, ResumePolicy::All);
        assert!(index.contains("A", "pod_1.jpg"));
        assert!(index.contains("B", "pod_2.jpg"));
        assert!(!index.contains("C", "pod_1.jpg"));
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn successful_only_uses_last_entry() {
        let out = scan_str(LOG);
        let index = ResumeIndex::from_entries(&out.entries, ResumePolicy::SuccessfulOnly);
        assert!(!index.contains("A", "pod_1.jpg"));
        assert!(index.contains("A", "pod_2.jpg"));
        assert!(index.contains("B", "pod_1.jpg"));
        // success then failure: the failure wins
        assert!(!index.contains("B", "pod_2.jpg"));
    }

    #[test]
    fn replaying_twice_is_idempotent() {
        let out = scan_str(LOG);
        let once = ResumeIndex::from_entries(&out.entries, ResumePolicy::SuccessfulOnly);
        let twice = ResumeIndex::from_entries(
            out.entries.iter().chain(out.entries.iter()),
            ResumePolicy::SuccessfulOnly,
        );
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let index = ResumeIndex::from_log(&dir.path().join("nope.log"), ResumePolicy::All).unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn loads_fixture_log() {
        let index = ResumeIndex::from_log(Path::new("tests/fixtures/mixed_results.log"), ResumePolicy::All).unwrap();
        assert!(index.contains("PaddleOCR", "pod_001.jpg"));
        assert!(index.contains("qwen3-vl:8b", "pod_002.jpg"));
    }
}
