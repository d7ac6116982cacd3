use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::ser::{Formatter, PrettyFormatter};
use tracing::info;

use super::aggregate::ResultAggregator;
use super::scanner::scan_file;
use super::LogEntry;
use crate::error::LogError;
use crate::extract::ExtractionResult;

#[derive(Serialize)]
struct ResultRecord<'a> {
    model: &'a str,
    #[serde(flatten)]
    result: &'a ExtractionResult,
}

/// Producer names end at `]`; subject ids end at the first `": {"`.
pub fn validate_key(producer: &str, subject_id: &str) -> Result<(), LogError> {
    if producer.is_empty() || producer.contains(']') || producer.contains('\n') {
        return Err(LogError::InvalidKey(format!("producer {producer:?}")));
    }
    if subject_id.is_empty() || subject_id.contains(": {") || subject_id.contains('\n') {
        return Err(LogError::InvalidKey(format!("subject {subject_id:?}")));
    }
    Ok(())
}

pub fn format_block(producer: &str, subject_id: &str, payload: &impl Serialize) -> Result<String, LogError> {
    validate_key(producer, subject_id)?;
    let mut body = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut body, BraceEscaping(PrettyFormatter::new()));
    payload.serialize(&mut ser)?;
    Ok(format!("[{producer}] {subject_id}: {}\n", String::from_utf8_lossy(&body)))
}

/// Pretty JSON with `{` and `}` inside strings written as `\u007b`/`\u007d`,
/// so the only braces in a block are structural and the scanner's brace
/// count always balances.
struct BraceEscaping<'a>(PrettyFormatter<'a>);

impl Formatter for BraceEscaping<'_> {
    fn write_string_fragment<W: ?Sized + Write>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()> {
        let mut start = 0;
        for (i, b) in fragment.bytes().enumerate() {
            let escaped = match b {
                b'{' => "\\u007b",
                b'}' => "\\u007d",
                _ => continue,
            };
            writer.write_all(fragment[start..i].as_bytes())?;
            writer.write_all(escaped.as_bytes())?;
            start = i + 1;
        }
        writer.write_all(fragment[start..].as_bytes())
    }

    fn begin_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_array(writer)
    }

    fn end_array<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array(writer)
    }

    fn begin_array_value<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.0.begin_array_value(writer, first)
    }

    fn end_array_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_array_value(writer)
    }

    fn begin_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object(writer)
    }

    fn end_object<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object(writer)
    }

    fn begin_object_key<W: ?Sized + Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        self.0.begin_object_key(writer, first)
    }

    fn begin_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.begin_object_value(writer)
    }

    fn end_object_value<W: ?Sized + Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.0.end_object_value(writer)
    }
}

pub fn format_result_block(producer: &str, result: &ExtractionResult) -> Result<String, LogError> {
    let record = ResultRecord {
        model: producer,
        result,
    };
    format_block(producer, result.subject_id(), &record)
}

/// Single-writer append sink. Each block goes out in one `write_all` and is
/// flushed before the next, so blocks never interleave and an interrupted run
/// loses at most its last block.
pub struct LogWriter {
    path: PathBuf,
    out: BufWriter<File>,
    written: usize,
}

impl LogWriter {
    pub fn open_append(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LogError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| LogError::io(&path, e))?;
        Ok(LogWriter {
            path,
            out: BufWriter::new(file),
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn append_result(&mut self, producer: &str, result: &ExtractionResult) -> Result<(), LogError> {
        let block = format_result_block(producer, result)?;
        self.write_block(&block)
    }

    pub fn append_entry(&mut self, entry: &LogEntry) -> Result<(), LogError> {
        let block = format_block(&entry.producer, &entry.subject_id, &entry.payload)?;
        self.write_block(&block)
    }

    fn write_block(&mut self, block: &str) -> Result<(), LogError> {
        self.out
            .write_all(block.as_bytes())
            .and_then(|_| self.out.flush())
            .map_err(|e| LogError::io(&self.path, e))?;
        self.written += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactSummary {
    pub scanned: usize,
    pub kept: usize,
    pub malformed: usize,
}

/// Rewrite a log keeping only the last entry per key, optionally restricted
/// to `keep_producers`. The new log is written next to the old one and then
/// renamed over it.
pub fn compact_log(path: &Path, keep_producers: &[String]) -> Result<CompactSummary, LogError> {
    let outcome = scan_file(path)?;
    let scanned = outcome.entries.len();

    let mut aggregator = ResultAggregator::new();
    aggregator.ingest(outcome.entries);
    if !keep_producers.is_empty() {
        aggregator.retain_producers(keep_producers);
    }

    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".compact");
    let tmp_path = path.with_file_name(tmp_name);
    // a leftover from an earlier failed compaction would be appended to
    if tmp_path.exists() {
        fs::remove_file(&tmp_path).map_err(|e| LogError::io(&tmp_path, e))?;
    }

    let mut writer = LogWriter::open_append(&tmp_path)?;
    for entry in aggregator.entries() {
        writer.append_entry(entry)?;
    }
    let kept = writer.written();
    drop(writer);

    fs::rename(&tmp_path, path).map_err(|e| LogError::io(path, e))?;
    info!(log = %path.display(), scanned, kept, "compacted log");

    Ok(CompactSummary {
        scanned,
        kept,
        malformed: outcome.stats.malformed,
    })
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::benchlog::scanner::scan_str;
    use crate::extract::classify::AddressFields;

    fn sample(subject: &str) -> ExtractionResult {
        ExtractionResult::success(
            subject,
            AddressFields {
                street_number: Some("221".into()),
                street_name: Some("Baker Street".into()),
                unit_number: Some("Apt {2}".into()),
            },
            0.987,
            1.5,
        )
    }

    #[test]
    fn result_round_trips_through_scanner() {
        let original = sample("pod_001.jpg");
        let block = format_result_block("PaddleOCR", &original).unwrap();
        let out = scan_str(&block);
        assert_eq!(out.entries.len(), 1);
        let entry = &out.entries[0];
        assert_eq!(entry.key(), ("PaddleOCR", "pod_001.jpg"));
        assert_eq!(entry.payload["model"], "PaddleOCR");
        assert_eq!(entry.result(), original);
    }

    #[test]
    fn failure_round_trips() {
        let original = ExtractionResult::failure("pod_002.jpg", "recognizer failed: boom", 0.2);
        let block = format_result_block("EasyOCR", &original).unwrap();
        let entry = &scan_str(&block).entries[0];
        assert!(entry.is_failure());
        assert_eq!(entry.result(), original);
    }

    #[test]
    fn unbalanced_braces_in_values_round_trip() {
        let original = ExtractionResult::success(
            "pod_003.jpg",
            AddressFields {
                street_number: Some("12".into()),
                street_name: Some("Main St}".into()),
                unit_number: Some("Apt {4".into()),
            },
            0.97,
            0.4,
        );
        let block = format_result_block("Tesseract", &original).unwrap();
        assert_eq!(block.matches('{').count(), block.matches('}').count());
        assert!(block.contains("Main St\\u007d"));

        let out = scan_str(&block);
        assert_eq!(out.stats.malformed, 0);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].result(), original);
    }

    #[test]
    fn brace_in_error_does_not_swallow_next_block() {
        let failed = ExtractionResult::failure("pod_3.jpg", "tesseract failed: bad }", 0.1);
        let opened = ExtractionResult::failure("pod_4.jpg", "unexpected { in output", 0.1);
        let mut log = format_result_block("Tesseract", &failed).unwrap();
        log.push_str(&format_result_block("Tesseract", &opened).unwrap());
        log.push_str(&format_result_block("Tesseract", &sample("pod_5.jpg")).unwrap());

        let out = scan_str(&log);
        assert_eq!(out.stats.malformed, 0);
        let ids: Vec<&str> = out.entries.iter().map(|e| e.subject_id.as_str()).collect();
        assert_eq!(ids, vec!["pod_3.jpg", "pod_4.jpg", "pod_5.jpg"]);
        assert_eq!(out.entries[0].result(), failed);
        assert_eq!(out.entries[1].result(), opened);
    }

    #[test]
    fn rejects_keys_that_break_the_grammar() {
        assert!(matches!(validate_key("a]b", "x.jpg"), Err(LogError::InvalidKey(_))));
        assert!(matches!(validate_key("A", "x: {y}.jpg"), Err(LogError::InvalidKey(_))));
        assert!(matches!(validate_key("", "x.jpg"), Err(LogError::InvalidKey(_))));
        assert!(validate_key("blaifa/InternVL3_5:8b", "scan: front.jpg").is_ok());
    }

    #[test]
    fn appends_are_complete_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/run_results.log");
        let mut writer = LogWriter::open_append(&path).unwrap();
        writer.append_result("A", &sample("pod_1.jpg")).unwrap();
        writer.append_result("B", &sample("pod_1.jpg")).unwrap();
        drop(writer);

        let mut writer = LogWriter::open_append(&path).unwrap();
        writer.append_result("A", &sample("pod_2.jpg")).unwrap();
        drop(writer);

        let out = scan_file(&path).unwrap();
        assert_eq!(out.entries.len(), 3);
        assert_eq!(out.stats.malformed, 0);
    }

    #[test]
    fn compaction_keeps_last_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.log");
        let mut writer = LogWriter::open_append(&path).unwrap();
        writer
            .append_result("A", &ExtractionResult::failure("pod_1.jpg", "timeout", 0.1))
            .unwrap();
        writer.append_result("B", &sample("pod_1.jpg")).unwrap();
        writer.append_result("A", &sample("pod_1.jpg")).unwrap();
        drop(writer);

        let summary = compact_log(&path, &["A".to_string()]).unwrap();
        assert_eq!(summary.scanned, 3);
        assert_eq!(summary.kept, 1);

        let out = scan_file(&path).unwrap();
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].producer, "A");
        assert!(!out.entries[0].is_failure());
    }
}
