use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::LogEntry;
use crate::error::LogError;

/// `[producer] subject_id: {...`; the subject ends at the first `": {"`.
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[([^\]]+)\] (.+?): (\{.*)$").unwrap());

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub lines: usize,
    pub blocks: usize,
    pub emitted: usize,
    pub malformed: usize,
}

#[derive(Debug)]
struct PendingBlock {
    producer: String,
    subject_id: String,
    buffer: String,
    depth: i64,
    start_line: usize,
}

#[derive(Debug, Default)]
enum ScanState {
    #[default]
    Idle,
    Capturing(PendingBlock),
}

/// Line-fed two-state scanner recovering tagged blocks from a benchmark log.
///
/// A block starts at a tag line and ends when its running `{`/`}` balance
/// returns to zero. A new tag while still capturing force-completes the open
/// block; `finish` does the same for a block left open at end of stream.
/// Blocks that do not parse as a JSON object are counted and skipped.
#[derive(Debug, Default)]
pub struct BlockScanner {
    state: ScanState,
    stats: ScanStats,
}

impl BlockScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self.state, ScanState::Capturing(_))
    }

    pub fn push_line(&mut self, line: &str, out: &mut Vec<LogEntry>) {
        let line = line.trim_end_matches(['\n', '\r']);
        self.stats.lines += 1;

        if let Some(caps) = TAG_RE.captures(line) {
            if let ScanState::Capturing(open) = std::mem::take(&mut self.state) {
                debug!(
                    producer = %open.producer,
                    subject = %open.subject_id,
                    line = open.start_line,
                    "block interrupted by next tag"
                );
                self.complete(open, out);
            }

            let rest = &caps[3];
            let block = PendingBlock {
                producer: caps[1].to_string(),
                subject_id: caps[2].to_string(),
                buffer: rest.to_string(),
                depth: brace_delta(rest),
                start_line: self.stats.lines,
            };
            if block.depth <= 0 {
                self.complete(block, out);
            } else {
                self.state = ScanState::Capturing(block);
            }
            return;
        }

        let closed = match &mut self.state {
            ScanState::Capturing(block) => {
                block.buffer.push('\n');
                block.buffer.push_str(line);
                block.depth += brace_delta(line);
                block.depth <= 0
            }
            // stray output between blocks
            ScanState::Idle => false,
        };
        if closed {
            if let ScanState::Capturing(block) = std::mem::take(&mut self.state) {
                self.complete(block, out);
            }
        }
    }

    /// End of stream: try whatever is still buffered.
    pub fn finish(&mut self, out: &mut Vec<LogEntry>) {
        if let ScanState::Capturing(block) = std::mem::take(&mut self.state) {
            debug!(
                producer = %block.producer,
                subject = %block.subject_id,
                line = block.start_line,
                "unbalanced block at end of log"
            );
            self.complete(block, out);
        }
    }

    fn complete(&mut self, block: PendingBlock, out: &mut Vec<LogEntry>) {
        self.stats.blocks += 1;
        match parse_payload(&block.buffer, &block.subject_id) {
            Ok(payload) => {
                self.stats.emitted += 1;
                out.push(LogEntry {
                    producer: block.producer,
                    subject_id: block.subject_id,
                    payload,
                });
            }
            Err(reason) => {
                self.stats.malformed += 1;
                warn!(
                    producer = %block.producer,
                    subject = %block.subject_id,
                    line = block.start_line,
                    %reason,
                    "skipping malformed block"
                );
            }
        }
    }
}

fn brace_delta(text: &str) -> i64 {
    text.chars().fold(0, |acc, c| match c {
        '{' => acc + 1,
        '}' => acc - 1,
        _ => acc,
    })
}

/// Parse a block body; payloads nested under their own subject id
/// (`{"pod_1.jpg": {...}}`) are unwrapped.
fn parse_payload(buffer: &str, subject_id: &str) -> Result<Map<String, Value>, String> {
    let value: Value = serde_json::from_str(buffer.trim()).map_err(|e| e.to_string())?;
    let Value::Object(mut map) = value else {
        return Err("payload is not an object".to_string());
    };
    if matches!(map.get(subject_id), Some(Value::Object(_))) {
        if let Some(Value::Object(inner)) = map.remove(subject_id) {
            return Ok(inner);
        }
    }
    Ok(map)
}

/// Scan a reader, handing each entry to `on_entry` in file order.
/// Invalid UTF-8 is replaced rather than treated as fatal.
pub fn scan_reader_with<R, F>(mut reader: R, mut on_entry: F) -> std::io::Result<ScanStats>
where
    R: BufRead,
    F: FnMut(LogEntry),
{
    let mut scanner = BlockScanner::new();
    let mut out = Vec::new();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        scanner.push_line(&String::from_utf8_lossy(&raw), &mut out);
        out.drain(..).for_each(&mut on_entry);
    }
    scanner.finish(&mut out);
    out.drain(..).for_each(&mut on_entry);

    Ok(scanner.stats())
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub entries: Vec<LogEntry>,
    pub stats: ScanStats,
}

pub fn scan_reader<R: BufRead>(reader: R) -> std::io::Result<ScanOutcome> {
    let mut entries = Vec::new();
    let stats = scan_reader_with(reader, |e| entries.push(e))?;
    Ok(ScanOutcome { entries, stats })
}

pub fn scan_str(text: &str) -> ScanOutcome {
    let mut scanner = BlockScanner::new();
    let mut entries = Vec::new();
    for line in text.lines() {
        scanner.push_line(line, &mut entries);
    }
    scanner.finish(&mut entries);
    ScanOutcome {
        entries,
        stats: scanner.stats(),
    }
}

pub fn scan_file(path: &Path) -> Result<ScanOutcome, LogError> {
    let file = File::open(path).map_err(|e| LogError::io(path, e))?;
    scan_reader(BufReader::new(file)).map_err(|e| LogError::io(path, e))
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> String {
        std::fs::read_to_string(format!("tests/fixtures/{}", name)).unwrap()
    }

    #[test]
    fn single_line_block() {
        let out = scan_str("[EasyOCR] pod_1.jpg: {\"street_number\": \"12\"}\n");
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].producer, "EasyOCR");
        assert_eq!(out.entries[0].subject_id, "pod_1.jpg");
        assert_eq!(out.entries[0].payload["street_number"], "12");
    }

    #[test]
    fn multi_line_with_nested_braces() {
        let log = "[qwen3-vl:8b] pod_2.jpg: {\n  \"meta\": {\n    \"a\": 1\n  },\n  \"street_name\": \"Elm\"\n}\n";
        let out = scan_str(log);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].producer, "qwen3-vl:8b");
        assert_eq!(out.entries[0].payload["meta"]["a"], 1);
    }

    #[test]
    fn truncated_tail_dropped() {
        let out = scan_str(&fixture("truncated.log"));
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].subject_id, "pod_001.jpg");
        assert_eq!(out.stats.blocks, 2);
        assert_eq!(out.stats.malformed, 1);
    }

    #[test]
    fn interrupted_block_is_attempted_then_scanning_resumes() {
        let log = "[A] one.jpg: {\n  \"x\": 1\n[A] two.jpg: {\"x\": 2}\n";
        let out = scan_str(log);
        // the interrupted block cannot parse; the next one still does
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].subject_id, "two.jpg");
        assert_eq!(out.stats.malformed, 1);
    }

    #[test]
    fn noise_lines_ignored() {
        let log = "Target Images: 3\n[1/3] Processing images/pod_1.jpg...\n[A] pod_1.jpg: {\"x\": 1}\n  -> done\n";
        let out = scan_str(log);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.stats.lines, 4);
    }

    #[test]
    fn subject_may_contain_colon_space() {
        let out = scan_str("[A] scan: front.jpg: {\"x\": 1}\n");
        assert_eq!(out.entries[0].subject_id, "scan: front.jpg");
    }

    #[test]
    fn nested_subject_payload_unwrapped() {
        let log = "[PaddleOCR] pod_3.jpg: {\n  \"pod_3.jpg\": {\n    \"street_number\": \"9\"\n  }\n}\n";
        let out = scan_str(log);
        assert_eq!(out.entries[0].payload["street_number"], "9");
    }

    #[test]
    fn unparseable_payload_is_malformed() {
        let out = scan_str("[A] a.jpg: {}\n[A] b.jpg: {\"x\": [1, 2}\n");
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.stats.malformed, 1);
    }

    #[test]
    fn stray_close_brace_ends_block_and_scanning_resumes() {
        let log = "[A] a.jpg: {\n  \"street_name\": \"Elm\"\n}}\n  -> note\n[A] b.jpg: {\"x\": 2}\n";
        let mut scanner = BlockScanner::new();
        let mut out = Vec::new();
        for line in log.lines().take(3) {
            scanner.push_line(line, &mut out);
        }
        // depth went negative on the continuation line: the block is closed
        assert!(!scanner.is_capturing());
        assert!(out.is_empty());
        assert_eq!(scanner.stats().malformed, 1);

        let out = scan_str(log);
        assert_eq!(out.entries.len(), 1);
        assert_eq!(out.entries[0].subject_id, "b.jpg");
        assert_eq!(out.stats.blocks, 2);
        assert_eq!(out.stats.malformed, 1);
    }

    #[test]
    fn reader_matches_str_scan() {
        let text = fixture("mixed_results.log");
        let from_reader = scan_reader(std::io::Cursor::new(text.as_bytes())).unwrap();
        let from_str = scan_str(&text);
        assert_eq!(from_reader.entries, from_str.entries);
        assert_eq!(from_reader.stats, from_str.stats);
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = scan_file(Path::new("tests/fixtures/does_not_exist.log")).unwrap_err();
        assert!(matches!(err, LogError::Io { .. }));
    }
}
