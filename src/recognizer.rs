//! Recognizer adapters.
//!
//! A recognizer turns one subject (an image on disk) into either scored text
//! fragments or one generated block of text. Everything downstream of
//! `RecognizerOutput` is shared, so an adapter only has to get its output into
//! one of those two shapes.

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::LazyLock;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use crate::error::ExtractError;
use crate::extract::normalize::{tokens_from_generated, tokens_from_scored, Token};

static GROUNDING_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<\|.*?\|>").unwrap());
static BOX_COORDS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\[.*?\]\]").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerOutput {
    /// `(text, confidence)` pairs from a detector/recognizer engine.
    Scored(Vec<(String, f64)>),
    /// Free-form text from a generative model; no per-token confidence.
    Generated(String),
}

impl RecognizerOutput {
    pub fn tokens(&self) -> Vec<Token> {
        match self {
            RecognizerOutput::Scored(pairs) => tokens_from_scored(pairs),
            RecognizerOutput::Generated(text) => tokens_from_generated(&clean_generated_text(text)),
        }
    }
}

/// Strip grounding markup (`<|ref|>`-style tags, `[[x, y, ...]]` boxes) that
/// some generative OCR models interleave with the text, then flatten lines.
pub fn clean_generated_text(raw: &str) -> String {
    let without_tags = GROUNDING_TAG_RE.replace_all(raw, "");
    let without_boxes = BOX_COORDS_RE.replace_all(&without_tags, "");
    without_boxes
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

pub trait Recognizer: Send + Sync {
    /// Engine or model name recorded as the log producer.
    fn producer(&self) -> &str;

    fn recognize(&self, subject: &Path) -> Result<RecognizerOutput, ExtractError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DumpFile {
    Scored { tokens: Vec<(String, f64)> },
    Generated { text: String },
}

/// Load one recorded recognizer output.
pub fn load_dump(path: &Path) -> Result<RecognizerOutput, ExtractError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| ExtractError::BackendFailure(format!("cannot read {}: {e}", path.display())))?;
    let dump: DumpFile = serde_json::from_str(&raw)
        .map_err(|e| ExtractError::BackendFailure(format!("bad dump {}: {e}", path.display())))?;
    Ok(match dump {
        DumpFile::Scored { tokens } => RecognizerOutput::Scored(tokens),
        DumpFile::Generated { text } => RecognizerOutput::Generated(text),
    })
}

/// Replays output recorded earlier from some engine, read from
/// `<dir>/<subject file name>.json`.
pub struct DumpRecognizer {
    producer: String,
    dir: PathBuf,
}

impl DumpRecognizer {
    pub fn new(producer: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        DumpRecognizer {
            producer: producer.into(),
            dir: dir.into(),
        }
    }

    fn dump_path(&self, subject: &Path) -> Option<PathBuf> {
        let name = subject.file_name()?.to_string_lossy();
        Some(self.dir.join(format!("{name}.json")))
    }
}

impl Recognizer for DumpRecognizer {
    fn producer(&self) -> &str {
        &self.producer
    }

    fn recognize(&self, subject: &Path) -> Result<RecognizerOutput, ExtractError> {
        let path = self
            .dump_path(subject)
            .ok_or_else(|| ExtractError::BackendFailure(format!("no file name in {}", subject.display())))?;
        debug!(producer = %self.producer, dump = %path.display(), "replaying recognizer dump");
        load_dump(&path)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Runs the `tesseract` binary in TSV mode and keeps word-level confidences.
pub struct TesseractRecognizer {
    producer: String,
    language: String,
    timeout: Option<Duration>,
}

impl TesseractRecognizer {
    pub fn new(language: impl Into<String>) -> Self {
        TesseractRecognizer {
            producer: "Tesseract".to_string(),
            language: language.into(),
            timeout: None,
        }
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = producer.into();
        self
    }

    /// Kill the process if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl Recognizer for TesseractRecognizer {
    fn producer(&self) -> &str {
        &self.producer
    }

    fn recognize(&self, subject: &Path) -> Result<RecognizerOutput, ExtractError> {
        let mut command = Command::new("tesseract");
        command.arg(subject).arg("stdout").args(["-l", &self.language]).arg("tsv");
        let output = match self.timeout {
            Some(limit) => output_within(&mut command, limit).and_then(|out| {
                out.ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, format!("tesseract timed out after {limit:?}")))
            }),
            None => command.output(),
        };

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                Ok(RecognizerOutput::Scored(parse_tesseract_tsv(&stdout)))
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(ExtractError::BackendFailure(format!("tesseract failed: {}", stderr.trim())))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ExtractError::BackendFailure(
                "tesseract not found (install tesseract-ocr)".to_string(),
            )),
            Err(e) => Err(ExtractError::BackendFailure(e.to_string())),
        }
    }
}

/// Run `command` to completion, or kill it once `limit` has passed and
/// return `None`. Both pipes are drained on their own threads so a chatty
/// child cannot stall on a full pipe.
pub fn output_within(command: &mut Command, limit: Duration) -> io::Result<Option<Output>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let started = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if started.elapsed() < limit => thread::sleep(POLL_INTERVAL),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
    };

    Ok(Some(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    }))
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

/// Word rows (level 5) of tesseract's TSV output as `(text, confidence)`,
/// confidence rescaled from 0-100 to 0-1.
pub fn parse_tesseract_tsv(tsv: &str) -> Vec<(String, f64)> {
    tsv.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split('\t').collect();
            if cols.len() < 12 || cols[0] != "5" {
                return None;
            }
            let conf: f64 = cols[10].trim().parse().ok()?;
            let text = cols[11].trim();
            if conf < 0.0 || text.is_empty() {
                return None;
            }
            Some((text.to_string(), (conf / 100.0).clamp(0.0, 1.0)))
        })
        .collect()
}

// ── Tests ──
