use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{info, warn};

use crate::benchlog::resume::ResumeIndex;
use crate::benchlog::writer::{validate_key, LogWriter};
use crate::error::LogError;
use crate::extract::{extract, Deadline, ExtractionResult};
use crate::recognizer::Recognizer;
use crate::utils::{is_image_file, natural_cmp};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub path: PathBuf,
}

/// Image files directly under `dir`, in natural order of file name.
pub fn discover_subjects(dir: &Path) -> std::io::Result<Vec<Subject>> {
    let mut subjects = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !is_image_file(&path) {
            continue;
        }
        let Some(id) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            warn!(path = %path.display(), "skipping non-UTF-8 file name");
            continue;
        };
        if validate_key("-", &id).is_err() {
            warn!(subject = %id, "skipping subject id that cannot be logged");
            continue;
        }
        subjects.push(Subject { id, path });
    }
    subjects.sort_by(|a, b| natural_cmp(&a.id, &b.id));
    Ok(subjects)
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub threshold: f64,
    pub budget: Duration,
    pub chunk_size: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub attempted: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Recognize and extract one subject. Recognition time counts towards the
/// recorded processing time; the classification budget starts afterwards.
pub fn extract_subject(recognizer: &dyn Recognizer, subject: &Subject, options: &BatchOptions) -> ExtractionResult {
    let started = Instant::now();
    let result = match recognizer.recognize(&subject.path) {
        Ok(output) => extract(&subject.id, &output, options.threshold, Deadline::after(options.budget)),
        Err(err) => {
            warn!(producer = recognizer.producer(), subject = %subject.id, error = %err, "recognition failed");
            ExtractionResult::failure(&subject.id, err, 0.0)
        }
    };
    result.with_processing_time(started.elapsed().as_secs_f64())
}

/// Run every recognizer over every subject not already in `done`, appending
/// one block per attempt. Extraction runs in parallel per chunk; this thread
/// owns the writer, so appends are serialized in subject order.
pub fn run_batch(
    recognizers: &[Box<dyn Recognizer>],
    subjects: &[Subject],
    done: &ResumeIndex,
    writer: &mut LogWriter,
    options: &BatchOptions,
) -> Result<BatchSummary, LogError> {
    let mut summary = BatchSummary::default();

    for recognizer in recognizers {
        let producer = recognizer.producer();
        let pending: Vec<&Subject> = subjects
            .iter()
            .filter(|s| !done.contains(producer, &s.id))
            .collect();
        summary.skipped += subjects.len() - pending.len();
        info!(producer, pending = pending.len(), skipped = subjects.len() - pending.len(), "starting producer");
        if pending.is_empty() {
            continue;
        }

        let pb = ProgressBar::new(pending.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} {msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_message(producer.to_string());

        for chunk in pending.chunks(options.chunk_size.max(1)) {
            let results: Vec<ExtractionResult> = chunk
                .par_iter()
                .map(|subject| extract_subject(recognizer.as_ref(), subject, options))
                .collect();

            for result in &results {
                writer.append_result(producer, result)?;
                summary.attempted += 1;
                if result.is_failure() {
                    summary.failed += 1;
                } else {
                    summary.succeeded += 1;
                }
            }
            pb.inc(chunk.len() as u64);
        }

        pb.finish_and_clear();
    }

    Ok(summary)
}

// ── Tests ──
