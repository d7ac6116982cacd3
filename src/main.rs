use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use pod_recognize::batch::{self, BatchOptions};
use pod_recognize::benchlog::{compact_log, LogWriter, ResultAggregator, ResumeIndex, ResumePolicy};
use pod_recognize::config::Settings;
use pod_recognize::extract::{extract, Deadline};
use pod_recognize::recognizer::{load_dump, DumpRecognizer, Recognizer, TesseractRecognizer};
use pod_recognize::utils::{format_duration, truncate};

#[derive(Parser)]
#[command(name = "pod_recognize", about = "Street address extraction from proof-of-delivery images")]
struct Cli {
    /// Settings file (default: ./pod_recognize.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract address fields from one recorded recognizer output
    Extract {
        /// Dump file ({"tokens": [[text, conf], ...]} or {"text": "..."})
        dump: PathBuf,
        /// Producer name shown in the output
        #[arg(short, long, default_value = "dump")]
        producer: String,
        /// Confidence threshold for scored tokens
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Run every recognizer over a directory of images, appending to a log
    Run {
        /// Directory of .jpg/.jpeg/.png subjects
        #[arg(short, long)]
        images: PathBuf,
        /// Directory of recorded outputs (<dir>/<image name>.json); repeatable
        #[arg(long = "dumps")]
        dumps: Vec<PathBuf>,
        /// Producer name for the matching --dumps directory (default: directory name)
        #[arg(long = "producer")]
        producers: Vec<String>,
        /// Also run the local tesseract binary
        #[arg(long)]
        tesseract: bool,
        /// Log file to append to and resume from
        #[arg(short, long)]
        log: Option<PathBuf>,
        /// Retry subjects whose last logged attempt failed
        #[arg(long)]
        retry_failed: bool,
        /// Confidence threshold for scored tokens
        #[arg(short, long)]
        threshold: Option<f64>,
    },
    /// Per-producer statistics for a benchmark log
    Stats {
        log: PathBuf,
    },
    /// Rewrite a log keeping only the latest entry per producer and subject
    Compact {
        log: PathBuf,
        /// Keep only these producers (repeatable; default: all)
        #[arg(short, long = "keep")]
        keep: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;
    info!(?settings, "settings loaded");

    let result = match cli.command {
        Commands::Extract { dump, producer, threshold } => {
            let threshold = checked_threshold(threshold, &settings)?;
            let output = load_dump(&dump)?;
            let subject = dump
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| dump.display().to_string());
            let result = extract(&subject, &output, threshold, Deadline::after(settings.timeout()));
            info!(producer = %producer, subject = %subject, "extracted");
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Run {
            images,
            dumps,
            producers,
            tesseract,
            log,
            retry_failed,
            threshold,
        } => {
            let threshold = checked_threshold(threshold, &settings)?;
            if producers.len() > dumps.len() {
                bail!("{} --producer names for {} --dumps directories", producers.len(), dumps.len());
            }

            let mut recognizers: Vec<Box<dyn Recognizer>> = Vec::new();
            for (i, dir) in dumps.iter().enumerate() {
                let name = producers.get(i).cloned().unwrap_or_else(|| {
                    dir.file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| dir.display().to_string())
                });
                recognizers.push(Box::new(DumpRecognizer::new(name, dir)));
            }
            if tesseract {
                recognizers.push(Box::new(
                    TesseractRecognizer::new(&settings.tesseract_language).with_timeout(settings.timeout()),
                ));
            }
            if recognizers.is_empty() {
                bail!("nothing to run: pass --dumps DIR and/or --tesseract");
            }

            let subjects = batch::discover_subjects(&images)
                .with_context(|| format!("reading {}", images.display()))?;
            if subjects.is_empty() {
                println!("No images found in {}.", images.display());
                return Ok(());
            }

            let log = log.unwrap_or_else(|| settings.default_log_path(chrono::Local::now()));
            let policy = if retry_failed {
                ResumePolicy::SuccessfulOnly
            } else {
                ResumePolicy::All
            };
            let done = ResumeIndex::from_log(&log, policy)?;
            let mut writer = LogWriter::open_append(&log)?;

            println!(
                "Running {} producers over {} images (log: {})...",
                recognizers.len(),
                subjects.len(),
                log.display()
            );
            let options = BatchOptions {
                threshold,
                budget: settings.timeout(),
                chunk_size: settings.chunk_size,
            };
            let summary = batch::run_batch(&recognizers, &subjects, &done, &mut writer, &options)?;
            println!(
                "Done: {} attempted ({} ok, {} errors), {} already logged.",
                summary.attempted, summary.succeeded, summary.failed, summary.skipped
            );
            Ok(())
        }
        Commands::Stats { log } => {
            let agg = ResultAggregator::from_log(&log)?;
            if agg.is_empty() {
                println!("No entries in {}.", log.display());
                return Ok(());
            }
            print_stats(&agg);
            Ok(())
        }
        Commands::Compact { log, keep } => {
            let summary = compact_log(&log, &keep)?;
            println!(
                "Compacted {}: {} entries read, {} kept, {} malformed blocks dropped.",
                log.display(),
                summary.scanned,
                summary.kept,
                summary.malformed
            );
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn checked_threshold(flag: Option<f64>, settings: &Settings) -> anyhow::Result<f64> {
    let threshold = flag.unwrap_or(settings.confidence_threshold);
    if !(0.0..=1.0).contains(&threshold) {
        bail!("threshold must be within [0, 1], got {threshold}");
    }
    Ok(threshold)
}

fn print_stats(agg: &ResultAggregator) {
    println!(
        "{:<24} | {:>5} | {:>4} | {:>8} | {:>8} | {:>8} | {:>5} | {:>6} | {:>6} | {:>6} | {:>6}",
        "Producer", "N", "Err", "Mean(s)", "Min(s)", "Max(s)", "Conf", "Num%", "Name%", "Unit%", "Any%"
    );
    println!("{}", "-".repeat(112));

    for s in agg.producer_stats() {
        println!(
            "{:<24} | {:>5} | {:>4} | {:>8.3} | {:>8.3} | {:>8.3} | {:>5.3} | {:>6.1} | {:>6.1} | {:>6.1} | {:>6.1}",
            truncate(&s.producer, 21),
            s.count,
            s.errors,
            s.mean_time,
            s.min_time,
            s.max_time,
            s.mean_confidence,
            s.street_number_rate,
            s.street_name_rate,
            s.unit_number_rate,
            s.any_field_rate,
        );
    }

    println!("\n{} subjects, {} entries", agg.subjects().len(), agg.len());
    if let Some(s) = agg.fastest_producer() {
        println!("Fastest:          {} ({:.3}s mean)", s.producer, s.mean_time);
    }
    if let Some(s) = agg.most_confident_producer() {
        println!("Most confident:   {} ({:.3} mean)", s.producer, s.mean_confidence);
    }
    if let Some(s) = agg.best_detection_producer() {
        println!("Best detection:   {} ({:.1}% with number or name)", s.producer, s.number_or_name_rate);
    }
}
