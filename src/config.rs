use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::extract::normalize::DEFAULT_THRESHOLD;

/// Runtime settings: built-in defaults, then `pod_recognize.toml` (if
/// present), then `POD_*` environment variables. CLI flags override these.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    pub confidence_threshold: f64,
    pub timeout_secs: f64,
    pub chunk_size: usize,
    pub log_dir: PathBuf,
    pub tesseract_language: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            confidence_threshold: DEFAULT_THRESHOLD,
            timeout_secs: 30.0,
            chunk_size: 64,
            log_dir: PathBuf::from("logs"),
            tesseract_language: "eng".to_string(),
        }
    }
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => File::from(path).required(true),
            None => File::with_name("pod_recognize").required(false),
        };
        Self::build(Some(file), true)
    }

    fn build(file: Option<File<config::FileSourceFile, config::FileFormat>>, env: bool) -> Result<Self, ConfigError> {
        let defaults = Settings::default();
        let mut builder = Config::builder()
            .set_default("confidence_threshold", defaults.confidence_threshold)?
            .set_default("timeout_secs", defaults.timeout_secs)?
            .set_default("chunk_size", defaults.chunk_size as i64)?
            .set_default("log_dir", defaults.log_dir.to_string_lossy().to_string())?
            .set_default("tesseract_language", defaults.tesseract_language)?;
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        if env {
            builder = builder.add_source(Environment::with_prefix("POD").try_parsing(true));
        }

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Message(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if !(self.timeout_secs.is_finite() && self.timeout_secs > 0.0) {
            return Err(ConfigError::Message(format!(
                "timeout_secs must be positive, got {}",
                self.timeout_secs
            )));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Message("chunk_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs)
    }

    /// `<log_dir>/benchmark_<YYYYmmdd_HHMMSS>_results.log`
    pub fn default_log_path<Tz: TimeZone>(&self, now: DateTime<Tz>) -> PathBuf
    where
        Tz::Offset: std::fmt::Display,
    {
        self.log_dir
            .join(format!("benchmark_{}_results.log", now.format("%Y%m%d_%H%M%S")))
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::build(None, false).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "confidence_threshold = 0.8\nchunk_size = 8\nlog_dir = \"out\"").unwrap();
        let settings = Settings::build(Some(File::from(file.path()).required(true)), false).unwrap();
        assert_eq!(settings.confidence_threshold, 0.8);
        assert_eq!(settings.chunk_size, 8);
        assert_eq!(settings.log_dir, PathBuf::from("out"));
        assert_eq!(settings.tesseract_language, "eng");
    }

    #[test]
    fn invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "confidence_threshold = 1.5").unwrap();
        let err = Settings::build(Some(File::from(file.path()).required(true)), false).unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));

        let zero_timeout = Settings {
            timeout_secs: 0.0,
            ..Settings::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_chunk = Settings {
            chunk_size: 0,
            ..Settings::default()
        };
        assert!(zero_chunk.validate().is_err());
    }

    #[test]
    fn log_path_is_timestamped() {
        let now = Utc.with_ymd_and_hms(2025, 3, 7, 14, 5, 9).unwrap();
        let path = Settings::default().default_log_path(now);
        assert_eq!(path, PathBuf::from("logs/benchmark_20250307_140509_results.log"));
    }
}
