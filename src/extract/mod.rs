pub mod classify;
pub mod normalize;

use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ExtractError;
use crate::recognizer::RecognizerOutput;
use classify::{classify, AddressFields};
use normalize::normalize;

/// Time budget for one extraction, checked between tokens.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Deadline {
            started: Instant::now(),
            budget: Some(budget),
        }
    }

    pub fn none() -> Self {
        Deadline {
            started: Instant::now(),
            budget: None,
        }
    }

    pub fn check(&self) -> Result<(), ExtractError> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(ExtractError::ClassificationTimeout { budget })
            }
            _ => Ok(()),
        }
    }
}

/// Uniform per-subject output, whichever recognizer produced the tokens.
///
/// Fields are private so every instance goes through `success`/`failure`:
/// a result carrying an error never carries address fields or confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    #[serde(rename = "filename")]
    subject_id: String,
    street_number: Option<String>,
    street_name: Option<String>,
    unit_number: Option<String>,
    confidence: f64,
    processing_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ExtractionResult {
    pub fn success(
        subject_id: impl Into<String>,
        fields: AddressFields,
        confidence: f64,
        processing_time: f64,
    ) -> Self {
        ExtractionResult {
            subject_id: subject_id.into(),
            street_number: fields.street_number,
            street_name: fields.street_name,
            unit_number: fields.unit_number,
            confidence: round3(confidence.clamp(0.0, 1.0)),
            processing_time: seconds(processing_time),
            error: None,
        }
    }

    pub fn failure(subject_id: impl Into<String>, error: impl ToString, processing_time: f64) -> Self {
        ExtractionResult {
            subject_id: subject_id.into(),
            street_number: None,
            street_name: None,
            unit_number: None,
            confidence: 0.0,
            processing_time: seconds(processing_time),
            error: Some(error.to_string()),
        }
    }

    /// Decode the external representation leniently: missing keys default,
    /// numeric field values are rendered as text, and an `error` key forces
    /// the failure shape.
    pub fn from_payload(subject: &str, payload: &Map<String, Value>) -> Self {
        let processing_time = payload
            .get("processing_time")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        if let Some(error) = payload.get("error").filter(|v| !v.is_null()) {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return ExtractionResult::failure(subject, message, processing_time);
        }

        let fields = AddressFields {
            street_number: field_text(payload, "street_number"),
            street_name: field_text(payload, "street_name"),
            unit_number: field_text(payload, "unit_number"),
        };
        let confidence = payload
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        ExtractionResult::success(subject, fields, confidence, processing_time)
    }

    pub fn with_processing_time(mut self, processing_time: f64) -> Self {
        self.processing_time = seconds(processing_time);
        self
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn street_number(&self) -> Option<&str> {
        self.street_number.as_deref()
    }

    pub fn street_name(&self) -> Option<&str> {
        self.street_name.as_deref()
    }

    pub fn unit_number(&self) -> Option<&str> {
        self.unit_number.as_deref()
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn processing_time(&self) -> f64 {
        self.processing_time
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    pub fn has_any_field(&self) -> bool {
        self.street_number.is_some() || self.street_name.is_some() || self.unit_number.is_some()
    }
}

fn field_text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    match payload.get(key)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn seconds(value: f64) -> f64 {
    if value.is_finite() {
        round3(value.max(0.0))
    } else {
        0.0
    }
}

/// Normalize and classify one recognizer output into an `ExtractionResult`.
///
/// Never fails: errors and panics inside normalization or classification are
/// folded into the result's `error`. A timed-out attempt keeps none of its
/// partial fields.
pub fn extract(
    subject_id: &str,
    output: &RecognizerOutput,
    threshold: f64,
    deadline: Deadline,
) -> ExtractionResult {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| extract_fields(output, threshold, &deadline)));
    let elapsed = started.elapsed().as_secs_f64();

    match outcome {
        Ok(Ok((fields, confidence))) => {
            debug!(subject = subject_id, ?fields, "extracted");
            ExtractionResult::success(subject_id, fields, confidence, elapsed)
        }
        Ok(Err(err)) => {
            warn!(subject = subject_id, error = %err, "extraction failed");
            ExtractionResult::failure(subject_id, err, elapsed)
        }
        Err(payload) => {
            let err = ExtractError::Internal(panic_message(payload.as_ref()));
            warn!(subject = subject_id, error = %err, "extraction panicked");
            ExtractionResult::failure(subject_id, err, elapsed)
        }
    }
}

fn extract_fields(
    output: &RecognizerOutput,
    threshold: f64,
    deadline: &Deadline,
) -> Result<(AddressFields, f64), ExtractError> {
    let tokens = output.tokens();
    if tokens.is_empty() {
        return Err(ExtractError::EmptyOutput);
    }
    let stream = normalize(&tokens, threshold, deadline)?;
    let fields = classify(&stream, deadline)?;
    Ok((fields, stream.confidence()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ── Tests ──
