//! Address extraction from proof-of-delivery images, and the benchmark log
//! that records one result per `(producer, subject)` across runs.

pub mod batch;
pub mod benchlog;
pub mod config;
pub mod error;
pub mod extract;
pub mod recognizer;
pub mod utils;

pub use error::{ExtractError, LogError};
pub use extract::{extract, Deadline, ExtractionResult};
pub use recognizer::{Recognizer, RecognizerOutput};
