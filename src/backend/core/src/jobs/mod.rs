//! Generation job lifecycle.
//!
//! A job is a pre-paid batch of image generation units. It is created in
//! `pending`, claimed into `processing` exclusively by the [`JobScheduler`],
//! executed end-to-end by the [`JobWorker`] (generate → upload → settle), and
//! finishes in one of three terminal states. The recovery sweep is the only
//! path back from `processing` to `pending`.
//!
//! ```text
//!  pending ──claim──▶ processing ──▶ success | partial_success | failed
//!     ▲                   │
//!     └── recovery sweep ─┘   (heartbeat older than the processing timeout)
//! ```

pub mod scheduler;
pub mod worker;

pub use scheduler::{JobScheduler, SchedulerHandle};
pub use worker::{JobWorker, WorkerHandle};

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a scheduler claim
    Pending,
    /// Claimed and being executed by a worker
    Processing,
    /// All requested units completed
    Success,
    /// Some but not all units completed; the difference was refunded
    PartialSuccess,
    /// No units completed; the full charge was refunded
    Failed,
}

impl JobStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "success" => Some(Self::Success),
            "partial_success" => Some(Self::PartialSuccess),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal status for a finished job given how many units completed.
    pub fn classify(expected_units: i32, actual_units: i32) -> Self {
        if actual_units <= 0 {
            Self::Failed
        } else if actual_units < expected_units {
            Self::PartialSuccess
        } else {
            Self::Success
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Spec
// ═══════════════════════════════════════════════════════════════════════════════

/// What a job asks the generation API to produce, keyed by category.
///
/// One concrete struct per category; unknown categories fail
/// deserialization instead of passing through as loose fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum JobSpec {
    /// Plain prompt-to-image generation.
    TextToImage {
        prompt: String,
        /// Output size, e.g. "1024x1024"
        size: String,
    },
    /// Generation guided by uploaded reference images.
    ImageToImage {
        prompt: String,
        /// Public URLs of the reference images
        reference_images: Vec<String>,
        size: String,
    },
}

impl JobSpec {
    pub fn prompt(&self) -> &str {
        match self {
            Self::TextToImage { prompt, .. } => prompt,
            Self::ImageToImage { prompt, .. } => prompt,
        }
    }

    pub fn size(&self) -> &str {
        match self {
            Self::TextToImage { size, .. } => size,
            Self::ImageToImage { size, .. } => size,
        }
    }

    pub fn reference_images(&self) -> &[String] {
        match self {
            Self::TextToImage { .. } => &[],
            Self::ImageToImage { reference_images, .. } => reference_images,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Per-Unit Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// The pipeline stage where a unit was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStage {
    Generate,
    Upload,
}

impl fmt::Display for UnitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generate => f.write_str("generate"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

/// One failed unit, kept at its original request index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitError {
    /// Original request index of the unit
    pub index: usize,
    /// Stage that failed
    pub stage: UnitStage,
    /// Failure reason (last attempt)
    pub reason: String,
    /// Attempts spent before giving up
    pub attempts: u32,
}

/// Build the human-readable error summary stored on the job row.
pub fn summarize_unit_errors(errors: &[UnitError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let generate = errors.iter().filter(|e| e.stage == UnitStage::Generate).count();
    let upload = errors.len() - generate;

    let mut parts = Vec::new();
    if generate > 0 {
        parts.push(format!("{} generation", generate));
    }
    if upload > 0 {
        parts.push(format!("{} upload", upload));
    }
    Some(format!(
        "{} unit(s) failed ({})",
        errors.len(),
        parts.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Success,
            JobStatus::PartialSuccess,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("cancelled"), None);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::PartialSuccess.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_classify() {
        assert_eq!(JobStatus::classify(4, 4), JobStatus::Success);
        assert_eq!(JobStatus::classify(4, 3), JobStatus::PartialSuccess);
        assert_eq!(JobStatus::classify(4, 1), JobStatus::PartialSuccess);
        assert_eq!(JobStatus::classify(4, 0), JobStatus::Failed);
    }

    #[test]
    fn test_job_spec_tagged_serialization() {
        let spec = JobSpec::ImageToImage {
            prompt: "a watercolor fox".to_string(),
            reference_images: vec!["https://cdn.example/ref1.png".to_string()],
            size: "1024x1024".to_string(),
        };

        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["category"], "image_to_image");

        let back: JobSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);

        // Unknown categories are rejected, not silently accepted.
        let bad = serde_json::json!({"category": "inpainting", "prompt": "x"});
        assert!(serde_json::from_value::<JobSpec>(bad).is_err());
    }

    #[test]
    fn test_summarize_unit_errors() {
        assert_eq!(summarize_unit_errors(&[]), None);

        let errors = vec![
            UnitError {
                index: 0,
                stage: UnitStage::Generate,
                reason: "upstream timeout".to_string(),
                attempts: 3,
            },
            UnitError {
                index: 2,
                stage: UnitStage::Upload,
                reason: "storage rejected".to_string(),
                attempts: 1,
            },
        ];
        let summary = summarize_unit_errors(&errors).unwrap();
        assert!(summary.contains("2 unit(s) failed"));
        assert!(summary.contains("1 generation"));
        assert!(summary.contains("1 upload"));
    }
}
