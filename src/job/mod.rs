//! Job data model
//!
//! Types shared between the admission engine, the slot pool, and the
//! server transport: the immutable description received from the server,
//! the mutable lifecycle record kept by the ledger, and the result shapes
//! reported back.

pub mod capability;
pub mod ocr;
pub mod pdf;

pub use capability::{
    CapabilityError, CapabilityRegistry, JobCapability, JobContext, JobWorkspace, ProgressFn,
};
pub use ocr::OcrCapability;
pub use pdf::PdfParseCapability;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_priority() -> i64 {
    5
}

fn default_timeout_seconds() -> u64 {
    3600
}

/// A unit of work as assigned by the server.
///
/// Immutable once admitted. Unknown fields in the server payload are
/// ignored; missing optional fields take the documented defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Server-assigned identifier, unique for the lifetime of this node.
    pub job_id: String,

    /// Key into the capability registry ("ocr", "pdf_parse", ...).
    pub job_type: String,

    /// Advisory only. Dispatch order is strictly FIFO.
    #[serde(default = "default_priority")]
    pub priority: i64,

    /// Wall-clock budget for execution. Expiry abandons the run and
    /// reports a timeout failure.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    /// Opaque payload interpreted by the capability.
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,
}

impl JobSpec {
    /// Creates a spec with default priority and timeout.
    #[must_use]
    pub fn new(job_id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            priority: default_priority(),
            timeout_seconds: default_timeout_seconds(),
            parameters: serde_json::Map::new(),
        }
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    /// Sets a parameter value.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }
}

/// Lifecycle state of a job on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Admitted, waiting for a free slot.
    Queued,
    /// Occupying a slot.
    Processing,
    /// Finished successfully, result pending report.
    Completed,
    /// Finished with an error, failure result pending report.
    Failed,
}

impl JobStatus {
    /// Wire representation, matching the serde rename.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns true for the two terminal states.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A spec plus the mutable lifecycle fields the ledger tracks for it.
///
/// Owned exclusively by the ledger; mutated only through its
/// synchronized accessors.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// The admitted spec.
    pub spec: JobSpec,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Set when the job enters a slot.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the job reaches a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Completion percentage, clamped to 0..=100.
    pub progress: u8,
    /// Failure message for jobs that ended in `Failed`.
    pub error: Option<String>,
}

impl JobRecord {
    /// Creates a freshly admitted record in the `Queued` state.
    #[must_use]
    pub fn queued(spec: JobSpec) -> Self {
        Self {
            spec,
            status: JobStatus::Queued,
            started_at: None,
            finished_at: None,
            progress: 0,
            error: None,
        }
    }

    /// The job identifier.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.spec.job_id
    }
}

/// Timing block attached to every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStats {
    /// Wall-clock execution time.
    pub processing_time_seconds: f64,
    /// When the slot started the job.
    pub start_time: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub end_time: DateTime<Utc>,
}

impl ProcessingStats {
    /// Builds stats from a start/end pair.
    #[must_use]
    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let elapsed = (end - start).num_milliseconds() as f64 / 1000.0;
        Self {
            processing_time_seconds: elapsed.max(0.0),
            start_time: start,
            end_time: end,
        }
    }
}

/// Failure description carried by a failed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Human-readable failure message.
    pub message: String,
    /// Structured context: job id, type, parameters, error time.
    pub details: Value,
}

/// Outcome of one job execution, held until the server acknowledges it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    /// `Completed` or `Failed`.
    pub status: JobStatus,
    /// Capability output, present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description, present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Timing of the execution.
    pub processing_stats: ProcessingStats,
}

impl JobResult {
    /// Builds a successful result.
    #[must_use]
    pub fn completed(payload: Value, stats: ProcessingStats) -> Self {
        Self {
            status: JobStatus::Completed,
            result: Some(payload),
            error: None,
            processing_stats: stats,
        }
    }

    /// Builds a failed result with a message and a structured detail blob.
    #[must_use]
    pub fn failed(message: impl Into<String>, details: Value, stats: ProcessingStats) -> Self {
        Self {
            status: JobStatus::Failed,
            result: None,
            error: Some(JobError {
                message: message.into(),
                details,
            }),
            processing_stats: stats,
        }
    }

    /// Returns true for a `Completed` result.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Builds the detail blob attached to failure results.
#[must_use]
pub fn error_details(spec: &JobSpec) -> Value {
    serde_json::json!({
        "job_id": spec.job_id,
        "job_type": spec.job_type,
        "parameters": spec.parameters,
        "error_time": Utc::now().to_rfc3339(),
    })
}

/// Character budget for inline text previews in results and payloads.
pub const TEXT_PREVIEW_LIMIT: usize = 10_000;

/// Caps `text` at `max_chars` characters, appending a truncation marker
/// when anything was cut.
#[must_use]
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut preview: String = text.chars().take(max_chars).collect();
        preview.push_str("... [truncated]");
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_spec_defaults_on_deserialize() {
        let spec: JobSpec =
            serde_json::from_str(r#"{"job_id":"j-1","job_type":"ocr"}"#).unwrap();
        assert_eq!(spec.priority, 5);
        assert_eq!(spec.timeout_seconds, 3600);
        assert!(spec.parameters.is_empty());
    }

    #[test]
    fn test_job_spec_explicit_fields() {
        let spec: JobSpec = serde_json::from_value(json!({
            "job_id": "j-2",
            "job_type": "pdf_parse",
            "priority": 9,
            "timeout_seconds": 120,
            "parameters": {"input_file": "doc.pdf"}
        }))
        .unwrap();
        assert_eq!(spec.priority, 9);
        assert_eq!(spec.timeout_seconds, 120);
        assert_eq!(spec.parameters["input_file"], json!("doc.pdf"));
    }

    #[test]
    fn test_job_status_wire_names() {
        assert_eq!(serde_json::to_value(JobStatus::Queued).unwrap(), "queued");
        assert_eq!(
            serde_json::to_value(JobStatus::Processing).unwrap(),
            "processing"
        );
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }

    #[test]
    fn test_completed_result_shape() {
        let start = Utc::now();
        let end = start + chrono::Duration::seconds(2);
        let result = JobResult::completed(
            json!({"text_content": "hello"}),
            ProcessingStats::between(start, end),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "completed");
        assert_eq!(value["result"]["text_content"], "hello");
        assert!(value.get("error").is_none());
        assert!((value["processing_stats"]["processing_time_seconds"].as_f64().unwrap() - 2.0).abs() < 0.01);
    }

    #[test]
    fn test_failed_result_shape() {
        let spec = JobSpec::new("j-3", "ocr");
        let now = Utc::now();
        let result = JobResult::failed(
            "tool exploded",
            error_details(&spec),
            ProcessingStats::between(now, now),
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["status"], "failed");
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["message"], "tool exploded");
        assert_eq!(value["error"]["details"]["job_id"], "j-3");
        assert_eq!(value["error"]["details"]["job_type"], "ocr");
    }

    #[test]
    fn test_record_starts_queued() {
        let record = JobRecord::queued(JobSpec::new("j-4", "ocr"));
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!(record.progress, 0);
        assert!(record.started_at.is_none());
        assert_eq!(record.job_id(), "j-4");
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("exact", 5), "exact");
        assert_eq!(truncate_text("abcdef", 3), "abc... [truncated]");

        let long = "x".repeat(TEXT_PREVIEW_LIMIT + 1);
        let preview = truncate_text(&long, TEXT_PREVIEW_LIMIT);
        assert!(preview.ends_with("... [truncated]"));
        assert_eq!(
            preview.chars().count(),
            TEXT_PREVIEW_LIMIT + "... [truncated]".len()
        );
    }
}
