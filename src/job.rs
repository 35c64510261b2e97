//! Job records, one per submitted file.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{engines::GrammarIssue, error::JobError, prelude::*};

/// An opaque, unique job identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh, random identifier.
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
        self.0.fmt(f)
    }
}

/// Where the bytes for a job come from.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSource {
    /// A file on the local file system.
    Path { path: PathBuf },

    /// Data which has already been loaded into memory, such as an upload.
    Memory {
        name: String,
        #[serde(skip)]
        data: Arc<[u8]>,
    },
}

impl JobSource {
    /// A short human-readable name for this source.
    pub fn display_name(&self) -> String {
        match self {
            JobSource::Path { path } => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            JobSource::Memory { name, .. } => name.clone(),
        }
    }

    /// The file extension of this source, if any.
    pub fn extension(&self) -> Option<String> {
        let path = match self {
            JobSource::Path { path } => path.as_path(),
            JobSource::Memory { name, .. } => Path::new(name),
        };
        path.extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    }
}

/// The lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Error,
    Paused,
    Cancelled,
}

impl JobStatus {
    /// All statuses, in display order.
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Error,
        JobStatus::Paused,
        JobStatus::Cancelled,
    ];
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
            JobStatus::Paused => "paused",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// The stage of processing at which a job failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Validate,
    Extract,
    Grammar,
    Policy,
}

impl fmt::Display for FailureStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureStage::Validate => "validate",
            FailureStage::Extract => "extract",
            FailureStage::Grammar => "grammar",
            FailureStage::Policy => "policy",
        };
        f.write_str(name)
    }
}

/// What went wrong with a failed job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobFailure {
    /// Where the failure happened.
    pub stage: FailureStage,
    /// The classified error.
    pub error: JobError,
    /// A human-readable message.
    pub message: String,
}

impl From<JobError> for JobFailure {
    fn from(error: JobError) -> Self {
        Self {
            stage: error.stage(),
            message: error.to_string(),
            error,
        }
    }
}

/// The output of a successful job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Text returned by the recognizer.
    pub extracted_text: String,
    /// Text after grammar corrections. Equal to `extracted_text` unless
    /// auto-correct was enabled.
    pub corrected_text: String,
    /// Number of grammar issues found.
    pub error_count: usize,
    /// The grammar issues themselves.
    pub grammar_issues: Vec<GrammarIssue>,
    /// Recognizer confidence, from 0.0 to 1.0.
    pub confidence: f32,
    /// Number of words in the extracted text.
    pub word_count: usize,
    /// Which recognizer produced the text.
    pub engine_id: String,
    /// Wall-clock processing time, in seconds.
    pub processing_time: f64,
}

/// A claim token handed out when a job starts processing. Results carrying an
/// older token are discarded.
pub(crate) type Lease = u64;

/// A single job in the queue.
#[derive(Clone, Debug, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub source: JobSource,
    /// Display name, usually the file name.
    pub name: String,
    /// Size in bytes at submission time, or 0 if unknown.
    pub size: u64,
    pub mime_hint: Option<String>,
    pub status: JobStatus,
    /// Percentage from 0 to 100.
    pub progress: u8,
    /// 1-based position in the queue.
    pub queue_position: usize,
    pub retry_count: u32,
    pub result: Option<JobResult>,
    pub failure: Option<JobFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub(crate) lease: Option<Lease>,
}

impl JobRecord {
    /// Create a pending job for a file on disk.
    ///
    /// A missing file is not an error here. It will fail validation when the
    /// job runs.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let mime_hint = mime_guess::from_path(&path)
            .first()
            .map(|mime| mime.essence_str().to_owned());
        Self::new(JobSource::Path { path }, size, mime_hint)
    }

    /// Create a pending job for in-memory data.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let name = name.into();
        let data = data.into();
        let mime_hint = mime_guess::from_path(&name)
            .first()
            .map(|mime| mime.essence_str().to_owned());
        let size = data.len() as u64;
        Self::new(JobSource::Memory { name, data }, size, mime_hint)
    }

    fn new(source: JobSource, size: u64, mime_hint: Option<String>) -> Self {
        Self {
            id: JobId::new(),
            name: source.display_name(),
            source,
            size,
            mime_hint,
            status: JobStatus::Pending,
            progress: 0,
            queue_position: 0,
            retry_count: 0,
            result: None,
            failure: None,
            started_at: None,
            ended_at: None,
            lease: None,
        }
    }

    /// Reset this record to a fresh pending state, keeping its identity,
    /// source and retry count.
    pub(crate) fn reset_to_pending(&mut self) {
        self.status = JobStatus::Pending;
        self.progress = 0;
        self.result = None;
        self.failure = None;
        self.started_at = None;
        self.ended_at = None;
        self.lease = None;
    }
}
