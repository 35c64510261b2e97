//! Error types which callers are expected to match on.
//!
//! Most internal plumbing uses [`anyhow`], but job failures and refused engine
//! operations are part of our public contract, so they get real types.

use thiserror::Error;

use crate::{
    job::{FailureStage, JobId, JobStatus},
    prelude::*,
};

/// Why a single job failed.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The source was missing, unreadable or empty.
    #[error("file is missing or unreadable: {reason}")]
    Unreadable { reason: String },

    /// Extraction succeeded, but found nothing but whitespace.
    #[error("no text found in file")]
    NoTextFound,

    /// The recognizer reported an error.
    #[error("text extraction failed: {reason}")]
    ExtractionEngineFailure { reason: String },

    /// The grammar checker reported an error.
    #[error("grammar checker unavailable: {reason}")]
    CheckerUnavailable { reason: String },

    /// Automatic retries were attempted and all of them failed.
    #[error("Maximum retries exceeded")]
    MaxRetriesExceeded {
        /// The message from the last failed attempt.
        last_error: String,
    },
}

impl JobError {
    /// Which stage of processing produced this error?
    pub fn stage(&self) -> FailureStage {
        match self {
            JobError::Unreadable { .. } => FailureStage::Validate,
            JobError::NoTextFound | JobError::ExtractionEngineFailure { .. } => {
                FailureStage::Extract
            }
            JobError::CheckerUnavailable { .. } => FailureStage::Grammar,
            JobError::MaxRetriesExceeded { .. } => FailureStage::Policy,
        }
    }
}

/// An operation on the engine was refused, leaving all state unchanged.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("a batch run is already in progress")]
    AlreadyRunning,

    #[error("there are no pending jobs to run")]
    NothingPending,

    #[error("the batch run is not running")]
    NotRunning,

    #[error("the batch run is not paused")]
    NotPaused,

    #[error("no batch run is active")]
    Idle,

    #[error("job {0} is being processed and cannot be removed")]
    JobBusy(JobId),

    #[error("cannot clear all jobs while a batch run is active")]
    ClearWhileRunning,

    #[error("cannot change settings while a batch run is active")]
    SettingsLocked,

    #[error("unknown job {0}")]
    UnknownJob(JobId),

    #[error("job {id} is {status}, and only failed jobs can be retried")]
    NotRetryable { id: JobId, status: JobStatus },
}
