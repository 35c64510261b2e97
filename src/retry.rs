//! Job-level retry policy.
//!
//! When a job fails, [`decide`] says whether the scheduler should put it back in
//! the queue. This is a pure function. The scheduler is responsible for
//! waiting out any delay and requeueing the record.

use std::time::Duration;

use crate::job::{JobRecord, JobStatus};

pub mod transient;

/// What to do with a failed job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the job immediately.
    RetryNow,
    /// Requeue the job after waiting.
    RetryAfterDelay(Duration),
    /// Leave the job failed.
    GiveUp {
        /// Were automatic retries attempted and used up? If so, the failure
        /// message should say so.
        exhausted: bool,
    },
}

/// Decide whether to automatically retry a failed job.
///
/// Records which are not failed are never retried.
pub fn decide(
    record: &JobRecord,
    max_retries: u32,
    auto_retry_enabled: bool,
    retry_delay: Duration,
) -> RetryDecision {
    if record.status != JobStatus::Error || !auto_retry_enabled {
        return RetryDecision::GiveUp { exhausted: false };
    }
    if record.retry_count >= max_retries {
        return RetryDecision::GiveUp {
            exhausted: record.retry_count > 0,
        };
    }
    if retry_delay.is_zero() {
        RetryDecision::RetryNow
    } else {
        RetryDecision::RetryAfterDelay(retry_delay)
    }
}
