//! Retries for transient failures when talking to remote services.
//!
//! This is separate from the job-level retry policy. It handles things like a
//! 503 from an OCR backend by backing off and trying the same request again,
//! before the job itself is ever marked as failed.

use keen_retry::{ResolvedResult, RetryResult};
use reqwest::StatusCode;

use crate::prelude::*;

/// On error, return a [`RetryResult::Fatal`] value.
macro_rules! try_fatal {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

/// On error, return either a [`RetryResult::Transient`] or [`RetryResult::Fatal`]
/// value, depending on the return value of [`IsKnownTransient::is_known_transient`].
macro_rules! try_potentially_transient {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) if IsKnownTransient::is_known_transient(&error) => {
                debug!("Potentially transient error: {:?}", error);
                return ::keen_retry::RetryResult::Transient {
                    input: (),
                    error: From::from(error),
                };
            }
            Err(error) => {
                return ::keen_retry::RetryResult::Fatal {
                    input: (),
                    error: From::from(error),
                };
            }
        }
    };
}

// Here's a trick to export a macro within a crate as if it were a normal
// symbol.
pub(crate) use {try_fatal, try_potentially_transient};

/// Build an [`RetryResult::Ok`] value.
pub(crate) fn retry_result_ok<T, E>(output: T) -> RetryResult<(), (), T, E> {
    RetryResult::Ok {
        reported_input: (),
        output,
    }
}

/// Build an [`RetryResult::Fatal`] value.
pub(crate) fn retry_result_fatal<T, E>(error: E) -> RetryResult<(), (), T, E> {
    RetryResult::Fatal { input: (), error }
}

/// Is this error a known transient error?
///
/// By default, we assume errors are not transient, until they're been observed
/// in the wild, investigated and determined to be transient. The prevents us
/// from doing large numbers of retries with exponential backoff on errors that
/// will never resolve.
pub trait IsKnownTransient {
    /// Is this error likely to be transient?
    fn is_known_transient(&self) -> bool;
}

impl IsKnownTransient for reqwest::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            status.is_known_transient()
        } else {
            // Assume all other kinds of HTTP errors are transient. Unfortunately,
            // there are a lot of things that can go wrong, and `reqwest` doesn't
            // expose most of them in sufficient detail to be certain which are
            // transient.
            true
        }
    }
}

impl IsKnownTransient for StatusCode {
    fn is_known_transient(&self) -> bool {
        let transient_failures = [
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT,
        ];
        transient_failures.contains(self)
    }
}

/// Log the outcome of a retried call, and convert it to a normal [`Result`].
pub(crate) fn resolve<T>(
    service: &str,
    result: ResolvedResult<(), (), T, anyhow::Error>,
) -> Result<T> {
    match result {
        ResolvedResult::Ok { output, .. } => Ok(output),
        ResolvedResult::Recovered {
            output,
            retry_errors,
            ..
        } => {
            warn!(
                "{service} succeeded after retrying {} times (failed attempts: [{}])",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Ok(output)
        }
        ResolvedResult::Fatal { error, .. } => Err(error),
        ResolvedResult::GivenUp {
            retry_errors,
            fatal_error,
            ..
        }
        | ResolvedResult::Unrecoverable {
            retry_errors,
            fatal_error,
            ..
        } => {
            error!(
                "{service} failed after {} retries. Previous transient failures: [{}]",
                retry_errors.len(),
                keen_retry::loggable_retry_errors(&retry_errors)
            );
            Err(fatal_error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_status_codes() {
        assert!(StatusCode::SERVICE_UNAVAILABLE.is_known_transient());
        assert!(StatusCode::TOO_MANY_REQUESTS.is_known_transient());
        assert!(!StatusCode::BAD_REQUEST.is_known_transient());
        assert!(!StatusCode::NOT_FOUND.is_known_transient());
    }

    #[test]
    fn resolve_ok_and_fatal() {
        let ok: ResolvedResult<(), (), u32, anyhow::Error> = ResolvedResult::Ok {
            reported_input: (),
            output: 7,
        };
        assert_eq!(resolve("test", ok).unwrap(), 7);

        let fatal: ResolvedResult<(), (), u32, anyhow::Error> = ResolvedResult::Fatal {
            input: (),
            error: anyhow!("nope"),
        };
        assert_eq!(resolve("test", fatal).unwrap_err().to_string(), "nope");
    }
}
