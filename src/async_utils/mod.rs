//! Asynchronous utilities for use with Tokio.

use std::pin::Pin;

use futures::Stream;
use regex::Regex;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
///
/// Dropping this detaches the workers. They keep running.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Report any command failures, and include any error output.
///
/// Standard output and standard error are logged at debug level, or standard
/// error at error level if the command failed. Standard error may optionally
/// be checked against a regex, for tools which report failure without a
/// failing exit code.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    error_regex: Option<&Regex>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    trace!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );

    if output.status.success() {
        if !stderr.trim().is_empty() {
            debug!(
                command_name = command_name,
                output = %stderr,
                "Standard error from command",
            );
        }
        if let Some(regex) = error_regex {
            if regex.is_match(&stderr) {
                return Err(anyhow!(
                    "{} printed error output:\n{}",
                    command_name,
                    stderr,
                ));
            }
        }
        Ok(())
    } else {
        error!(
            command_name = command_name,
            output = %stderr,
            "Standard error from failed command",
        );
        if let Some(exit_code) = output.status.code() {
            Err(anyhow!(
                "{} failed with exit code {} and error output:\n{}",
                command_name,
                exit_code,
                stderr,
            ))
        } else {
            Err(anyhow!(
                "{} failed with error output:\n{}",
                command_name,
                stderr,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt as _;
    use std::process::{ExitStatus, Output};

    use super::*;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn reports_exit_codes() {
        assert!(check_for_command_failure("tool", &output(0, ""), None).is_ok());
        let err = check_for_command_failure("tool", &output(1, "bad input"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 1"));
        assert!(err.contains("bad input"));
    }

    #[test]
    fn checks_stderr_against_regex() {
        let out = output(0, "Error: cannot read image");
        assert!(check_for_command_failure("tool", &out, None).is_ok());
        let regex = Regex::new(r"(?i)error").unwrap();
        assert!(check_for_command_failure("tool", &out, Some(&regex)).is_err());
    }

    #[tokio::test]
    async fn join_worker_propagates_errors() {
        let ok = JoinWorker::from_handle(tokio::spawn(async { Ok(()) }));
        assert!(ok.join().await.is_ok());
        let failed = JoinWorker::from_handle(tokio::spawn(async { Err(anyhow!("boom")) }));
        assert!(failed.join().await.is_err());
    }
}
