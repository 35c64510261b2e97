//! The per-job processing pipeline.
//!
//! Each job goes through three stages: validate, extract, check. Progress is
//! reported at fixed checkpoints along the way:
//!
//! | Progress | Meaning                      |
//! |----------|------------------------------|
//! | 20       | Source validated             |
//! | 30       | Extraction started           |
//! | 50       | Text extracted               |
//! | 80       | Grammar checked              |
//! | 100      | Done                         |
//!
//! The pipeline never touches the queue. It takes a snapshot of a record and
//! returns the finished record, which the scheduler writes back.

use std::{any::Any, panic::AssertUnwindSafe, time::Instant};

use chrono::Utc;
use futures::FutureExt as _;

use crate::{
    engines::{
        Collaborators, GrammarChecker, PreprocessingOptions, Recognizer, SourceValidator,
    },
    error::JobError,
    job::{JobFailure, JobRecord, JobResult, JobStatus},
    prelude::*,
};

/// Receives progress updates for a running job.
pub trait ProgressReporter: Send + Sync {
    /// Report that the job is `progress` percent done.
    fn report(&self, progress: u8);
}

/// A [`ProgressReporter`] which ignores all updates.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _progress: u8) {}
}

/// Runs a single job through validation, extraction and grammar checking.
#[derive(Clone)]
pub struct Pipeline {
    collaborators: Collaborators,
    options: PreprocessingOptions,
    auto_correct: bool,
}

impl Pipeline {
    pub fn new(
        collaborators: Collaborators,
        options: PreprocessingOptions,
        auto_correct: bool,
    ) -> Self {
        Self {
            collaborators,
            options,
            auto_correct,
        }
    }

    /// Process `record`, returning the finished record.
    ///
    /// The returned record is either completed with a result, or failed with
    /// a classified failure. It keeps the identity, lease and start time of
    /// the input.
    #[instrument(level = "debug", skip_all, fields(id = %record.id, name = %record.name))]
    pub async fn run(&self, record: &JobRecord, progress: &dyn ProgressReporter) -> JobRecord {
        let started = Instant::now();
        let outcome = self.run_stages(record, progress, started).await;

        let mut finished = record.clone();
        finished.ended_at = Some(Utc::now());
        match outcome {
            Ok(result) => {
                debug!(
                    words = result.word_count,
                    issues = result.error_count,
                    "job completed"
                );
                finished.status = JobStatus::Completed;
                finished.progress = 100;
                finished.result = Some(result);
                finished.failure = None;
            }
            Err(err) => {
                warn!(stage = %err.stage(), "job failed: {}", err);
                finished.status = JobStatus::Error;
                finished.result = None;
                finished.failure = Some(JobFailure::from(err));
            }
        }
        finished
    }

    async fn run_stages(
        &self,
        record: &JobRecord,
        progress: &dyn ProgressReporter,
        started: Instant,
    ) -> Result<JobResult, JobError> {
        let validator: &dyn SourceValidator = self.collaborators.validator.as_ref();
        let recognizer: &dyn Recognizer = self.collaborators.recognizer.as_ref();
        let checker: &dyn GrammarChecker = self.collaborators.checker.as_ref();

        let valid = catch_panic(async { Ok(validator.validate(&record.source).await) })
            .await
            .map_err(|err| JobError::Unreadable {
                reason: format!("{err:#}"),
            })?;
        if !valid {
            return Err(JobError::Unreadable {
                reason: format!("{} is missing, empty or unreadable", record.name),
            });
        }
        progress.report(20);

        progress.report(30);
        let extraction = catch_panic(recognizer.extract_text(&record.source, &self.options))
            .await
            .map_err(|err| JobError::ExtractionEngineFailure {
                reason: format!("{err:#}"),
            })?;
        if extraction.text.trim().is_empty() {
            return Err(JobError::NoTextFound);
        }
        progress.report(50);

        let report = catch_panic(checker.check_grammar(&extraction.text, self.auto_correct))
            .await
            .map_err(|err| JobError::CheckerUnavailable {
                reason: format!("{err:#}"),
            })?;
        progress.report(80);

        let result = JobResult {
            word_count: extraction.text.split_whitespace().count(),
            corrected_text: report.corrected_text,
            error_count: report.issues.len(),
            grammar_issues: report.issues,
            confidence: extraction.confidence,
            engine_id: extraction.engine_id,
            extracted_text: extraction.text,
            processing_time: started.elapsed().as_secs_f64(),
        };
        progress.report(100);
        Ok(result)
    }
}

/// Await a collaborator call, turning a panic into an error.
async fn catch_panic<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(anyhow!("panicked: {}", panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

/// Fake collaborators for tests.
#[cfg(test)]
pub(crate) mod fakes {
    use std::{
        collections::HashSet,
        sync::{
            Arc, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use crate::{
        engines::{Extraction, GrammarIssue, GrammarReport, apply_corrections},
        job::JobSource,
    };

    use super::*;

    /// Accepts everything except names in `unreadable`.
    #[derive(Default)]
    pub struct FakeValidator {
        pub unreadable: HashSet<String>,
    }

    #[async_trait]
    impl SourceValidator for FakeValidator {
        async fn validate(&self, source: &JobSource) -> bool {
            !self.unreadable.contains(&source.display_name())
        }
    }

    /// Returns the source's bytes as text after a delay, tracking how many
    /// calls are in flight at once.
    #[derive(Default)]
    pub struct FakeRecognizer {
        pub delay: Duration,
        /// Names which fail this many times before succeeding.
        pub flaky: Mutex<Vec<(String, usize)>>,
        pub in_flight: AtomicUsize,
        pub peak_in_flight: AtomicUsize,
        pub calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Recognizer for FakeRecognizer {
        async fn extract_text(
            &self,
            source: &JobSource,
            _options: &PreprocessingOptions,
        ) -> Result<Extraction> {
            let name = source.display_name();
            self.calls.lock().unwrap().push(name.clone());
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let mut flaky = self.flaky.lock().unwrap();
            if let Some((_, remaining)) = flaky.iter_mut().find(|(n, _)| *n == name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    bail!("engine hiccup on {name}");
                }
            }
            let text = match source {
                JobSource::Memory { data, .. } => String::from_utf8_lossy(data).into_owned(),
                JobSource::Path { path } => path.display().to_string(),
            };
            Ok(Extraction {
                text,
                confidence: 0.9,
                engine_id: "fake".to_owned(),
                words: vec![],
            })
        }
    }

    /// Flags every occurrence of "teh", or fails if `fail` is set.
    #[derive(Default)]
    pub struct FakeChecker {
        pub fail: bool,
        /// Panic when checking text containing this.
        pub panic_on: Option<String>,
    }

    #[async_trait]
    impl GrammarChecker for FakeChecker {
        async fn check_grammar(&self, text: &str, auto_correct: bool) -> Result<GrammarReport> {
            if self.fail {
                bail!("checker offline");
            }
            if let Some(marker) = &self.panic_on {
                if text.contains(marker.as_str()) {
                    panic!("checker blew up on {marker}");
                }
            }
            let issues = text
                .match_indices("teh")
                .map(|(byte, _)| GrammarIssue {
                    rule_id: "TEH".to_owned(),
                    category: "typo".to_owned(),
                    message: "did you mean \"the\"?".to_owned(),
                    offset: text[..byte].chars().count(),
                    length: 3,
                    suggestions: vec!["the".to_owned()],
                })
                .collect::<Vec<_>>();
            let corrected_text = if auto_correct {
                apply_corrections(text, &issues)
            } else {
                text.to_owned()
            };
            Ok(GrammarReport {
                issues,
                corrected_text,
            })
        }
    }

    /// Records every progress report.
    #[derive(Default)]
    pub struct RecordingProgress(pub Mutex<Vec<u8>>);

    impl ProgressReporter for RecordingProgress {
        fn report(&self, progress: u8) {
            self.0.lock().unwrap().push(progress);
        }
    }

    pub fn collaborators(
        validator: FakeValidator,
        recognizer: Arc<FakeRecognizer>,
        checker: FakeChecker,
    ) -> Collaborators {
        Collaborators {
            validator: Arc::new(validator),
            recognizer,
            checker: Arc::new(checker),
        }
    }
}
