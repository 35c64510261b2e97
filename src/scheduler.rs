//! The batch engine, which owns the queue and runs jobs.
//!
//! A run is a set of worker tasks pulling from the shared [`QueueStore`]. In
//! sequential mode there is one worker, which pauses briefly between jobs. In
//! parallel mode there are `max_parallel_jobs` workers, so at most that many
//! jobs are ever processing at once.
//!
//! Workers claim a job by marking it as processing under the queue lock, which
//! hands out a lease. When the pipeline finishes, the result is written back
//! only if the lease still matches. This is how `stop()` and `remove()` win
//! races against in-flight jobs: they invalidate the lease, and the late
//! result is dropped.
//!
//! Pause and stop are cooperative. Workers check the run signal before they
//! claim each job, so a job that is already processing always finishes (or is
//! discarded, for stop).

use std::{
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{Notify, watch};

use crate::{
    async_utils::JoinWorker,
    config::{BatchSettings, ExecutionPolicy},
    engines::Collaborators,
    error::EngineError,
    job::{JobId, JobRecord, JobStatus, Lease},
    pipeline::{Pipeline, ProgressReporter},
    prelude::*,
    queue::{ClearFilter, QueueStore},
    retry::{self, RetryDecision},
    stats::Statistics,
};

/// The state of the current run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Running,
    Paused,
}

/// What workers should be doing. Sent over a [`watch`] channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunSignal {
    Run,
    Pause,
    Stop,
}

/// Counters for a single run. Reset by `start()`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    /// Jobs pending at start, plus any added during the run.
    pub total_files: usize,
    /// Jobs which completed successfully.
    pub completed: usize,
    /// Jobs which failed and were not retried.
    pub failed: usize,
    /// Automatic retries scheduled.
    pub retried: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A progress report for the current (or last) run.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunProgress {
    pub phase: RunPhase,
    pub counters: RunCounters,
    /// Seconds since the run started.
    pub elapsed_seconds: f64,
    /// Estimated seconds until the run finishes, based on the average time
    /// per finished job so far.
    pub estimated_remaining_seconds: Option<f64>,
}

/// State of the current run, guarded by a mutex.
struct RunState {
    phase: RunPhase,
    /// Incremented by each `start()`, so that stale workers can't touch a
    /// newer run.
    generation: u64,
    control: Option<watch::Sender<RunSignal>>,
    driver: Option<JoinWorker>,
    counters: RunCounters,
}

/// Immutable settings for a single run.
struct RunContext {
    pipeline: Pipeline,
    settings: BatchSettings,
    generation: u64,
}

/// State shared between the engine handle and its workers.
///
/// Lock order is always `run` before `queue`.
struct Shared {
    queue: Mutex<QueueStore>,
    run: Mutex<RunState>,
    settings: Mutex<BatchSettings>,
    collaborators: Collaborators,
    /// Bumped after every observable change.
    revision: watch::Sender<u64>,
    /// Signalled when a job may have become claimable, or when a job stops
    /// processing.
    work_available: Notify,
    /// Workers currently waiting to requeue a failed job.
    retry_waits: AtomicUsize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, QueueStore> {
        self.queue.lock().expect("lock poisoned")
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().expect("lock poisoned")
    }

    fn settings(&self) -> MutexGuard<'_, BatchSettings> {
        self.settings.lock().expect("lock poisoned")
    }

    /// Tell observers that something changed.
    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    /// Update the counters of run `generation`, if it is still current.
    fn update_counters(&self, generation: u64, f: impl FnOnce(&mut RunCounters)) {
        let mut run = self.run();
        if run.generation == generation {
            f(&mut run.counters);
        }
    }

    /// Could more work show up without user action?
    fn has_outstanding_work(&self) -> bool {
        self.queue().count(JobStatus::Processing) > 0
            || self.retry_waits.load(Ordering::SeqCst) > 0
    }

    /// Called when every worker of run `generation` has exited.
    fn finish_run(&self, generation: u64) {
        {
            let mut run = self.run();
            if run.generation != generation || run.phase == RunPhase::Idle {
                return;
            }
            run.phase = RunPhase::Idle;
            run.control = None;
            run.counters.finished_at = Some(Utc::now());
            info!(
                completed = run.counters.completed,
                failed = run.counters.failed,
                retried = run.counters.retried,
                "batch run finished"
            );
        }
        self.bump();
    }
}

/// Writes progress for a leased job back to the queue.
struct LeasedProgress<'a> {
    shared: &'a Shared,
    id: JobId,
    lease: Lease,
}

impl ProgressReporter for LeasedProgress<'_> {
    fn report(&self, progress: u8) {
        let updated = self.shared.queue().set_progress(self.id, self.lease, progress);
        if updated {
            self.shared.bump();
        }
    }
}

/// Keeps [`Shared::retry_waits`] accurate, even if the wait is cancelled.
struct RetryWait<'a>(&'a AtomicUsize);

impl<'a> RetryWait<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RetryWait<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Owns a queue of jobs and processes them.
///
/// This is a cheap handle. Clones share the same queue and run.
#[derive(Clone)]
pub struct BatchEngine {
    shared: Arc<Shared>,
}

impl BatchEngine {
    /// Create an engine with an empty queue.
    pub fn new(collaborators: Collaborators, settings: BatchSettings) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueStore::new()),
                run: Mutex::new(RunState {
                    phase: RunPhase::Idle,
                    generation: 0,
                    control: None,
                    driver: None,
                    counters: RunCounters::default(),
                }),
                settings: Mutex::new(settings),
                collaborators,
                revision,
                work_available: Notify::new(),
                retry_waits: AtomicUsize::new(0),
            }),
        }
    }

    /// Subscribe to changes. The value is a revision number which increases
    /// after every change to the queue or run state.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// The current settings.
    pub fn settings(&self) -> BatchSettings {
        self.shared.settings().clone()
    }

    /// Replace the settings. Only allowed while idle.
    pub fn set_settings(&self, settings: BatchSettings) -> Result<(), EngineError> {
        let run = self.shared.run();
        if run.phase != RunPhase::Idle {
            return Err(EngineError::SettingsLocked);
        }
        *self.shared.settings() = settings;
        drop(run);
        self.shared.bump();
        Ok(())
    }

    /// Add jobs to the end of the queue. Jobs added during a run will be
    /// picked up by that run.
    pub fn add(&self, records: impl IntoIterator<Item = JobRecord>) -> Vec<JobId> {
        let ids = {
            let mut run = self.shared.run();
            let ids = self.shared.queue().add(records);
            if run.phase != RunPhase::Idle {
                run.counters.total_files += ids.len();
            }
            ids
        };
        debug!(count = ids.len(), "added jobs");
        self.shared.work_available.notify_waiters();
        self.shared.bump();
        ids
    }

    /// Add one job per path.
    pub fn add_paths<P: Into<PathBuf>>(&self, paths: impl IntoIterator<Item = P>) -> Vec<JobId> {
        self.add(paths.into_iter().map(JobRecord::from_path))
    }

    /// Remove a job. Returns `false` for unknown ids. Jobs which are
    /// processing during a run cannot be removed.
    pub fn remove(&self, id: JobId) -> Result<bool, EngineError> {
        let removed = {
            let run = self.shared.run();
            let mut queue = self.shared.queue();
            let processing = queue
                .get(id)
                .is_some_and(|record| record.status == JobStatus::Processing);
            if processing && run.phase != RunPhase::Idle {
                return Err(EngineError::JobBusy(id));
            }
            queue.remove(id)
        };
        if removed {
            self.shared.bump();
        }
        Ok(removed)
    }

    /// Append a fresh pending copy of a job to the queue.
    pub fn duplicate(&self, id: JobId) -> Option<JobId> {
        let new_id = self.shared.queue().duplicate(id)?;
        self.shared.work_available.notify_waiters();
        self.shared.bump();
        Some(new_id)
    }

    /// Manually retry a failed job.
    pub fn retry(&self, id: JobId) -> Result<(), EngineError> {
        self.shared.queue().retry(id)?;
        self.shared.work_available.notify_waiters();
        self.shared.bump();
        Ok(())
    }

    /// Remove jobs in bulk. Clearing everything is refused during a run.
    pub fn clear(&self, filter: ClearFilter) -> Result<usize, EngineError> {
        let removed = {
            let run = self.shared.run();
            if filter == ClearFilter::All && run.phase != RunPhase::Idle {
                return Err(EngineError::ClearWhileRunning);
            }
            self.shared.queue().clear(filter)
        };
        self.shared.bump();
        Ok(removed)
    }

    /// A copy of every job, in queue order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.shared.queue().snapshot()
    }

    /// A copy of a single job.
    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.shared.queue().get(id).cloned()
    }

    /// Summary statistics for the whole queue.
    pub fn statistics(&self) -> Statistics {
        Statistics::from_records(self.shared.queue().records())
    }

    pub fn phase(&self) -> RunPhase {
        self.shared.run().phase
    }

    /// Progress of the current or most recent run.
    pub fn progress(&self) -> RunProgress {
        let run = self.shared.run();
        let counters = run.counters.clone();
        let elapsed_seconds = match counters.started_at {
            Some(started_at) => {
                let end = counters.finished_at.unwrap_or_else(Utc::now);
                (end - started_at).to_std().unwrap_or_default().as_secs_f64()
            }
            None => 0.0,
        };
        let finished = counters.completed + counters.failed;
        let remaining = counters.total_files.saturating_sub(finished);
        let estimated_remaining_seconds = if finished > 0 && run.phase != RunPhase::Idle {
            Some(elapsed_seconds / finished as f64 * remaining as f64)
        } else {
            None
        };
        RunProgress {
            phase: run.phase,
            counters,
            elapsed_seconds,
            estimated_remaining_seconds,
        }
    }

    /// Start processing pending jobs.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let mut run = self.shared.run();
        if run.phase != RunPhase::Idle {
            return Err(EngineError::AlreadyRunning);
        }
        let pending = self.shared.queue().count(JobStatus::Pending);
        if pending == 0 {
            return Err(EngineError::NothingPending);
        }

        run.generation += 1;
        let settings = self.shared.settings().clone();
        let ctx = Arc::new(RunContext {
            pipeline: Pipeline::new(
                self.shared.collaborators.clone(),
                settings.preprocessing.clone(),
                settings.auto_correct,
            ),
            settings,
            generation: run.generation,
        });
        let (control, signal) = watch::channel(RunSignal::Run);
        run.phase = RunPhase::Running;
        run.control = Some(control);
        run.counters = RunCounters {
            total_files: pending,
            started_at: Some(Utc::now()),
            ..RunCounters::default()
        };
        info!(
            pending,
            workers = ctx.settings.policy.worker_count(),
            "starting batch run"
        );
        let handle = tokio::spawn(drive_run(self.shared.clone(), ctx, signal));
        run.driver = Some(JoinWorker::from_handle(handle));
        drop(run);

        self.shared.bump();
        Ok(())
    }

    /// Stop claiming new jobs. Jobs already processing will finish.
    pub fn pause(&self) -> Result<(), EngineError> {
        {
            let mut run = self.shared.run();
            if run.phase != RunPhase::Running {
                return Err(EngineError::NotRunning);
            }
            run.phase = RunPhase::Paused;
            if let Some(control) = &run.control {
                control.send_replace(RunSignal::Pause);
            }
        }
        info!("batch run paused");
        self.shared.bump();
        Ok(())
    }

    /// Continue a paused run.
    pub fn resume(&self) -> Result<(), EngineError> {
        {
            let mut run = self.shared.run();
            if run.phase != RunPhase::Paused {
                return Err(EngineError::NotPaused);
            }
            run.phase = RunPhase::Running;
            if let Some(control) = &run.control {
                control.send_replace(RunSignal::Run);
            }
        }
        info!("batch run resumed");
        self.shared.bump();
        Ok(())
    }

    /// End the run immediately. Processing jobs go back to pending, and
    /// their results are discarded when they arrive.
    pub fn stop(&self) -> Result<(), EngineError> {
        let reset = {
            let mut run = self.shared.run();
            if run.phase == RunPhase::Idle {
                return Err(EngineError::Idle);
            }
            run.phase = RunPhase::Idle;
            if let Some(control) = run.control.take() {
                control.send_replace(RunSignal::Stop);
            }
            // Workers will exit on their own.
            run.driver = None;
            run.counters.finished_at = Some(Utc::now());
            self.shared.queue().reset_processing()
        };
        info!(reset, "batch run stopped");
        self.shared.bump();
        Ok(())
    }

    /// Wait for the current run to finish. Returns immediately if there is
    /// no run, or if another caller is already waiting.
    pub async fn wait(&self) -> Result<()> {
        let driver = self.shared.run().driver.take();
        match driver {
            Some(driver) => driver.join().await,
            None => Ok(()),
        }
    }
}

/// Run the workers for one run, and mark the run finished when they exit.
async fn drive_run(
    shared: Arc<Shared>,
    ctx: Arc<RunContext>,
    signal: watch::Receiver<RunSignal>,
) -> Result<()> {
    let workers = (0..ctx.settings.policy.worker_count())
        .map(|worker_id| {
            tokio::spawn(run_worker(
                shared.clone(),
                ctx.clone(),
                signal.clone(),
                worker_id,
            ))
        })
        .collect::<Vec<_>>();
    let results = join_all(workers).await;
    shared.finish_run(ctx.generation);
    for result in results {
        result.context("batch worker panicked")?;
    }
    Ok(())
}

/// Wait until the run is allowed to claim work. Returns `false` if the run
/// is stopping.
async fn wait_until_runnable(signal: &mut watch::Receiver<RunSignal>) -> bool {
    loop {
        let current = *signal.borrow_and_update();
        match current {
            RunSignal::Run => return true,
            RunSignal::Stop => return false,
            RunSignal::Pause => {}
        }
        if signal.changed().await.is_err() {
            return false;
        }
    }
}

/// Wait until the run is stopping.
async fn wait_for_stop(signal: &mut watch::Receiver<RunSignal>) {
    loop {
        if *signal.borrow_and_update() == RunSignal::Stop {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// A single worker: claim a job, run it, write it back, repeat.
#[instrument(level = "debug", skip(shared, ctx, signal))]
async fn run_worker(
    shared: Arc<Shared>,
    ctx: Arc<RunContext>,
    mut signal: watch::Receiver<RunSignal>,
    worker_id: usize,
) {
    loop {
        if !wait_until_runnable(&mut signal).await {
            break;
        }

        // Register for wakeups before looking, so we can't miss one.
        let notified = shared.work_available.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let claimed = shared.queue().claim_next_pending();
        let Some(record) = claimed else {
            if !shared.has_outstanding_work() {
                debug!("no more work");
                break;
            }
            tokio::select! {
                _ = &mut notified => {}
                changed = signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };
        shared.bump();

        let Some(lease) = record.lease else {
            continue;
        };
        let progress = LeasedProgress {
            shared: &shared,
            id: record.id,
            lease,
        };
        let finished = ctx.pipeline.run(&record, &progress).await;
        let succeeded = finished.status == JobStatus::Completed;
        let written = shared.queue().complete_attempt(finished.clone());
        if written {
            shared.bump();
            if succeeded {
                shared.update_counters(ctx.generation, |c| c.completed += 1);
            } else {
                handle_failure(&shared, &ctx, &mut signal, &finished).await;
            }
        } else {
            debug!(id = %record.id, "discarding stale result");
        }
        shared.work_available.notify_waiters();

        if ctx.settings.policy == ExecutionPolicy::Sequential {
            tokio::time::sleep(ctx.settings.item_delay()).await;
        }
    }
}

/// Apply the retry policy to a job that just failed.
async fn handle_failure(
    shared: &Shared,
    ctx: &RunContext,
    signal: &mut watch::Receiver<RunSignal>,
    failed: &JobRecord,
) {
    let settings = &ctx.settings;
    let decision = retry::decide(
        failed,
        settings.max_retries,
        settings.auto_retry,
        settings.retry_delay(),
    );
    match decision {
        RetryDecision::RetryNow => requeue(shared, ctx, failed),
        RetryDecision::RetryAfterDelay(delay) => {
            let _wait = RetryWait::new(&shared.retry_waits);
            info!(
                id = %failed.id,
                attempt = failed.retry_count + 1,
                "retrying in {:?}",
                delay
            );
            let stopped = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = wait_for_stop(signal) => true,
            };
            if stopped {
                debug!(id = %failed.id, "run stopped, cancelling retry");
                return;
            }
            requeue(shared, ctx, failed);
        }
        RetryDecision::GiveUp { exhausted } => {
            if exhausted {
                shared.queue().mark_retries_exhausted(failed.id);
                shared.bump();
            }
            shared.update_counters(ctx.generation, |c| c.failed += 1);
            error!(id = %failed.id, name = %failed.name, "job failed");
        }
    }
}

fn requeue(shared: &Shared, ctx: &RunContext, failed: &JobRecord) {
    let requeued = shared
        .queue()
        .requeue_for_retry(failed.id, failed.retry_count);
    if requeued {
        shared.update_counters(ctx.generation, |c| c.retried += 1);
        shared.work_available.notify_waiters();
        shared.bump();
    }
}
