//! The ordered store of job records.
//!
//! [`QueueStore`] is a plain, synchronous data structure. The
//! [`BatchEngine`](crate::scheduler::BatchEngine) wraps it in a mutex, and every
//! mutation here is a single step under that lock, so readers never see a
//! half-applied change.
//!
//! After every structural change, queue positions are renumbered so that they
//! are exactly `1..=len` in storage order.

use chrono::Utc;

use crate::{
    error::{EngineError, JobError},
    job::{JobId, JobRecord, JobStatus, Lease},
    prelude::*,
};

/// Which records to remove in a bulk clear.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClearFilter {
    Completed,
    Failed,
    All,
}

impl ClearFilter {
    fn matches(self, record: &JobRecord) -> bool {
        match self {
            ClearFilter::Completed => record.status == JobStatus::Completed,
            ClearFilter::Failed => record.status == JobStatus::Error,
            ClearFilter::All => true,
        }
    }
}

/// An ordered collection of [`JobRecord`]s.
#[derive(Debug, Default)]
pub struct QueueStore {
    records: Vec<JobRecord>,
    next_lease: Lease,
}

impl QueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append records to the end of the queue, in order.
    ///
    /// Each record is forced into a fresh pending state, so callers cannot
    /// smuggle in results.
    pub fn add(&mut self, records: impl IntoIterator<Item = JobRecord>) -> Vec<JobId> {
        let mut ids = vec![];
        for mut record in records {
            record.reset_to_pending();
            record.retry_count = 0;
            ids.push(record.id);
            self.records.push(record);
        }
        self.renumber();
        ids
    }

    /// Remove a record. Unknown ids are a no-op and return `false`.
    pub fn remove(&mut self, id: JobId) -> bool {
        let Some(idx) = self.index_of(id) else {
            return false;
        };
        self.records.remove(idx);
        self.renumber();
        true
    }

    /// Append a fresh pending copy of a record to the end of the queue.
    pub fn duplicate(&mut self, id: JobId) -> Option<JobId> {
        let mut copy = self.get(id)?.clone();
        copy.id = JobId::new();
        copy.retry_count = 0;
        copy.reset_to_pending();
        let new_id = copy.id;
        self.records.push(copy);
        self.renumber();
        Some(new_id)
    }

    /// Remove every record matching `filter`, returning how many were removed.
    pub fn clear(&mut self, filter: ClearFilter) -> usize {
        let before = self.records.len();
        self.records.retain(|record| !filter.matches(record));
        self.renumber();
        before - self.records.len()
    }

    /// Manually retry a failed record. This counts as an attempt, so it uses
    /// up one of the record's automatic retries.
    pub fn retry(&mut self, id: JobId) -> Result<(), EngineError> {
        let record = self.get_mut(id).ok_or(EngineError::UnknownJob(id))?;
        if record.status != JobStatus::Error {
            return Err(EngineError::NotRetryable {
                id,
                status: record.status,
            });
        }
        record.reset_to_pending();
        record.retry_count += 1;
        Ok(())
    }

    /// Look up a record by id.
    pub fn get(&self, id: JobId) -> Option<&JobRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    /// All records, in queue order.
    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// A copy of all records, in queue order.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        self.records.clone()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// How many records have the specified status?
    pub fn count(&self, status: JobStatus) -> usize {
        self.records.iter().filter(|r| r.status == status).count()
    }

    /// Claim the pending record with the lowest queue position, marking it as
    /// processing and handing out a fresh lease.
    pub(crate) fn claim_next_pending(&mut self) -> Option<JobRecord> {
        self.next_lease += 1;
        let lease = self.next_lease;
        let record = self
            .records
            .iter_mut()
            .find(|record| record.status == JobStatus::Pending)?;
        record.status = JobStatus::Processing;
        record.progress = 0;
        record.result = None;
        record.failure = None;
        record.started_at = Some(Utc::now());
        record.ended_at = None;
        record.lease = Some(lease);
        Some(record.clone())
    }

    /// Record intermediate progress for a claimed record. Progress only moves
    /// forward, and stale leases are ignored.
    pub(crate) fn set_progress(&mut self, id: JobId, lease: Lease, progress: u8) -> bool {
        match self.get_mut(id) {
            Some(record)
                if record.lease == Some(lease)
                    && record.status == JobStatus::Processing =>
            {
                record.progress = record.progress.max(progress.min(100));
                true
            }
            _ => false,
        }
    }

    /// Store the outcome of a processing attempt, replacing the whole record.
    ///
    /// This is refused if the record is gone, is no longer processing, or has
    /// been claimed again since `finished` was handed out.
    pub(crate) fn complete_attempt(&mut self, mut finished: JobRecord) -> bool {
        let Some(idx) = self.index_of(finished.id) else {
            return false;
        };
        let current = &self.records[idx];
        if current.status != JobStatus::Processing
            || current.lease.is_none()
            || current.lease != finished.lease
        {
            return false;
        }
        finished.queue_position = current.queue_position;
        finished.lease = None;
        self.records[idx] = finished;
        true
    }

    /// Put a failed record back in line for an automatic retry, keeping its
    /// queue position.
    ///
    /// `expected_retry_count` guards against requeueing a record which the
    /// user has already retried, removed or otherwise changed.
    pub(crate) fn requeue_for_retry(
        &mut self,
        id: JobId,
        expected_retry_count: u32,
    ) -> bool {
        match self.get_mut(id) {
            Some(record)
                if record.status == JobStatus::Error
                    && record.retry_count == expected_retry_count =>
            {
                record.reset_to_pending();
                record.retry_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Mark a failed record as having exhausted its automatic retries.
    pub(crate) fn mark_retries_exhausted(&mut self, id: JobId) {
        if let Some(record) = self.get_mut(id) {
            if record.status != JobStatus::Error {
                return;
            }
            if let Some(failure) = &mut record.failure {
                let last_error = failure.message.clone();
                failure.error = JobError::MaxRetriesExceeded { last_error };
                failure.stage = failure.error.stage();
                failure.message = failure.error.to_string();
            }
        }
    }

    /// Return every processing record to pending, dropping its lease so that
    /// any in-flight result will be discarded.
    pub(crate) fn reset_processing(&mut self) -> usize {
        let mut count = 0;
        for record in &mut self.records {
            if record.status == JobStatus::Processing {
                record.reset_to_pending();
                count += 1;
            }
        }
        count
    }

    fn index_of(&self, id: JobId) -> Option<usize> {
        self.records.iter().position(|record| record.id == id)
    }

    fn get_mut(&mut self, id: JobId) -> Option<&mut JobRecord> {
        self.records.iter_mut().find(|record| record.id == id)
    }

    fn renumber(&mut self) {
        for (idx, record) in self.records.iter_mut().enumerate() {
            record.queue_position = idx + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::job::JobFailure;

    use super::*;

    fn store_with(names: &[&str]) -> (QueueStore, Vec<JobId>) {
        let mut store = QueueStore::new();
        let ids = store.add(
            names
                .iter()
                .map(|name| JobRecord::from_bytes(*name, name.as_bytes().to_vec())),
        );
        (store, ids)
    }

    fn assert_positions(store: &QueueStore) {
        let positions = store
            .records()
            .iter()
            .map(|r| r.queue_position)
            .collect::<Vec<_>>();
        assert_eq!(positions, (1..=store.len()).collect::<Vec<_>>());
    }

    fn fail(store: &mut QueueStore, id: JobId) {
        let mut claimed = store.claim_next_pending().unwrap();
        assert_eq!(claimed.id, id);
        claimed.status = JobStatus::Error;
        claimed.failure = Some(JobFailure::from(JobError::NoTextFound));
        assert!(store.complete_attempt(claimed));
    }

    #[test]
    fn positions_stay_dense() {
        let (mut store, ids) = store_with(&["a", "b", "c", "d"]);
        assert_positions(&store);

        assert!(store.remove(ids[1]));
        assert_positions(&store);

        let copy = store.duplicate(ids[0]).unwrap();
        assert_positions(&store);
        assert_eq!(store.get(copy).unwrap().queue_position, 4);

        assert!(!store.remove(JobId::new()));
        assert_positions(&store);

        store.add([JobRecord::from_bytes("e", b"e".to_vec())]);
        assert_positions(&store);
        assert_eq!(store.len(), 5);
    }

    #[test]
    fn add_forces_pending() {
        let mut record = JobRecord::from_bytes("x", b"x".to_vec());
        record.status = JobStatus::Completed;
        record.progress = 100;
        record.retry_count = 7;
        let mut store = QueueStore::new();
        let ids = store.add([record]);
        let stored = store.get(ids[0]).unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(stored.progress, 0);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn duplicate_then_remove_restores_state() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let before = store
            .records()
            .iter()
            .map(|r| (r.id, r.queue_position, r.status))
            .collect::<Vec<_>>();

        let copy = store.duplicate(ids[1]).unwrap();
        let duplicated = store.get(copy).unwrap();
        assert_eq!(duplicated.status, JobStatus::Pending);
        assert_eq!(duplicated.name, "b");
        assert!(store.remove(copy));

        let after = store
            .records()
            .iter()
            .map(|r| (r.id, r.queue_position, r.status))
            .collect::<Vec<_>>();
        assert_eq!(before, after);
    }

    #[test]
    fn claims_in_queue_order() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        let first = store.claim_next_pending().unwrap();
        let second = store.claim_next_pending().unwrap();
        assert_eq!(first.id, ids[0]);
        assert_eq!(second.id, ids[1]);
        assert_ne!(first.lease, second.lease);
        assert_eq!(store.count(JobStatus::Processing), 2);
        assert!(store.get(ids[0]).unwrap().started_at.is_some());
    }

    #[test]
    fn stale_results_are_discarded() {
        let (mut store, ids) = store_with(&["a"]);
        let stale = store.claim_next_pending().unwrap();
        assert_eq!(store.reset_processing(), 1);

        // A new claim hands out a new lease.
        let fresh = store.claim_next_pending().unwrap();
        assert_eq!(fresh.id, ids[0]);

        let mut stale_done = stale.clone();
        stale_done.status = JobStatus::Completed;
        assert!(!store.complete_attempt(stale_done));
        assert!(!store.set_progress(ids[0], stale.lease.unwrap(), 50));

        let mut fresh_done = fresh.clone();
        fresh_done.status = JobStatus::Completed;
        fresh_done.progress = 100;
        assert!(store.complete_attempt(fresh_done));
        assert_eq!(store.get(ids[0]).unwrap().status, JobStatus::Completed);
        assert_eq!(store.get(ids[0]).unwrap().queue_position, 1);
    }

    #[test]
    fn progress_is_monotonic() {
        let (mut store, ids) = store_with(&["a"]);
        let claimed = store.claim_next_pending().unwrap();
        let lease = claimed.lease.unwrap();
        assert!(store.set_progress(ids[0], lease, 50));
        assert!(store.set_progress(ids[0], lease, 20));
        assert_eq!(store.get(ids[0]).unwrap().progress, 50);
    }

    #[test]
    fn manual_retry_only_for_failures() {
        let (mut store, ids) = store_with(&["a", "b"]);
        assert_eq!(
            store.retry(ids[1]),
            Err(EngineError::NotRetryable {
                id: ids[1],
                status: JobStatus::Pending
            })
        );
        fail(&mut store, ids[0]);
        assert!(store.retry(ids[0]).is_ok());
        let record = store.get(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert!(record.failure.is_none());
        assert_eq!(record.retry_count, 1);
        let unknown = JobId::new();
        assert_eq!(store.retry(unknown), Err(EngineError::UnknownJob(unknown)));
    }

    #[test]
    fn automatic_retry_increments_count() {
        let (mut store, ids) = store_with(&["a"]);
        fail(&mut store, ids[0]);
        assert!(!store.requeue_for_retry(ids[0], 3));
        assert!(store.requeue_for_retry(ids[0], 0));
        let record = store.get(ids[0]).unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.queue_position, 1);
    }

    #[test]
    fn exhausted_retries_overwrite_message() {
        let (mut store, ids) = store_with(&["a"]);
        fail(&mut store, ids[0]);
        store.mark_retries_exhausted(ids[0]);
        let failure = store.get(ids[0]).unwrap().failure.clone().unwrap();
        assert_eq!(failure.message, "Maximum retries exceeded");
        assert_eq!(failure.stage, crate::job::FailureStage::Policy);
        assert_eq!(
            failure.error,
            JobError::MaxRetriesExceeded {
                last_error: "no text found in file".to_owned()
            }
        );
    }

    #[test]
    fn clear_by_filter() {
        let (mut store, ids) = store_with(&["a", "b", "c"]);
        fail(&mut store, ids[0]);
        assert_eq!(store.clear(ClearFilter::Completed), 0);
        assert_eq!(store.clear(ClearFilter::Failed), 1);
        assert_positions(&store);
        assert_eq!(store.clear(ClearFilter::All), 2);
        assert!(store.is_empty());
    }
}
