//! Summary statistics over the queue.

use std::fmt;

use crate::{
    job::{JobRecord, JobStatus},
    prelude::*,
};

/// Counts and averages derived from a queue snapshot.
///
/// The status counts always add up to `total`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub paused: usize,
    pub cancelled: usize,
    /// Mean processing time of completed jobs, in seconds. Zero if there are
    /// none.
    pub avg_processing_time: f64,
    /// Completed jobs as a fraction of all finished jobs, from 0.0 to 1.0.
    /// `None` if no jobs have finished.
    pub success_rate: Option<f64>,
    /// Words extracted across all completed jobs.
    pub total_words: usize,
    /// Grammar issues found across all completed jobs.
    pub total_grammar_errors: usize,
    /// Mean recognizer confidence of completed jobs. `None` if there are none.
    pub avg_confidence: Option<f64>,
}

impl Statistics {
    /// Compute statistics for a set of records.
    pub fn from_records(records: &[JobRecord]) -> Self {
        let mut stats = Statistics {
            total: records.len(),
            ..Default::default()
        };
        let mut total_time = 0.0;
        let mut total_confidence = 0.0;
        for record in records {
            match record.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Error => stats.failed += 1,
                JobStatus::Paused => stats.paused += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
            if record.status == JobStatus::Completed {
                if let Some(result) = &record.result {
                    total_time += result.processing_time;
                    total_confidence += f64::from(result.confidence);
                    stats.total_words += result.word_count;
                    stats.total_grammar_errors += result.error_count;
                }
            }
        }

        if stats.completed > 0 {
            stats.avg_processing_time = total_time / stats.completed as f64;
            stats.avg_confidence = Some(total_confidence / stats.completed as f64);
        }
        let finished = stats.completed + stats.failed;
        if finished > 0 {
            stats.success_rate = Some(stats.completed as f64 / finished as f64);
        }
        stats
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} jobs: {} completed, {} failed, {} pending, {} processing",
            self.total, self.completed, self.failed, self.pending, self.processing
        )?;
        match self.success_rate {
            Some(rate) => write!(f, ", success rate {:.1}%", rate * 100.0),
            None => write!(f, ", success rate N/A"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::job::JobResult;

    use super::*;

    fn record(status: JobStatus, time: f64) -> JobRecord {
        let mut record = JobRecord::from_bytes("a.txt", b"a".to_vec());
        record.status = status;
        if status == JobStatus::Completed {
            record.result = Some(JobResult {
                extracted_text: "one two".to_owned(),
                corrected_text: "one two".to_owned(),
                error_count: 1,
                grammar_issues: vec![],
                confidence: 0.5,
                word_count: 2,
                engine_id: "fake".to_owned(),
                processing_time: time,
            });
        }
        record
    }

    #[test]
    fn empty_queue() {
        let stats = Statistics::from_records(&[]);
        assert_eq!(stats.total, 0);
        assert_eq!(stats.avg_processing_time, 0.0);
        assert_eq!(stats.success_rate, None);
        assert_eq!(stats.avg_confidence, None);
        assert!(stats.to_string().ends_with("success rate N/A"));
    }

    #[test]
    fn counts_partition_total() {
        let records = JobStatus::ALL
            .iter()
            .map(|&status| record(status, 1.0))
            .collect::<Vec<_>>();
        let stats = Statistics::from_records(&records);
        let sum = stats.pending
            + stats.processing
            + stats.completed
            + stats.failed
            + stats.paused
            + stats.cancelled;
        assert_eq!(sum, stats.total);
        assert_eq!(stats.total, 6);
    }

    #[test]
    fn averages_and_success_rate() {
        let records = vec![
            record(JobStatus::Completed, 1.0),
            record(JobStatus::Completed, 3.0),
            record(JobStatus::Completed, 2.0),
            record(JobStatus::Error, 0.0),
            record(JobStatus::Pending, 0.0),
        ];
        let stats = Statistics::from_records(&records);
        assert_eq!(stats.avg_processing_time, 2.0);
        assert_eq!(stats.success_rate, Some(0.75));
        assert!(stats.to_string().ends_with("success rate 75.0%"));
        assert_eq!(stats.total_words, 6);
        assert_eq!(stats.total_grammar_errors, 3);
        assert_eq!(stats.avg_confidence, Some(0.5));
    }
}
