//! Export finished jobs as CSV or JSONL.

use std::fmt;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use futures::stream;
use schemars::JsonSchema;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::{create_writer, write_output},
    job::{JobRecord, JobStatus},
    prelude::*,
};

/// Output format for exports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ExportFormat {
    Csv,
    Jsonl,
}

impl ExportFormat {
    /// Guess the format from a file name, defaulting to JSONL.
    pub fn from_path(path: Option<&Path>) -> Self {
        match path.and_then(|p| p.extension()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => ExportFormat::Csv,
            _ => ExportFormat::Jsonl,
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Csv => write!(f, "csv"),
            ExportFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// One row of exported output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ExportRecord {
    /// When the job finished, in UTC.
    pub timestamp: String,
    /// The file name.
    pub name: String,
    /// `completed` or `error`.
    pub status: String,
    /// Text returned by the recognizer.
    pub original_text: String,
    /// Text after grammar corrections.
    pub corrected_text: String,
    /// Number of grammar issues found.
    pub grammar_error_count: usize,
    /// A short summary of the first few grammar issues.
    pub error_summary: String,
    /// Which recognizer produced the text.
    pub ocr_engine: String,
    /// Recognizer confidence, from 0.0 to 1.0.
    pub ocr_confidence: f32,
    /// Processing time, in seconds.
    pub processing_time: f64,
    /// Automatic retries used.
    pub retry_count: u32,
    /// Why the job failed, if it did.
    pub failure: String,
}

/// How many issues to list in [`ExportRecord::error_summary`].
const SUMMARY_ISSUES: usize = 3;

impl ExportRecord {
    /// Build an export row for a finished job. Returns `None` for jobs which
    /// haven't finished.
    pub fn from_record(record: &JobRecord) -> Option<Self> {
        let finished_at = record.ended_at.unwrap_or_else(Utc::now);
        let timestamp = format_timestamp(finished_at);
        match (record.status, &record.result, &record.failure) {
            (JobStatus::Completed, Some(result), _) => {
                let mut summary = result
                    .grammar_issues
                    .iter()
                    .take(SUMMARY_ISSUES)
                    .map(|issue| format!("{}: {}", issue.category, issue.message))
                    .collect::<Vec<_>>();
                if result.grammar_issues.len() > SUMMARY_ISSUES {
                    summary.push(format!(
                        "and {} more",
                        result.grammar_issues.len() - SUMMARY_ISSUES
                    ));
                }
                Some(ExportRecord {
                    timestamp,
                    name: record.name.clone(),
                    status: JobStatus::Completed.to_string(),
                    original_text: result.extracted_text.clone(),
                    corrected_text: result.corrected_text.clone(),
                    grammar_error_count: result.error_count,
                    error_summary: summary.join("; "),
                    ocr_engine: result.engine_id.clone(),
                    ocr_confidence: result.confidence,
                    processing_time: result.processing_time,
                    retry_count: record.retry_count,
                    failure: String::new(),
                })
            }
            (JobStatus::Error, _, failure) => Some(ExportRecord {
                timestamp,
                name: record.name.clone(),
                status: JobStatus::Error.to_string(),
                original_text: String::new(),
                corrected_text: String::new(),
                grammar_error_count: 0,
                error_summary: String::new(),
                ocr_engine: String::new(),
                ocr_confidence: 0.0,
                processing_time: 0.0,
                retry_count: record.retry_count,
                failure: failure
                    .as_ref()
                    .map(|f| format!("{}: {}", f.stage, f.message))
                    .unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

fn format_timestamp(time: DateTime<Utc>) -> String {
    time.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Write completed jobs (and optionally failed ones) to `path`, or to
/// standard output. Returns the number of rows written.
#[instrument(level = "debug", skip_all, fields(format = %format))]
pub async fn export_records(
    records: &[JobRecord],
    path: Option<&Path>,
    format: ExportFormat,
    include_failed: bool,
) -> Result<usize> {
    let rows = records
        .iter()
        .filter(|record| {
            record.status == JobStatus::Completed
                || (include_failed && record.status == JobStatus::Error)
        })
        .filter_map(ExportRecord::from_record)
        .collect::<Vec<_>>();
    let count = rows.len();

    match format {
        ExportFormat::Jsonl => {
            let values = rows
                .into_iter()
                .map(|row| serde_json::to_value(row).context("cannot serialize export row"))
                .collect::<Vec<_>>();
            write_output(path, Box::pin(stream::iter(values))).await?;
        }
        ExportFormat::Csv => {
            let writer = create_writer(path).await?;
            let mut csv = csv_async::AsyncSerializer::from_writer(writer);
            for row in &rows {
                csv.serialize(row)
                    .await
                    .context("cannot write CSV row")?;
            }
            let mut writer = csv
                .into_inner()
                .await
                .map_err(|err| anyhow!("cannot flush CSV output: {}", err))?;
            writer.flush().await.context("cannot flush CSV output")?;
        }
    }
    debug!(count, "exported records");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use crate::{
        engines::GrammarIssue,
        error::JobError,
        job::{JobFailure, JobResult},
    };

    use super::*;

    fn completed(name: &str, issues: usize) -> JobRecord {
        let mut record = JobRecord::from_bytes(name, b"x".to_vec());
        record.status = JobStatus::Completed;
        record.ended_at = Some(Utc::now());
        let grammar_issues = (0..issues)
            .map(|i| GrammarIssue {
                rule_id: "R".to_owned(),
                category: "typo".to_owned(),
                message: format!("issue {i}"),
                offset: i,
                length: 1,
                suggestions: vec![],
            })
            .collect::<Vec<_>>();
        record.result = Some(JobResult {
            extracted_text: "Teh text, with \"quotes\"".to_owned(),
            corrected_text: "The text, with \"quotes\"".to_owned(),
            error_count: issues,
            grammar_issues,
            confidence: 0.9,
            word_count: 4,
            engine_id: "plain-text".to_owned(),
            processing_time: 0.5,
        });
        record
    }

    fn failed(name: &str) -> JobRecord {
        let mut record = JobRecord::from_bytes(name, b"x".to_vec());
        record.status = JobStatus::Error;
        record.failure = Some(JobFailure::from(JobError::NoTextFound));
        record
    }

    #[test]
    fn summarizes_issues() {
        let row = ExportRecord::from_record(&completed("a.png", 5)).unwrap();
        assert_eq!(row.grammar_error_count, 5);
        assert_eq!(
            row.error_summary,
            "typo: issue 0; typo: issue 1; typo: issue 2; and 2 more"
        );
        assert!(row.timestamp.ends_with(" UTC"));
    }

    #[test]
    fn pending_jobs_are_not_exported() {
        let record = JobRecord::from_bytes("a.png", b"x".to_vec());
        assert!(ExportRecord::from_record(&record).is_none());
    }

    #[test]
    fn format_from_path() {
        assert_eq!(
            ExportFormat::from_path(Some(Path::new("out.CSV"))),
            ExportFormat::Csv
        );
        assert_eq!(
            ExportFormat::from_path(Some(Path::new("out.jsonl"))),
            ExportFormat::Jsonl
        );
        assert_eq!(ExportFormat::from_path(None), ExportFormat::Jsonl);
    }

    #[tokio::test]
    async fn exports_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let records = vec![completed("a.png", 1), failed("b.png")];

        let count = export_records(&records, Some(&path), ExportFormat::Csv, false)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let mut reader = csv_async::AsyncDeserializer::from_reader(
            tokio::fs::File::open(&path).await.unwrap(),
        );
        let mut rows = reader.deserialize::<ExportRecord>();
        use futures::StreamExt as _;
        let row = rows.next().await.unwrap().unwrap();
        assert_eq!(row.name, "a.png");
        assert_eq!(row.corrected_text, "The text, with \"quotes\"");
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn exports_jsonl_with_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");
        let records = vec![completed("a.png", 0), failed("b.png")];

        let count = export_records(&records, Some(&path), ExportFormat::Jsonl, true)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let rows = text
            .lines()
            .map(|line| serde_json::from_str::<ExportRecord>(line).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(rows[0].status, "completed");
        assert_eq!(rows[1].status, "error");
        assert_eq!(rows[1].failure, "extract: no text found in file");
    }
}
