//! Batch settings, loaded from TOML or JSON.

use std::{num::NonZeroUsize, time::Duration};

use schemars::JsonSchema;

use crate::{async_utils::io::read_json_or_toml, engines::PreprocessingOptions, prelude::*};

/// How many jobs may run at once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ExecutionPolicy {
    /// One job at a time, in queue order, with a short pause between jobs.
    Sequential,
    /// Up to `max_parallel_jobs` jobs at a time.
    Parallel { max_parallel_jobs: NonZeroUsize },
}

impl ExecutionPolicy {
    /// A parallel policy with one job per CPU.
    pub fn default_parallel() -> Self {
        let max_parallel_jobs =
            NonZeroUsize::new(num_cpus::get()).unwrap_or(NonZeroUsize::MIN);
        ExecutionPolicy::Parallel { max_parallel_jobs }
    }

    /// How many workers should we run?
    pub fn worker_count(self) -> usize {
        match self {
            ExecutionPolicy::Sequential => 1,
            ExecutionPolicy::Parallel { max_parallel_jobs } => max_parallel_jobs.get(),
        }
    }
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self::default_parallel()
    }
}

/// Settings for a batch run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    /// How many jobs may run at once.
    pub policy: ExecutionPolicy,

    /// Maximum automatic retries per job.
    pub max_retries: u32,

    /// Retry failed jobs automatically?
    pub auto_retry: bool,

    /// Delay before an automatic retry, in milliseconds.
    pub retry_delay_ms: u64,

    /// Pause between jobs in sequential mode, in milliseconds.
    pub item_delay_ms: u64,

    /// Apply the first grammar suggestion for each issue?
    pub auto_correct: bool,

    /// Image preprocessing passed to the recognizer.
    pub preprocessing: PreprocessingOptions,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            policy: ExecutionPolicy::default(),
            max_retries: 3,
            auto_retry: true,
            retry_delay_ms: 2_000,
            item_delay_ms: 100,
            auto_correct: false,
            preprocessing: PreprocessingOptions::default(),
        }
    }
}

impl BatchSettings {
    /// Load settings from a TOML or JSON file. Missing fields get defaults.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn load(path: &Path) -> Result<Self> {
        read_json_or_toml(path)
            .await
            .with_context(|| format!("cannot load settings from {}", path.display()))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::engines::ThresholdMethod;

    #[test]
    fn defaults() {
        let settings = BatchSettings::default();
        assert_eq!(settings.max_retries, 3);
        assert!(settings.auto_retry);
        assert_eq!(settings.retry_delay(), Duration::from_secs(2));
        assert_eq!(settings.item_delay(), Duration::from_millis(100));
        assert!(settings.policy.worker_count() >= 1);
    }

    #[tokio::test]
    async fn loads_partial_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
max_retries = 1
auto_correct = true

[policy]
mode = "parallel"
max_parallel_jobs = 2

[preprocessing]
threshold_method = "otsu"
"#
        )
        .unwrap();
        let settings = BatchSettings::load(file.path()).await.unwrap();
        assert_eq!(settings.max_retries, 1);
        assert!(settings.auto_correct);
        assert_eq!(settings.policy.worker_count(), 2);
        assert_eq!(settings.preprocessing.threshold_method, ThresholdMethod::Otsu);
        assert!(settings.preprocessing.denoise);
        assert_eq!(settings.retry_delay_ms, 2_000);
    }

    #[tokio::test]
    async fn loads_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"policy": {{"mode": "sequential"}}, "auto_retry": false}}"#)
            .unwrap();
        let settings = BatchSettings::load(file.path()).await.unwrap();
        assert_eq!(settings.policy, ExecutionPolicy::Sequential);
        assert!(!settings.auto_retry);
    }

    #[tokio::test]
    async fn rejects_zero_workers_and_unknown_fields() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[policy]\nmode = \"parallel\"\nmax_parallel_jobs = 0").unwrap();
        assert!(BatchSettings::load(file.path()).await.is_err());

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "max_retrys = 2").unwrap();
        assert!(BatchSettings::load(file.path()).await.is_err());
    }
}
