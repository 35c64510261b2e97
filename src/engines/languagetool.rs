//! Grammar checker backed by a LanguageTool server.

use keen_retry::{ExponentialJitter, RetryResult};

use crate::{
    prelude::*,
    rate_limit::{RateLimit, ServiceLimiter},
    retry::transient::{
        IsKnownTransient, resolve, retry_result_ok, try_fatal, try_potentially_transient,
    },
};

use super::{GrammarChecker, GrammarIssue, GrammarReport, Language, apply_corrections};

/// Response from `/v2/check`. We only parse the fields we need.
#[derive(Debug, Deserialize)]
struct CheckResponse {
    matches: Vec<CheckMatch>,
}

#[derive(Debug, Deserialize)]
struct CheckMatch {
    message: String,
    offset: usize,
    length: usize,
    #[serde(default)]
    replacements: Vec<Replacement>,
    rule: Rule,
}

#[derive(Debug, Deserialize)]
struct Replacement {
    value: String,
}

#[derive(Debug, Deserialize)]
struct Rule {
    id: String,
    category: Category,
}

#[derive(Debug, Deserialize)]
struct Category {
    name: String,
}

impl From<CheckMatch> for GrammarIssue {
    fn from(m: CheckMatch) -> Self {
        GrammarIssue {
            rule_id: m.rule.id,
            category: m.rule.category.name,
            message: m.message,
            offset: m.offset,
            length: m.length,
            suggestions: m.replacements.into_iter().map(|r| r.value).collect(),
        }
    }
}

/// Checks grammar using LanguageTool's HTTP API.
///
/// LanguageTool reports offsets in UTF-16 code units, which match our
/// character offsets for all text outside the astral planes.
pub struct LanguageToolChecker {
    client: reqwest::Client,
    endpoint: String,
    language: String,
    limiter: ServiceLimiter,
}

impl LanguageToolChecker {
    /// Create a checker for the server at `base_url`.
    pub fn new(
        base_url: &str,
        language: &Language,
        rate_limit: Option<&RateLimit>,
    ) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("LanguageTool URL must start with http:// or https://: {base_url:?}");
        }
        let client = reqwest::Client::builder()
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{base_url}/v2/check"),
            language: language.code().to_owned(),
            limiter: ServiceLimiter::new(rate_limit),
        })
    }

    async fn check_once(
        &self,
        text: &str,
    ) -> RetryResult<(), (), CheckResponse, anyhow::Error> {
        self.limiter.acquire().await;
        let form = [("text", text), ("language", self.language.as_str())];
        let response = try_potentially_transient!(
            self.client.post(&self.endpoint).form(&form).send().await
        );
        let response = try_potentially_transient!(response.error_for_status());
        let body = try_fatal!(response.json::<CheckResponse>().await);
        retry_result_ok(body)
    }
}

#[async_trait]
impl GrammarChecker for LanguageToolChecker {
    #[instrument(level = "debug", skip_all, fields(len = text.len()))]
    async fn check_grammar(&self, text: &str, auto_correct: bool) -> Result<GrammarReport> {
        // If we have a transient failure, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .check_once(text)
            .await
            .retry_with_async(|_| async { self.check_once(text).await })
            .with_exponential_jitter(|| jitter)
            .await;
        let response = resolve("LanguageTool", result)?;

        let issues = response
            .matches
            .into_iter()
            .map(GrammarIssue::from)
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
