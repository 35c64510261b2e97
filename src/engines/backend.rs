//! Recognizer which calls an OCR backend over HTTP.
//!
//! The backend accepts `POST {base}/ocr/image` with a JSON body naming a local
//! file and the preprocessing options, and returns the recognized text with
//! per-word details.

use keen_retry::{ExponentialJitter, RetryResult};

use crate::{
    job::JobSource,
    prelude::*,
    rate_limit::{RateLimit, ServiceLimiter},
    retry::transient::{
        IsKnownTransient, resolve, retry_result_fatal, retry_result_ok, try_fatal,
        try_potentially_transient,
    },
};

use super::{Extraction, LocalFile, PreprocessingOptions, Recognizer, WordDetail};

/// Request body for the OCR backend.
#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    file_path: &'a str,
    preprocessing_options: &'a PreprocessingOptions,
}

/// Response body from the OCR backend.
#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    engine_used: Option<String>,
    #[serde(default)]
    word_details: Vec<WordDetail>,
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    error_message: Option<String>,
}

fn default_success() -> bool {
    true
}

/// Recognizer backed by a remote OCR service.
pub struct BackendRecognizer {
    client: reqwest::Client,
    endpoint: String,
    limiter: ServiceLimiter,
}

impl BackendRecognizer {
    /// Create a recognizer for the backend at `base_url`.
    pub fn new(base_url: &str, rate_limit: Option<&RateLimit>) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            bail!("OCR backend URL must start with http:// or https://: {base_url:?}");
        }
        let client = reqwest::Client::builder()
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{base_url}/ocr/image"),
            limiter: ServiceLimiter::new(rate_limit),
        })
    }

    /// Make a single request, classifying failures as transient or fatal.
    async fn request_once(
        &self,
        request: &OcrRequest<'_>,
    ) -> RetryResult<(), (), OcrResponse, anyhow::Error> {
        self.limiter.acquire().await;
        let response = try_potentially_transient!(
            self.client.post(&self.endpoint).json(request).send().await
        );
        let response = try_potentially_transient!(response.error_for_status());
        let body = try_fatal!(response.json::<OcrResponse>().await);
        if !body.success {
            let message = body
                .error_message
                .unwrap_or_else(|| "unknown error".to_owned());
            return retry_result_fatal(anyhow!("OCR backend failed: {message}"));
        }
        retry_result_ok(body)
    }
}

#[async_trait]
impl Recognizer for BackendRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %source.display_name()))]
    async fn extract_text(
        &self,
        source: &JobSource,
        options: &PreprocessingOptions,
    ) -> Result<Extraction> {
        let local = LocalFile::for_source(source).await?;
        let file_path = local.path().to_string_lossy();
        let request = OcrRequest {
            file_path: &file_path,
            preprocessing_options: options,
        };

        // If we have a transient failure, back off exponentially.
        let jitter = ExponentialJitter::FromBackoffRange {
            backoff_range_millis: 1..=30_000,
            re_attempts: 5,
            jitter_ratio: 0.2,
        };
        let result = self
            .request_once(&request)
            .await
            .retry_with_async(|_| async { self.request_once(&request).await })
            .with_exponential_jitter(|| jitter)
            .await;
        let response = resolve("OCR backend", result)?;

        Ok(Extraction {
            text: response.text,
            confidence: response.confidence.clamp(0.0, 1.0),
            engine_id: response
                .engine_used
                .unwrap_or_else(|| "backend".to_owned()),
            words: response.word_details,
        })
    }
}
