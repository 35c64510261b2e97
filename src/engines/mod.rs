//! Pluggable collaborators used by the [`Pipeline`](crate::pipeline::Pipeline).
//!
//! There are three seams:
//!
//! - [`SourceValidator`] decides whether a source can be read at all.
//! - [`Recognizer`] turns a source into text.
//! - [`GrammarChecker`] finds (and optionally fixes) problems in that text.
//!
//! Collaborator errors are reported as [`anyhow::Error`]. The pipeline is
//! responsible for classifying them.

use std::{fmt, str::FromStr, sync::Arc};

use clap::ValueEnum;
use schemars::JsonSchema;
use tempfile::TempPath;

use crate::{job::JobSource, prelude::*, rate_limit::RateLimit};

pub mod backend;
pub mod grammar_rules;
pub mod languagetool;
pub mod plain_text;
pub mod tesseract;
pub mod validate;

/// How the recognizer should binarize images before recognition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    #[default]
    AdaptiveGaussian,
    AdaptiveMean,
    Otsu,
    Simple,
}

/// Image preprocessing options. These are passed through to the recognizer
/// unchanged, and recognizers may ignore options they don't support.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessingOptions {
    /// Stretch image contrast before recognition.
    pub enhance_contrast: bool,
    /// Remove speckle noise.
    pub denoise: bool,
    /// How to binarize the image.
    pub threshold_method: ThresholdMethod,
    /// Apply morphological opening and closing.
    pub apply_morphology: bool,
}

impl Default for PreprocessingOptions {
    fn default() -> Self {
        Self {
            enhance_contrast: true,
            denoise: true,
            threshold_method: ThresholdMethod::default(),
            apply_morphology: true,
        }
    }
}

/// A bounding box, in pixels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: i64,
    pub y: i64,
    pub width: i64,
    pub height: i64,
}

/// A single recognized word.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WordDetail {
    pub text: String,
    /// Confidence, from 0.0 to 1.0.
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Text produced by a [`Recognizer`].
#[derive(Clone, Debug, PartialEq)]
pub struct Extraction {
    pub text: String,
    /// Overall confidence, from 0.0 to 1.0.
    pub confidence: f32,
    /// Identifies the engine which produced this text.
    pub engine_id: String,
    /// Per-word details, if the engine provides them.
    pub words: Vec<WordDetail>,
}

/// A grammar or style problem found in a piece of text.
///
/// `offset` and `length` are measured in characters, not bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrammarIssue {
    pub rule_id: String,
    pub category: String,
    pub message: String,
    pub offset: usize,
    pub length: usize,
    /// Suggested replacements, best first.
    pub suggestions: Vec<String>,
}

/// The output of a [`GrammarChecker`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GrammarReport {
    pub issues: Vec<GrammarIssue>,
    /// The text with corrections applied, if requested. Otherwise, the
    /// original text.
    pub corrected_text: String,
}

/// Decides whether a source is readable.
#[async_trait]
pub trait SourceValidator: Send + Sync + 'static {
    /// Is this source present, readable and non-empty?
    async fn validate(&self, source: &JobSource) -> bool;
}

/// Extracts text from a source.
#[async_trait]
pub trait Recognizer: Send + Sync + 'static {
    /// Extract text from `source`.
    async fn extract_text(
        &self,
        source: &JobSource,
        options: &PreprocessingOptions,
    ) -> Result<Extraction>;
}

/// Checks text for grammar problems.
#[async_trait]
pub trait GrammarChecker: Send + Sync + 'static {
    /// Check `text`. If `auto_correct` is set, the report's `corrected_text`
    /// should have the first suggestion for each issue applied.
    async fn check_grammar(&self, text: &str, auto_correct: bool) -> Result<GrammarReport>;
}

/// The collaborators needed to run a pipeline.
#[derive(Clone)]
pub struct Collaborators {
    pub validator: Arc<dyn SourceValidator>,
    pub recognizer: Arc<dyn Recognizer>,
    pub checker: Arc<dyn GrammarChecker>,
}

/// Which [`Recognizer`] to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum RecognizerKind {
    /// Read files as UTF-8 text.
    #[default]
    Plain,
    /// Run the local `tesseract` CLI.
    Tesseract,
    /// Call an OCR backend over HTTP.
    Backend,
}

/// Which [`GrammarChecker`] to use.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum CheckerKind {
    /// Built-in offline rules.
    #[default]
    Rules,
    /// A LanguageTool server.
    Languagetool,
}

/// Options used to build collaborators.
#[derive(Clone, Debug, Default)]
pub struct CollaboratorOpts {
    pub recognizer: RecognizerKind,
    pub checker: CheckerKind,
    /// Base URL of the OCR backend.
    pub backend_url: Option<String>,
    /// Base URL of the LanguageTool server.
    pub languagetool_url: Option<String>,
    /// Language code for grammar checking and OCR.
    pub language: Language,
    /// Rate limit for calls to remote services.
    pub rate_limit: Option<RateLimit>,
}

/// Build the collaborators described by `opts`.
pub fn collaborators_for(opts: &CollaboratorOpts) -> Result<Collaborators> {
    let recognizer: Arc<dyn Recognizer> = match opts.recognizer {
        RecognizerKind::Plain => Arc::new(plain_text::PlainTextRecognizer::new()),
        RecognizerKind::Tesseract => {
            Arc::new(tesseract::TesseractRecognizer::new(&opts.language))
        }
        RecognizerKind::Backend => {
            let url = opts
                .backend_url
                .as_deref()
                .ok_or_else(|| anyhow!("the backend recognizer needs BACKEND_URL"))?;
            Arc::new(backend::BackendRecognizer::new(url, opts.rate_limit.as_ref())?)
        }
    };
    let checker: Arc<dyn GrammarChecker> = match opts.checker {
        CheckerKind::Rules => Arc::new(grammar_rules::RuleGrammarChecker::new()?),
        CheckerKind::Languagetool => {
            let url = opts.languagetool_url.as_deref().ok_or_else(|| {
                anyhow!("the LanguageTool checker needs LANGUAGETOOL_URL")
            })?;
            Arc::new(languagetool::LanguageToolChecker::new(
                url,
                &opts.language,
                opts.rate_limit.as_ref(),
            )?)
        }
    };
    Ok(Collaborators {
        validator: Arc::new(validate::FsSourceValidator),
        recognizer,
        checker,
    })
}

/// A language, as a LanguageTool-style code like `en-US`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Language(String);

impl Language {
    /// The LanguageTool code, like `en-US`.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// The Tesseract language pack name, like `eng`.
    pub fn tesseract_code(&self) -> &str {
        let primary = self.0.split('-').next().unwrap_or_default();
        match primary {
            "de" => "deu",
            "es" => "spa",
            "fr" => "fra",
            "it" => "ita",
            "nl" => "nld",
            "pt" => "por",
            _ => "eng",
        }
    }
}

impl Default for Language {
    fn default() -> Self {
        Self("en-US".to_owned())
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Language {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && s.split('-')
                .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()));
        if valid {
            Ok(Self(s.to_owned()))
        } else {
            Err(anyhow!("invalid language code: {:?}", s))
        }
    }
}

/// Apply the first suggestion of each issue to `text`.
///
/// Issues are applied from the end of the text backwards, so that earlier
/// offsets stay valid. Issues without suggestions, issues outside the text, and
/// issues overlapping an already-applied issue are skipped.
pub fn apply_corrections(text: &str, issues: &[GrammarIssue]) -> String {
    // Map character offsets to byte offsets, with one extra entry for the end.
    let mut boundaries = text.char_indices().map(|(idx, _)| idx).collect::<Vec<_>>();
    boundaries.push(text.len());
    let char_len = boundaries.len() - 1;

    let mut sorted = issues.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| b.offset.cmp(&a.offset).then(b.length.cmp(&a.length)));

    let mut corrected = text.to_owned();
    let mut applied_floor = char_len;
    for issue in sorted {
        let Some(replacement) = issue.suggestions.first() else {
            continue;
        };
        let Some(end) = issue.offset.checked_add(issue.length) else {
            continue;
        };
        if end > applied_floor || end > char_len {
            continue;
        }
        let range = boundaries[issue.offset]..boundaries[end];
        corrected.replace_range(range, replacement);
        applied_floor = issue.offset;
    }
    corrected
}

/// A local file containing a source's data. In-memory sources are written to a
/// temporary file, which is deleted when this is dropped.
pub(crate) struct LocalFile {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl LocalFile {
    /// Get a local file for `source`.
    pub(crate) async fn for_source(source: &JobSource) -> Result<Self> {
        match source {
            JobSource::Path { path } => Ok(Self {
                path: path.clone(),
                _temp: None,
            }),
            JobSource::Memory { name, data } => {
                let suffix = source
                    .extension()
                    .map(|ext| format!(".{ext}"))
                    .unwrap_or_default();
                let temp = tempfile::Builder::new()
                    .prefix("batch-proofer")
                    .suffix(&suffix)
                    .tempfile()
                    .with_context(|| format!("cannot create temporary file for {name}"))?
                    .into_temp_path();
                tokio::fs::write(&temp, data)
                    .await
                    .with_context(|| format!("cannot write temporary file for {name}"))?;
                Ok(Self {
                    path: temp.to_path_buf(),
                    _temp: Some(temp),
                })
            }
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}
