//! Tesseract OCR recognizer.

use tokio::process::Command;

use crate::{
    async_utils::check_for_command_failure, cpu_limit::with_cpu_semaphore,
    job::JobSource, prelude::*,
};

use super::{
    BoundingBox, Extraction, Language, LocalFile, PreprocessingOptions, Recognizer,
    ThresholdMethod, WordDetail,
};

/// Recognizer wrapping the `tesseract` CLI tool.
///
/// We ask for TSV output, which gives us per-word confidences and bounding
/// boxes in addition to the text.
pub struct TesseractRecognizer {
    /// Tesseract language pack, like `eng`.
    language: String,
}

impl TesseractRecognizer {
    /// Create a new `tesseract` recognizer.
    pub fn new(language: &Language) -> Self {
        Self {
            language: language.tesseract_code().to_owned(),
        }
    }
}

/// Map our threshold method onto Tesseract's `thresholding_method` variable.
fn tesseract_thresholding(method: ThresholdMethod) -> Option<u8> {
    match method {
        ThresholdMethod::Otsu => Some(0),
        ThresholdMethod::AdaptiveMean => Some(1),
        ThresholdMethod::AdaptiveGaussian => Some(2),
        ThresholdMethod::Simple => None,
    }
}

#[async_trait]
impl Recognizer for TesseractRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %source.display_name()))]
    async fn extract_text(
        &self,
        source: &JobSource,
        options: &PreprocessingOptions,
    ) -> Result<Extraction> {
        if options.enhance_contrast || options.denoise || options.apply_morphology {
            trace!("tesseract does its own image cleanup, ignoring preprocessing flags");
        }

        let local = LocalFile::for_source(source).await?;
        let mut command = Command::new("tesseract");
        command
            .arg(local.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.language);
        if let Some(method) = tesseract_thresholding(options.threshold_method) {
            command
                .arg("-c")
                .arg(format!("thresholding_method={method}"));
        }
        command.arg("tsv");

        // Tesseract will happily use a whole core per process.
        let output = with_cpu_semaphore(|| async move {
            command.output().await.context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let tsv = String::from_utf8_lossy(&output.stdout);
        parse_tsv(&tsv)
    }
}

/// Parse Tesseract's TSV output into an [`Extraction`].
///
/// Words on the same line are joined with spaces, lines with newlines, and
/// paragraphs with blank lines.
fn parse_tsv(tsv: &str) -> Result<Extraction> {
    let mut text = String::new();
    let mut words = vec![];
    let mut last_line: Option<(u32, u32, u32, u32)> = None;
    let mut last_par: Option<(u32, u32, u32)> = None;

    for (line_no, row) in tsv.lines().enumerate().skip(1) {
        let cols = row.split('\t').collect::<Vec<_>>();
        if cols.len() < 12 {
            continue;
        }
        let num = |idx: usize| -> Result<u32> {
            cols[idx].parse::<u32>().with_context(|| {
                format!("bad tesseract TSV value on line {}: {:?}", line_no + 1, row)
            })
        };
        // Level 5 rows are words. Everything else is layout.
        if num(0)? != 5 {
            continue;
        }
        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }
        let par = (num(1)?, num(2)?, num(3)?);
        let line = (par.0, par.1, par.2, num(4)?);

        if last_line != Some(line) && last_line.is_some() {
            text.push('\n');
            if last_par != Some(par) {
                text.push('\n');
            }
        } else if last_line.is_some() {
            text.push(' ');
        }
        text.push_str(word);
        last_line = Some(line);
        last_par = Some(par);

        let coord = |idx: usize| cols[idx].parse::<i64>().unwrap_or_default();
        let confidence = cols[10].parse::<f32>().unwrap_or(-1.0);
        words.push(WordDetail {
            text: word.to_owned(),
            confidence: (confidence / 100.0).clamp(0.0, 1.0),
            bbox: BoundingBox {
                x: coord(6),
                y: coord(7),
                width: coord(8),
                height: coord(9),
            },
        });
    }

    let confidence = if words.is_empty() {
        0.0
    } else {
        words.iter().map(|w| w.confidence).sum::<f32>() / words.len() as f32
    };
    Ok(Extraction {
        text,
        confidence,
        engine_id: "tesseract".to_owned(),
        words,
    })
}
