//! A "recognizer" for files which already contain text.

use crate::{job::JobSource, prelude::*};

use super::{Extraction, PreprocessingOptions, Recognizer};

/// Reads sources as UTF-8 text. Useful for already-digitized documents, and
/// for testing without an OCR engine installed.
#[non_exhaustive]
#[derive(Debug, Default)]
pub struct PlainTextRecognizer {}

impl PlainTextRecognizer {
    pub fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl Recognizer for PlainTextRecognizer {
    #[instrument(level = "debug", skip_all, fields(source = %source.display_name()))]
    async fn extract_text(
        &self,
        source: &JobSource,
        _options: &PreprocessingOptions,
    ) -> Result<Extraction> {
        let bytes = match source {
            JobSource::Path { path } => tokio::fs::read(path)
                .await
                .with_context(|| format!("cannot read {}", path.display()))?,
            JobSource::Memory { data, .. } => data.to_vec(),
        };
        let text = String::from_utf8(bytes).map_err(|_| {
            anyhow!("{} is not UTF-8 text", source.display_name())
        })?;
        Ok(Extraction {
            text,
            confidence: 1.0,
            engine_id: "plain-text".to_owned(),
            words: vec![],
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn reads_utf8() {
        let source = JobSource::Memory {
            name: "a.txt".to_owned(),
            data: Arc::from("Hello, world.".as_bytes()),
        };
        let extraction = PlainTextRecognizer::new()
            .extract_text(&source, &PreprocessingOptions::default())
            .await
            .unwrap();
        assert_eq!(extraction.text, "Hello, world.");
        assert_eq!(extraction.engine_id, "plain-text");
    }

    #[tokio::test]
    async fn rejects_binary() {
        let source = JobSource::Memory {
            name: "a.png".to_owned(),
            data: Arc::from(&[0x89, 0x50, 0xff, 0xfe][..]),
        };
        let result = PlainTextRecognizer::new()
            .extract_text(&source, &PreprocessingOptions::default())
            .await;
        assert!(result.is_err());
    }
}
