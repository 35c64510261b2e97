//! Source validation.

use tokio::fs;

use crate::{job::JobSource, prelude::*};

use super::SourceValidator;

/// Accepts sources which exist, are regular files (or in-memory data), can be
/// opened, and are not empty.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsSourceValidator;

#[async_trait]
impl SourceValidator for FsSourceValidator {
    #[instrument(level = "debug", skip_all)]
    async fn validate(&self, source: &JobSource) -> bool {
        match source {
            JobSource::Memory { data, .. } => !data.is_empty(),
            JobSource::Path { path } => match fs::metadata(path).await {
                Ok(metadata) if metadata.is_file() && metadata.len() > 0 => {
                    // Metadata can succeed on files we can't actually read.
                    match fs::File::open(path).await {
                        Ok(_) => true,
                        Err(err) => {
                            debug!(path = %path.display(), "cannot open file: {}", err);
                            false
                        }
                    }
                }
                Ok(_) => {
                    debug!(path = %path.display(), "not a non-empty regular file");
                    false
                }
                Err(err) => {
                    debug!(path = %path.display(), "cannot stat file: {}", err);
                    false
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write as _, sync::Arc};

    use super::*;

    #[tokio::test]
    async fn accepts_readable_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        let source = JobSource::Path {
            path: file.path().to_owned(),
        };
        assert!(FsSourceValidator.validate(&source).await);
    }

    #[tokio::test]
    async fn rejects_missing_empty_and_directories() {
        let empty = tempfile::NamedTempFile::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        for path in [
            PathBuf::from("/does/not/exist.png"),
            empty.path().to_owned(),
            dir.path().to_owned(),
        ] {
            let source = JobSource::Path { path };
            assert!(!FsSourceValidator.validate(&source).await);
        }
        let source = JobSource::Memory {
            name: "empty.png".to_owned(),
            data: Arc::from(&b""[..]),
        };
        assert!(!FsSourceValidator.validate(&source).await);
    }
}
