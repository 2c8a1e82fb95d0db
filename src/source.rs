use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tracing::info;
use url::Url;

use crate::error::{PipelineError, Result};

/// Supplies the raw source media for a job
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Materialize `source_ref` inside `work_dir` and return the local path
    async fn fetch(&self, source_ref: &str, work_dir: &Path) -> Result<PathBuf>;
}

/// Fetches from the local filesystem: plain paths or `file://` URLs
#[derive(Debug, Clone, Default)]
pub struct LocalFileSource {
    /// When set, relative references resolve against this directory and
    /// nothing outside it is served
    pub root: Option<PathBuf>,
}

impl LocalFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Resolve a reference to a filesystem path without touching the disk
    pub fn resolve(&self, source_ref: &str) -> Result<PathBuf> {
        let trimmed = source_ref.trim();
        if trimmed.is_empty() {
            return Err(PipelineError::Source("empty source reference".into()));
        }

        let path = match Url::parse(trimmed) {
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map_err(|_| PipelineError::Source(format!("invalid file URL: {}", trimmed)))?,
            // Single letters are Windows drive prefixes, not schemes
            Ok(url) if url.scheme().len() > 1 => {
                return Err(PipelineError::Source(format!(
                    "unsupported source scheme '{}': {}",
                    url.scheme(),
                    trimmed
                )))
            }
            _ => PathBuf::from(trimmed),
        };

        match &self.root {
            Some(root) => confine(root, path),
            None => Ok(path),
        }
    }

    /// Resolve, then make sure symlinks do not lead out of the root
    async fn resolve_existing(&self, source_ref: &str) -> Result<PathBuf> {
        let origin = self.resolve(source_ref)?;
        let Some(root) = &self.root else {
            return Ok(origin);
        };

        let real_root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| PipelineError::Source(format!("{}: {}", root.display(), e)))?;
        let real_origin = tokio::fs::canonicalize(&origin)
            .await
            .map_err(|e| PipelineError::Source(format!("{}: {}", origin.display(), e)))?;
        if !real_origin.starts_with(&real_root) {
            return Err(outside_root(source_ref, root));
        }
        Ok(real_origin)
    }
}

fn confine(root: &Path, path: PathBuf) -> Result<PathBuf> {
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(outside_root(&path.display().to_string(), root));
    }
    let joined = if path.is_relative() { root.join(&path) } else { path };
    if !joined.starts_with(root) {
        return Err(outside_root(&joined.display().to_string(), root));
    }
    Ok(joined)
}

fn outside_root(source_ref: &str, root: &Path) -> PipelineError {
    PipelineError::Source(format!("{} is outside the source root {}", source_ref, root.display()))
}

#[async_trait]
impl SourceFetcher for LocalFileSource {
    async fn fetch(&self, source_ref: &str, work_dir: &Path) -> Result<PathBuf> {
        let origin = self.resolve_existing(source_ref).await?;
        let metadata = tokio::fs::metadata(&origin)
            .await
            .map_err(|e| PipelineError::Source(format!("{}: {}", origin.display(), e)))?;
        if !metadata.is_file() {
            return Err(PipelineError::Source(format!("{} is not a file", origin.display())));
        }

        let extension = origin
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let destination = work_dir.join(format!("source{}", extension));

        tokio::fs::create_dir_all(work_dir).await?;
        tokio::fs::copy(&origin, &destination)
            .await
            .map_err(|e| PipelineError::Source(format!("copy {}: {}", origin.display(), e)))?;

        info!(
            "📥 Fetched source {} ({:.1} MB)",
            origin.display(),
            metadata.len() as f64 / 1_048_576.0
        );
        Ok(destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_forms() {
        let open = LocalFileSource::new();
        assert_eq!(open.resolve("/abs/b.mkv").unwrap(), PathBuf::from("/abs/b.mkv"));
        assert_eq!(open.resolve("file:///tmp/c.mov").unwrap(), PathBuf::from("/tmp/c.mov"));
        assert!(open.resolve("s3://bucket/key.mp4").is_err());
        assert!(open.resolve("   ").is_err());

        let rooted = LocalFileSource::with_root("/data");
        assert_eq!(rooted.resolve("clips/a.mp4").unwrap(), PathBuf::from("/data/clips/a.mp4"));
        assert_eq!(rooted.resolve("/data/b.mkv").unwrap(), PathBuf::from("/data/b.mkv"));
        assert_eq!(rooted.resolve("file:///data/c.mov").unwrap(), PathBuf::from("/data/c.mov"));
    }

    #[test]
    fn test_root_rejects_paths_outside_it() {
        let rooted = LocalFileSource::with_root("/data");
        for escape in ["/etc/passwd", "file:///etc/passwd", "../etc/passwd", "clips/../../etc/passwd"] {
            assert!(
                matches!(rooted.resolve(escape), Err(PipelineError::Source(_))),
                "{escape} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fetch_refuses_symlink_out_of_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.mp4");
        std::fs::write(&secret, b"private").unwrap();
        std::os::unix::fs::symlink(&secret, root.path().join("link.mp4")).unwrap();

        let result = LocalFileSource::with_root(root.path())
            .fetch("link.mp4", work_dir.path())
            .await;
        assert!(matches!(result, Err(PipelineError::Source(_))));
        assert!(!work_dir.path().join("source.mp4").exists());
    }

    #[tokio::test]
    async fn test_fetch_copies_into_work_dir() {
        let origin_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let origin = origin_dir.path().join("lecture.mp4");
        std::fs::write(&origin, b"fake video").unwrap();

        let fetched = LocalFileSource::new()
            .fetch(origin.to_str().unwrap(), work_dir.path())
            .await
            .unwrap();

        assert_eq!(fetched, work_dir.path().join("source.mp4"));
        assert_eq!(std::fs::read(&fetched).unwrap(), b"fake video");
    }

    #[tokio::test]
    async fn test_missing_source_is_source_error() {
        let work_dir = tempfile::tempdir().unwrap();
        let result = LocalFileSource::new()
            .fetch("/definitely/not/here.mp4", work_dir.path())
            .await;
        assert!(matches!(result, Err(PipelineError::Source(_))));
    }
}
