//! Core types used throughout the downloader system
//!
//! This module contains the fundamental types that all other modules depend on:
//! artifact descriptors, the per-batch download context, outcomes and the
//! header-provider seam.

pub mod copy;
pub mod error;
pub mod files;
pub mod http;
pub mod progress;

// Re-export main types for convenience
pub use copy::{BodyDecoder, CopyError, CopyReport, CountingReader, StreamCopier};
pub use error::{DownloadError, ErrorSeverity, FileOperation, Result};
pub use http::AcceptEncoding;
pub use progress::{
    CompositeProgressSink, IntoProgressCallback, NullProgressSink, ProgressCallback, ProgressEvent, ProgressSink,
    ProgressTracker, TracingProgressSink,
};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

/// A single named remote file to fetch
///
/// Identity is the download URL: two descriptors with the same URL are the
/// same artifact no matter which file name they suggest.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactDescriptor {
    download_url: String,
    default_file_name: String,
    presentable_name: String,
}

impl ArtifactDescriptor {
    /// Create a descriptor, validating the URL and the suggested file name
    pub fn new(
        download_url: impl Into<String>,
        default_file_name: impl Into<String>,
        presentable_name: impl Into<String>,
    ) -> Result<Self> {
        let download_url = download_url.into();
        let default_file_name = default_file_name.into();

        let parsed = url::Url::parse(&download_url).map_err(|source| DownloadError::InvalidUrl {
            url: download_url.clone(),
            source,
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(DownloadError::InvalidDescriptor {
                reason: format!("unsupported scheme '{}' in {}", parsed.scheme(), download_url),
            });
        }

        validate_file_name(&default_file_name)?;

        Ok(Self {
            download_url,
            default_file_name,
            presentable_name: presentable_name.into(),
        })
    }

    pub fn download_url(&self) -> &str {
        &self.download_url
    }

    pub fn default_file_name(&self) -> &str {
        &self.default_file_name
    }

    pub fn presentable_name(&self) -> &str {
        &self.presentable_name
    }
}

impl PartialEq for ArtifactDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.download_url == other.download_url
    }
}

impl Eq for ArtifactDescriptor {}

impl Hash for ArtifactDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.download_url.hash(state);
    }
}

/// The name has to stay inside the target directory
fn validate_file_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("file name is empty".to_string())
    } else if name == "." || name == ".." {
        Some(format!("file name '{}' is not a file", name))
    } else if name.contains('/') || name.contains('\\') {
        Some(format!("file name '{}' contains a path separator", name))
    } else if name.contains('\0') {
        Some("file name contains a NUL byte".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(DownloadError::InvalidDescriptor { reason }),
        None => Ok(()),
    }
}

/// Caller-supplied state shared by every download of one batch
#[derive(Clone, Default)]
pub struct DownloadContext {
    cancellation: CancellationToken,
    total_expected_count: Option<u64>,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for DownloadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadContext")
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("total_expected_count", &self.total_expected_count)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

impl DownloadContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Number of artifacts the caller expects across the whole operation
    ///
    /// Without it no progress fraction is reported, only status text.
    pub fn with_total_expected_count(mut self, count: u64) -> Self {
        self.total_expected_count = Some(count);
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn with_progress_sink<S: ProgressSink + 'static>(self, sink: S) -> Self {
        self.with_progress_callback(sink.into_callback())
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn total_expected_count(&self) -> Option<u64> {
        self.total_expected_count
    }

    pub fn progress_callback(&self) -> Option<&ProgressCallback> {
        self.progress.as_ref()
    }
}

/// Where one artifact of a successful batch ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub local_file: PathBuf,
    pub descriptor: ArtifactDescriptor,
    /// The file was already on disk with the right length and was not fetched
    pub was_already_present: bool,
}

/// Source of extra request headers, typically authentication
#[async_trait]
pub trait HeaderProvider: Send + Sync {
    async fn headers(&self) -> Result<HeaderMap>;
}

/// Header provider returning a fixed set of headers
#[derive(Debug, Clone, Default)]
pub struct StaticHeaders(pub HeaderMap);

#[async_trait]
impl HeaderProvider for StaticHeaders {
    async fn headers(&self) -> Result<HeaderMap> {
        Ok(self.0.clone())
    }
}

/// A verified download still sitting in its temp file
#[derive(Debug)]
pub struct TempArtifact {
    pub temp_path: TempPath,
    /// Bytes consumed from the wire, equal to the declared `Content-Length`
    pub wire_bytes: u64,
    /// Bytes written to disk after decoding
    pub written_bytes: u64,
    pub cdn_hit: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_descriptor_identity_is_the_url() {
        let a = ArtifactDescriptor::new("https://cache.example.com/a.bin", "a.bin", "Module A").unwrap();
        let b = ArtifactDescriptor::new("https://cache.example.com/a.bin", "other.bin", "Module A again").unwrap();
        let c = ArtifactDescriptor::new("https://cache.example.com/c.bin", "a.bin", "Module C").unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_descriptor_rejects_bad_input() {
        assert!(matches!(
            ArtifactDescriptor::new("not a url", "a.bin", "A"),
            Err(DownloadError::InvalidUrl { .. })
        ));
        assert!(matches!(
            ArtifactDescriptor::new("ftp://cache.example.com/a.bin", "a.bin", "A"),
            Err(DownloadError::InvalidDescriptor { .. })
        ));
        for name in ["", "..", "../escape.bin", "dir/a.bin", "dir\\a.bin"] {
            assert!(
                matches!(
                    ArtifactDescriptor::new("https://cache.example.com/a.bin", name, "A"),
                    Err(DownloadError::InvalidDescriptor { .. })
                ),
                "name {:?} should be rejected",
                name
            );
        }
    }

    #[test]
    fn test_context_defaults() {
        let context = DownloadContext::new();
        assert!(!context.is_cancelled());
        assert_eq!(context.total_expected_count(), None);
        assert!(context.progress_callback().is_none());

        let token = CancellationToken::new();
        let context = context
            .with_cancellation_token(token.clone())
            .with_total_expected_count(12)
            .with_progress_sink(NullProgressSink);
        token.cancel();

        assert!(context.is_cancelled());
        assert_eq!(context.total_expected_count(), Some(12));
        assert!(format!("{:?}", context).contains("has_progress: true"));
    }
}
