//! Artifact Fetch Library
//!
//! Concurrent, verified downloads of remote build artifacts. A batch of
//! artifacts is fetched over HTTP with bounded retry, every file is checked
//! against the server-declared `Content-Length`, and the results are moved
//! into a target directory all-or-nothing.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use artifact_fetch::{
//!     ArtifactDescriptor, DownloadConfig, DownloadContext, DownloadCoordinator,
//!     TracingProgressSink,
//! };
//! use std::path::Path;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> artifact_fetch::Result<()> {
//! let coordinator = DownloadCoordinator::new(DownloadConfig::default())?;
//!
//! let descriptors = vec![
//!     ArtifactDescriptor::new(
//!         "https://cache.example.com/modules/core.jar",
//!         "core.jar",
//!         "Compiled output of :core",
//!     )?,
//!     ArtifactDescriptor::new(
//!         "https://cache.example.com/metadata/core.bin",
//!         "core.bin",
//!         "Metadata of :core",
//!     )?,
//! ];
//!
//! let token = CancellationToken::new();
//! let context = DownloadContext::new()
//!     .with_cancellation_token(token.clone())
//!     .with_total_expected_count(descriptors.len() as u64)
//!     .with_progress_sink(TracingProgressSink::new(true));
//!
//! let result = coordinator
//!     .download_all(descriptors, Path::new("build/artifacts"), &context)
//!     .await?;
//!
//! for outcome in &result.outcomes {
//!     println!("{} -> {}", outcome.descriptor.presentable_name(), outcome.local_file.display());
//! }
//! println!("{} bytes in {:?}", result.total_bytes, result.elapsed);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Bounded retry**: transport failures, truncated bodies and 5xx answers are retried with a fixed delay
//! - **Completeness checks**: wire bytes must match `Content-Length`, also for gzip bodies
//! - **All-or-nothing batches**: temp files are removed on failure or cancellation
//! - **Idempotent re-runs**: files already on disk with the remote length are reused
//! - **Shared worker pool**: concurrency is bounded across batches
//! - **Speed probe**: optional calibration downloads to estimate throughput

pub mod downloader;

// Re-export commonly used types for convenience
pub use downloader::{
    AcceptEncoding, ArtifactDescriptor, BatchResult, CalibrationTier, ConnectionSpeedProber, DownloadConfig,
    DownloadContext, DownloadCoordinator, DownloadError, DownloadOutcome, HeaderProvider, PerFileDownloader,
    ProbeConfig, ProgressCallback, ProgressEvent, ProgressSink, Result, SpeedStatistics, StaticHeaders,
    TracingProgressSink, WorkerPool,
};
