//! Downloader module
//!
//! This module contains all the download functionality including
//! core types, configuration, the per-file downloader, batch coordination
//! and the connection speed probe.

pub mod batch;
pub mod config;
pub mod core;
pub mod file;
pub mod pool;
pub mod probe;

// Re-export main types for convenience
pub use batch::{BatchResult, BatchState, DownloadCoordinator, DownloadMetrics, DownloadMetricsSnapshot};
pub use config::{DownloadConfig, DownloadConfigBuilder, ProbeConfig};
pub use core::{
    AcceptEncoding, ArtifactDescriptor, CompositeProgressSink, DownloadContext, DownloadError, DownloadOutcome, ErrorSeverity,
    FileOperation, HeaderProvider, IntoProgressCallback, NullProgressSink, ProgressCallback, ProgressEvent,
    ProgressSink, Result, StaticHeaders, StreamCopier, TracingProgressSink,
};
pub use file::{FileOutcome, PerFileDownloader};
pub use pool::WorkerPool;
pub use probe::{CalibrationTier, ConnectionSpeedProber, SpeedStatistics};
