//! Per-batch download statistics
//!
//! Atomic counters updated from every download task of one batch. The
//! coordinator takes a snapshot once all tasks have joined.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::downloader::core::ProgressTracker;

/// Counters shared by every task of one batch
#[derive(Debug, Default)]
pub struct DownloadMetrics {
    /// Artifacts a task began working on
    pub started: AtomicU64,
    /// Artifacts fetched into a verified temp file
    pub downloaded: AtomicU64,
    /// Artifacts reused from disk without a GET
    pub already_present: AtomicU64,
    /// Artifacts that ended in a terminal error
    pub failed: AtomicU64,
    /// Extra attempts after a retryable failure
    pub retries: AtomicU64,
    /// Downloads answered from a CDN cache
    pub cdn_hits: AtomicU64,
    /// Wire bytes of completed downloads
    pub bytes: AtomicU64,
}

impl DownloadMetrics {
    /// Record that a task started on an artifact
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a verified download of `wire_bytes` bytes
    pub fn record_downloaded(&self, wire_bytes: u64, cdn_hit: bool) {
        self.downloaded.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire_bytes, Ordering::Relaxed);
        if cdn_hit {
            self.cdn_hits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an artifact whose existing file was reused
    pub fn record_already_present(&self) {
        self.already_present.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an artifact that could not be fetched
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one retry of a failed attempt
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of the current counters
    pub fn snapshot(&self) -> DownloadMetricsSnapshot {
        DownloadMetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            already_present: self.already_present.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cdn_hits: self.cdn_hits.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of download metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadMetricsSnapshot {
    /// Artifacts a task began working on
    pub started: u64,
    /// Artifacts fetched into a verified temp file
    pub downloaded: u64,
    /// Artifacts reused from disk
    pub already_present: u64,
    /// Artifacts that ended in a terminal error
    pub failed: u64,
    /// Extra attempts after retryable failures
    pub retries: u64,
    /// Downloads answered from a CDN cache
    pub cdn_hits: u64,
    /// Wire bytes of completed downloads
    pub bytes: u64,
}

impl DownloadMetricsSnapshot {
    /// Share of started artifacts that ended up on disk (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.started == 0 {
            0.0
        } else {
            (self.downloaded + self.already_present) as f64 / self.started as f64
        }
    }

    /// Average wire size of the files actually fetched
    pub fn average_size(&self) -> f64 {
        if self.downloaded == 0 {
            0.0
        } else {
            self.bytes as f64 / self.downloaded as f64
        }
    }
}

/// Everything a download task reports into
#[derive(Debug, Clone)]
pub struct DownloadTelemetry {
    pub metrics: Arc<DownloadMetrics>,
    pub progress: Arc<ProgressTracker>,
}

impl DownloadTelemetry {
    /// Bundle the counters and progress tracker of one batch
    pub fn new(metrics: Arc<DownloadMetrics>, progress: Arc<ProgressTracker>) -> Self {
        Self { metrics, progress }
    }

    /// Telemetry that is counted but never reported anywhere
    pub fn detached() -> Self {
        Self::new(Arc::default(), Arc::new(ProgressTracker::detached()))
    }
}
