//! Connection speed probing
//!
//! A small calibration file gives a first throughput estimate, which picks a
//! larger calibration file worth measuring. The larger file is then fetched,
//! decompressed and deleted, and each step is timed. The result is advisory:
//! any failure simply yields no statistics.

use serde::Serialize;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempPath;
use tracing::{Instrument, debug, info, info_span};

use crate::downloader::config::{DownloadConfig, ProbeConfig};
use crate::downloader::core::files::discard;
use crate::downloader::core::{
    AcceptEncoding, DownloadContext, DownloadError, FileOperation, ProgressEvent, Result, TempArtifact,
};
use crate::downloader::file::PerFileDownloader;

/// Size class of the second calibration download
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CalibrationTier {
    #[serde(rename = "5MB")]
    Mb5,
    #[serde(rename = "10MB")]
    Mb10,
    #[serde(rename = "20MB")]
    Mb20,
    #[serde(rename = "50MB")]
    Mb50,
}

impl CalibrationTier {
    /// Tier for a measured throughput in bytes per second (decimal units)
    pub fn select(bytes_per_sec: f64) -> Option<Self> {
        if bytes_per_sec > 3_000_000.0 {
            Some(CalibrationTier::Mb50)
        } else if bytes_per_sec > 2_000_000.0 {
            Some(CalibrationTier::Mb20)
        } else if bytes_per_sec > 1_000_000.0 {
            Some(CalibrationTier::Mb10)
        } else if bytes_per_sec > 700_000.0 {
            Some(CalibrationTier::Mb5)
        } else {
            None
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CalibrationTier::Mb5 => "5MB",
            CalibrationTier::Mb10 => "10MB",
            CalibrationTier::Mb20 => "20MB",
            CalibrationTier::Mb50 => "50MB",
        }
    }

    pub fn file_name(self) -> String {
        format!("calibration-{}.gz", self.label())
    }
}

impl std::fmt::Display for CalibrationTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Timings of one probe run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedStatistics {
    pub tier: CalibrationTier,
    /// Throughput of the small calibration download, bytes per second
    pub initial_speed_bps: f64,
    /// Throughput of the tier download, bytes per second
    pub download_speed_bps: f64,
    pub download_time: Duration,
    pub decompression_time: Duration,
    pub decompressed_bytes: u64,
    pub deletion_time: Duration,
}

pub struct ConnectionSpeedProber {
    downloader: Arc<PerFileDownloader>,
    config: ProbeConfig,
}

impl ConnectionSpeedProber {
    pub fn new(download_config: DownloadConfig, config: ProbeConfig) -> Result<Self> {
        Ok(Self::with_downloader(Arc::new(PerFileDownloader::new(download_config)?), config))
    }

    /// Probe with a downloader shared with a coordinator
    pub fn with_downloader(downloader: Arc<PerFileDownloader>, config: ProbeConfig) -> Self {
        Self { downloader, config }
    }

    /// Measure the connection, `None` when it is too slow or anything fails
    pub async fn measure(&self, context: &DownloadContext) -> Option<SpeedStatistics> {
        let span = info_span!("speed_probe", base_url = %self.config.base_url);
        async {
            match self.try_measure(context).await {
                Ok(statistics) => statistics,
                Err(e) => {
                    debug!("Speed probe gave up: {}", e);
                    None
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn try_measure(&self, context: &DownloadContext) -> Result<Option<SpeedStatistics>> {
        if let Some(callback) = context.progress_callback() {
            callback(ProgressEvent::Status {
                text: "Measuring connection speed".to_string(),
            });
        }

        let scratch = self.config.scratch_dir();
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|source| DownloadError::FileSystem {
                path: scratch.clone(),
                operation: FileOperation::CreateDir,
                source,
            })?;

        let initial_url = self.config.file_url(&self.config.initial_file_name)?;
        let (initial, initial_time) = self.timed_fetch(&initial_url, &scratch, context).await?;
        let initial_speed_bps = throughput(initial.wire_bytes, initial_time);
        discard(initial.temp_path);

        let Some(tier) = CalibrationTier::select(initial_speed_bps) else {
            info!("Connection too slow for a speed tier ({:.0} B/s)", initial_speed_bps);
            return Ok(None);
        };
        debug!("Initial throughput {:.0} B/s, probing the {} tier", initial_speed_bps, tier);

        let tier_url = self.config.file_url(&tier.file_name())?;
        let (artifact, download_time) = self.timed_fetch(&tier_url, &scratch, context).await?;
        let download_speed_bps = throughput(artifact.wire_bytes, download_time);

        let decompress_started = Instant::now();
        let (temp_path, decompressed) = run_blocking(artifact.temp_path, gunzip_len).await?;
        let decompressed_bytes = decompressed.map_err(|source| DownloadError::Decode {
            url: tier_url.clone(),
            source,
        })?;
        let decompression_time = decompress_started.elapsed();

        let deletion_started = Instant::now();
        let path = temp_path.to_path_buf();
        tokio::task::spawn_blocking(move || temp_path.close())
            .await
            .map_err(|e| DownloadError::TaskPanicked { reason: e.to_string() })?
            .map_err(|source| DownloadError::FileSystem {
                path,
                operation: FileOperation::Delete,
                source,
            })?;
        let deletion_time = deletion_started.elapsed();

        let statistics = SpeedStatistics {
            tier,
            initial_speed_bps,
            download_speed_bps,
            download_time,
            decompression_time,
            decompressed_bytes,
            deletion_time,
        };
        info!(
            "Connection speed: {:.0} B/s on the {} tier, decompressed {} bytes in {:?}",
            download_speed_bps, tier, decompressed_bytes, decompression_time
        );
        Ok(Some(statistics))
    }

    async fn timed_fetch(&self, url: &str, dir: &Path, context: &DownloadContext) -> Result<(TempArtifact, Duration)> {
        let started = Instant::now();
        // Calibration files are gzip archives in their own right and must stay compressed.
        let artifact = self
            .downloader
            .fetch_once(url, dir, context, AcceptEncoding::Identity)
            .await?;
        Ok((artifact, started.elapsed()))
    }
}

fn throughput(bytes: u64, elapsed: Duration) -> f64 {
    bytes as f64 / elapsed.as_secs_f64().max(1e-6)
}

/// Run `work` on the blocking pool, handing the temp file back afterwards
async fn run_blocking<T, F>(temp_path: TempPath, work: F) -> Result<(TempPath, T)>
where
    T: Send + 'static,
    F: FnOnce(&Path) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = work(&*temp_path);
        (temp_path, result)
    })
    .await
    .map_err(|e| DownloadError::TaskPanicked { reason: e.to_string() })
}

fn gunzip_len(path: &Path) -> io::Result<u64> {
    let file = std::fs::File::open(path)?;
    let mut decoder = flate2::read::GzDecoder::new(BufReader::new(file));
    io::copy(&mut decoder, &mut io::sink())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_selection() {
        assert_eq!(CalibrationTier::select(1_500_000.0), Some(CalibrationTier::Mb10));
        assert_eq!(CalibrationTier::select(500_000.0), None);
        assert_eq!(CalibrationTier::select(700_000.0), None);
        assert_eq!(CalibrationTier::select(700_001.0), Some(CalibrationTier::Mb5));
        assert_eq!(CalibrationTier::select(2_500_000.0), Some(CalibrationTier::Mb20));
        assert_eq!(CalibrationTier::select(3_000_000.0), Some(CalibrationTier::Mb20));
        assert_eq!(CalibrationTier::select(3_000_001.0), Some(CalibrationTier::Mb50));
    }

    #[test]
    fn test_tier_file_names() {
        assert_eq!(CalibrationTier::Mb5.file_name(), "calibration-5MB.gz");
        assert_eq!(CalibrationTier::Mb50.to_string(), "50MB");
    }

    #[test]
    fn test_throughput_never_divides_by_zero() {
        assert!(throughput(1000, Duration::ZERO).is_finite());
        assert_eq!(throughput(2_000_000, Duration::from_secs(2)), 1_000_000.0);
    }
}
