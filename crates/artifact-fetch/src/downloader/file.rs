//! Retrying download of a single artifact
//!
//! One [`PerFileDownloader`] is shared by all tasks of a batch. Each call to
//! [`PerFileDownloader::download`] either reuses a file that is already on
//! disk with the right length, or fetches the artifact into a temp file
//! inside the target directory. Moving the temp file into place is left to
//! the coordinator.

use futures::TryStreamExt;
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_retry::strategy::FixedInterval;
use tokio_util::io::StreamReader;
use tracing::{Instrument, debug, info_span, warn};

use crate::downloader::batch::DownloadTelemetry;
use crate::downloader::config::DownloadConfig;
use crate::downloader::core::files::{create_temp_file, discard, existing_file_len};
use crate::downloader::core::http::{
    AcceptEncoding, HttpClient, content_encoding, content_length, is_cdn_hit, read_error_body,
};
use crate::downloader::core::{
    ArtifactDescriptor, BodyDecoder, CopyError, CountingReader, DownloadContext, DownloadError, FileOperation,
    HeaderProvider, ProgressEvent, Result, StreamCopier, TempArtifact,
};

/// How a single artifact download ended
#[derive(Debug)]
pub enum FileOutcome {
    /// Fetched and verified, waiting in a temp file
    Downloaded(TempArtifact),
    /// The existing file already has the remote length
    AlreadyPresent { path: PathBuf, size: u64 },
    Failed(DownloadError),
    Cancelled,
}

impl FileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FileOutcome::Downloaded(_) | FileOutcome::AlreadyPresent { .. })
    }
}

/// Result of one GET attempt
enum Attempt {
    Completed(TempArtifact),
    Retryable(DownloadError),
    Fatal(DownloadError),
    Cancelled,
}

impl Attempt {
    fn from_error(error: DownloadError) -> Self {
        if error.is_recoverable() {
            Attempt::Retryable(error)
        } else {
            Attempt::Fatal(error)
        }
    }
}

pub struct PerFileDownloader {
    http: HttpClient,
    copier: StreamCopier,
    config: DownloadConfig,
    header_provider: Option<Arc<dyn HeaderProvider>>,
}

impl std::fmt::Debug for PerFileDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerFileDownloader")
            .field("config", &self.config)
            .field("has_header_provider", &self.header_provider.is_some())
            .finish()
    }
}

impl PerFileDownloader {
    pub fn new(config: DownloadConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            http: HttpClient::from_config(&config)?,
            copier: StreamCopier::new(config.chunk_size),
            config,
            header_provider: None,
        })
    }

    /// Attach extra request headers, asked for before every request
    pub fn with_header_provider(mut self, provider: Arc<dyn HeaderProvider>) -> Self {
        self.header_provider = Some(provider);
        self
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// Download one artifact with bounded retry
    ///
    /// `existing_file` is a previous copy of the artifact; it is reused when
    /// the server reports the same length for it. Downloads land in a temp
    /// file created in `temp_dir`.
    pub async fn download(
        &self,
        descriptor: &ArtifactDescriptor,
        existing_file: Option<&Path>,
        temp_dir: &Path,
        context: &DownloadContext,
        telemetry: &DownloadTelemetry,
    ) -> FileOutcome {
        let span = info_span!("artifact_download", url = %descriptor.download_url());
        self.download_reporting(descriptor, existing_file, temp_dir, context, telemetry)
            .instrument(span)
            .await
    }

    async fn download_reporting(
        &self,
        descriptor: &ArtifactDescriptor,
        existing_file: Option<&Path>,
        temp_dir: &Path,
        context: &DownloadContext,
        telemetry: &DownloadTelemetry,
    ) -> FileOutcome {
        if context.is_cancelled() {
            return FileOutcome::Cancelled;
        }

        telemetry.metrics.record_started();
        telemetry
            .progress
            .status(format!("Downloading {}", descriptor.presentable_name()));
        telemetry.progress.tick();

        let outcome = self
            .download_with_retry(descriptor, existing_file, temp_dir, context, telemetry)
            .await;

        match &outcome {
            FileOutcome::Downloaded(artifact) => {
                telemetry.metrics.record_downloaded(artifact.wire_bytes, artifact.cdn_hit);
                telemetry.progress.emit(ProgressEvent::ArtifactComplete {
                    name: descriptor.presentable_name().to_string(),
                    bytes: artifact.written_bytes,
                    already_present: false,
                });
                telemetry.progress.tick();
            }
            FileOutcome::AlreadyPresent { size, .. } => {
                telemetry.metrics.record_already_present();
                telemetry.progress.emit(ProgressEvent::ArtifactComplete {
                    name: descriptor.presentable_name().to_string(),
                    bytes: *size,
                    already_present: true,
                });
                telemetry.progress.tick();
            }
            FileOutcome::Failed(error) => {
                telemetry.metrics.record_failed();
                telemetry.progress.emit(ProgressEvent::Error {
                    url: descriptor.download_url().to_string(),
                    error: error.to_string(),
                });
            }
            FileOutcome::Cancelled => {
                debug!("Download of {} cancelled", descriptor.download_url());
            }
        }

        outcome
    }

    async fn download_with_retry(
        &self,
        descriptor: &ArtifactDescriptor,
        existing_file: Option<&Path>,
        temp_dir: &Path,
        context: &DownloadContext,
        telemetry: &DownloadTelemetry,
    ) -> FileOutcome {
        let url = descriptor.download_url();

        if let Some(existing) = existing_file {
            if let Some(size) = self.check_existing(url, existing, context).await {
                debug!("{} is up to date ({} bytes)", existing.display(), size);
                return FileOutcome::AlreadyPresent {
                    path: existing.to_path_buf(),
                    size,
                };
            }
        }

        let max_attempts = self.config.max_attempts;
        let mut delays = FixedInterval::new(self.config.retry_delay).take(max_attempts.saturating_sub(1) as usize);
        let mut attempt: u32 = 1;

        loop {
            if context.is_cancelled() {
                return FileOutcome::Cancelled;
            }

            debug!("Attempt {}/{} for {}", attempt, max_attempts, url);
            let error = match self.attempt(url, temp_dir, context, AcceptEncoding::Gzip).await {
                Attempt::Completed(artifact) => return FileOutcome::Downloaded(artifact),
                Attempt::Cancelled => return FileOutcome::Cancelled,
                Attempt::Fatal(error) => return FileOutcome::Failed(error),
                Attempt::Retryable(error) => error,
            };

            let Some(delay) = delays.next() else {
                return FileOutcome::Failed(DownloadError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    source: Box::new(error),
                });
            };

            warn!("Attempt {}/{} for {} failed: {}", attempt, max_attempts, url, error);
            attempt += 1;
            telemetry.metrics.record_retry();
            telemetry.progress.emit(ProgressEvent::RetryAttempt {
                url: url.to_string(),
                attempt,
                max_attempts,
            });

            tokio::select! {
                _ = context.cancellation_token().cancelled() => return FileOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Single unretried download of `url` into a temp file in `temp_dir`
    ///
    /// With [`AcceptEncoding::Identity`] the temp file holds the raw wire
    /// bytes even if the server labels them `Content-Encoding: gzip`.
    pub async fn fetch_once(
        &self,
        url: &str,
        temp_dir: &Path,
        context: &DownloadContext,
        accept: AcceptEncoding,
    ) -> Result<TempArtifact> {
        match self.attempt(url, temp_dir, context, accept).await {
            Attempt::Completed(artifact) => Ok(artifact),
            Attempt::Retryable(error) | Attempt::Fatal(error) => Err(error),
            Attempt::Cancelled => Err(DownloadError::Cancelled {
                url: Some(url.to_string()),
            }),
        }
    }

    /// Length of `existing` if the server reports the same length for `url`
    ///
    /// Cancellation abandons the HEAD and reports no match.
    async fn check_existing(&self, url: &str, existing: &Path, context: &DownloadContext) -> Option<u64> {
        let local = match existing_file_len(existing).await {
            Ok(Some(len)) => len,
            Ok(None) => return None,
            Err(e) => {
                debug!("Cannot inspect {}: {}", existing.display(), e);
                return None;
            }
        };

        let headers = match self.request_headers().await {
            Ok(headers) => headers,
            Err(e) => {
                debug!("Skipping HEAD for {}: {}", url, e);
                return None;
            }
        };

        let remote = tokio::select! {
            _ = context.cancellation_token().cancelled() => return None,
            remote = self.http.head_content_length(url, headers) => remote,
        };

        match remote {
            Some(remote) if remote == local => Some(local),
            Some(remote) => {
                debug!("Local copy has {} bytes, server reports {}", local, remote);
                None
            }
            None => None,
        }
    }

    async fn request_headers(&self) -> Result<HeaderMap> {
        match &self.header_provider {
            Some(provider) => provider.headers().await,
            None => Ok(HeaderMap::new()),
        }
    }

    async fn attempt(&self, url: &str, temp_dir: &Path, context: &DownloadContext, accept: AcceptEncoding) -> Attempt {
        let headers = match self.request_headers().await {
            Ok(headers) => headers,
            Err(error) => return Attempt::Fatal(error),
        };

        // Nothing is on disk yet, so waiting for the response can be abandoned.
        let response = tokio::select! {
            _ = context.cancellation_token().cancelled() => return Attempt::Cancelled,
            response = self.http.get(url, headers, accept) => match response {
                Ok(response) => response,
                Err(error) => return Attempt::from_error(error),
            },
        };

        let status = response.status();
        if status != StatusCode::OK {
            let body = read_error_body(response, self.config.max_error_body_bytes).await;
            return Attempt::from_error(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        let Some(expected) = content_length(response.headers()) else {
            return Attempt::Fatal(DownloadError::MissingContentLength { url: url.to_string() });
        };
        let cdn_hit = is_cdn_hit(response.headers());
        let encoding = match accept {
            AcceptEncoding::Gzip => content_encoding(response.headers()),
            AcceptEncoding::Identity => None,
        };
        let mut decoder = match BodyDecoder::for_content_encoding(encoding) {
            Ok(decoder) => decoder,
            Err(source) => {
                return Attempt::Fatal(DownloadError::Decode {
                    url: url.to_string(),
                    source,
                });
            }
        };

        let temp = match create_temp_file(temp_dir) {
            Ok(temp) => temp,
            Err(error) => return Attempt::Fatal(error),
        };
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        let mut reader = CountingReader::new(StreamReader::new(stream));

        let copied = self
            .copier
            .copy(&mut reader, &mut decoder, &mut file, context.cancellation_token(), expected)
            .await;

        let report = match copied {
            Ok(report) => report,
            Err(error) => {
                let path = temp_path.to_path_buf();
                drop(file);
                discard(temp_path);
                return self.copy_failure(url, path, error);
            }
        };

        if let Err(source) = file.sync_all().await {
            let path = temp_path.to_path_buf();
            drop(file);
            discard(temp_path);
            return Attempt::Fatal(DownloadError::FileSystem {
                path,
                operation: FileOperation::Write,
                source,
            });
        }
        drop(file);

        debug!(
            "Fetched {} ({} wire bytes, {} on disk, cdn hit: {})",
            url, report.wire_bytes, report.written_bytes, cdn_hit
        );
        Attempt::Completed(TempArtifact {
            temp_path,
            wire_bytes: report.wire_bytes,
            written_bytes: report.written_bytes,
            cdn_hit,
        })
    }

    fn copy_failure(&self, url: &str, temp_path: PathBuf, error: CopyError) -> Attempt {
        match error {
            CopyError::Cancelled => Attempt::Cancelled,
            CopyError::Truncated { expected, received } => Attempt::Retryable(DownloadError::TruncatedTransfer {
                url: url.to_string(),
                expected,
                received,
            }),
            CopyError::Read(source) => match source.into_inner().map(|inner| inner.downcast::<reqwest::Error>()) {
                Some(Ok(source)) => Attempt::from_error(DownloadError::Transport {
                    url: url.to_string(),
                    source: *source,
                }),
                Some(Err(inner)) => Attempt::Fatal(DownloadError::Decode {
                    url: url.to_string(),
                    source: io::Error::other(inner),
                }),
                None => Attempt::Fatal(DownloadError::Decode {
                    url: url.to_string(),
                    source: io::Error::other("body read failed"),
                }),
            },
            CopyError::Decode(source) => Attempt::Fatal(DownloadError::Decode {
                url: url.to_string(),
                source,
            }),
            CopyError::Write(source) => Attempt::Fatal(DownloadError::FileSystem {
                path: temp_path,
                operation: FileOperation::Write,
                source,
            }),
        }
    }
}
