//! Configuration types for the downloader system

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::downloader::core::copy::DEFAULT_CHUNK_SIZE;
use crate::downloader::core::{DownloadError, Result};

/// Prefix of the environment variables read by [`DownloadConfig::from_env`]
pub const ENV_PREFIX: &str = "ARTIFACT_FETCH_";

/// Configuration for download operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Attempts per file, the first one included
    pub max_attempts: u32,
    /// Fixed pause between two attempts of the same file
    pub retry_delay: Duration,
    /// Size of the chunks the stream copier reads
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Longest silence tolerated while reading a body
    pub read_timeout: Duration,
    pub user_agent: String,
    /// Size of the worker pool built by [`crate::DownloadCoordinator::new`]
    pub max_concurrent_downloads: usize,
    /// Constant added to the progress denominator so the fraction stays below 1.0
    pub progress_offset: u64,
    /// Limit on the error response body quoted in `HttpStatus` errors
    pub max_error_body_bytes: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(250),
            chunk_size: DEFAULT_CHUNK_SIZE,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("artifact-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent_downloads: 8,
            progress_offset: 1000,
            max_error_body_bytes: 1024,
        }
    }
}

impl DownloadConfig {
    pub fn builder() -> DownloadConfigBuilder {
        DownloadConfigBuilder::new()
    }

    /// Load configuration from `.env` and `ARTIFACT_FETCH_*` variables
    ///
    /// Unset variables keep their default value.
    pub fn from_env() -> Result<Self> {
        // A missing .env file is fine.
        dotenv::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = parse_var(&lookup, "MAX_ATTEMPTS")? {
            config.max_attempts = value;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "RETRY_DELAY_MS")? {
            config.retry_delay = Duration::from_millis(millis);
        }
        if let Some(value) = parse_var(&lookup, "CHUNK_SIZE")? {
            config.chunk_size = value;
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "READ_TIMEOUT_SECS")? {
            config.read_timeout = Duration::from_secs(secs);
        }
        if let Some(value) = lookup(&format!("{}USER_AGENT", ENV_PREFIX)) {
            config.user_agent = value;
        }
        if let Some(value) = parse_var(&lookup, "MAX_CONCURRENT_DOWNLOADS")? {
            config.max_concurrent_downloads = value;
        }
        if let Some(value) = parse_var(&lookup, "PROGRESS_OFFSET")? {
            config.progress_offset = value;
        }
        if let Some(value) = parse_var(&lookup, "MAX_ERROR_BODY_BYTES")? {
            config.max_error_body_bytes = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "at least one attempt is required"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("chunk_size", "chunk size must be positive"));
        }
        if self.max_concurrent_downloads == 0 {
            return Err(invalid("max_concurrent_downloads", "at least one worker is required"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout", "timeout must be positive"));
        }
        if self.read_timeout.is_zero() {
            return Err(invalid("read_timeout", "timeout must be positive"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(invalid("user_agent", "user agent must not be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> DownloadError {
    DownloadError::Configuration {
        message: format!("{}: {}", field, message),
        field: Some(field.to_string()),
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let key = format!("{}{}", ENV_PREFIX, name);
    match lookup(&key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| DownloadError::Configuration {
            message: format!("{}='{}' is not valid: {}", key, raw, e),
            field: Some(key.clone()),
        }),
    }
}

/// Fluent builder for [`DownloadConfig`]
#[derive(Debug, Clone, Default)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for slow or flaky links: more attempts, longer pauses and timeouts
    pub fn reliable() -> Self {
        Self::new()
            .max_attempts(5)
            .retry_delay(Duration::from_secs(1))
            .read_timeout(Duration::from_secs(120))
            .max_concurrent_downloads(4)
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.read_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn max_concurrent_downloads(mut self, workers: usize) -> Self {
        self.config.max_concurrent_downloads = workers;
        self
    }

    pub fn progress_offset(mut self, offset: u64) -> Self {
        self.config.progress_offset = offset;
        self
    }

    pub fn max_error_body_bytes(mut self, limit: usize) -> Self {
        self.config.max_error_body_bytes = limit;
        self
    }

    pub fn build(self) -> Result<DownloadConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Where the connection speed prober finds its calibration files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Directory URL holding the calibration files
    pub base_url: String,
    /// Small file used for the first throughput estimate
    pub initial_file_name: String,
    /// Directory for the tier download, the system temp dir when unset
    pub scratch_dir: Option<PathBuf>,
}

impl ProbeConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            initial_file_name: "calibration-1MB.gz".to_string(),
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    /// Absolute URL of a calibration file below `base_url`
    pub fn file_url(&self, file_name: &str) -> Result<String> {
        let mut base = self.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = url::Url::parse(&base).map_err(|source| DownloadError::InvalidUrl {
            url: self.base_url.clone(),
            source,
        })?;
        base.join(file_name)
            .map(String::from)
            .map_err(|source| DownloadError::InvalidUrl {
                url: format!("{}{}", base, file_name),
                source,
            })
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
