//! Error types for the artifact downloader with context and recovery information

use std::error::Error;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while fetching artifacts
///
/// Variants carry the URL or path they relate to so that a single error
/// surfaced from a batch is enough to diagnose which artifact broke and why.
#[derive(Error, Debug)]
pub enum DownloadError {
    /// Cooperative cancellation was observed
    #[error("Download cancelled{}", cancelled_suffix(.url))]
    Cancelled { url: Option<String> },

    /// Connection, TLS, timeout or body-level failure reported by the HTTP client
    #[error("HTTP transfer from '{url}' failed")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Server answered with something other than `200 OK`
    #[error("Server returned status {status} for '{url}': {body}")]
    HttpStatus {
        url: String,
        status: u16,
        body: String,
    },

    /// The body ended before `Content-Length` bytes were consumed
    #[error("Transfer from '{url}' was truncated: expected {expected} bytes, received {received} bytes")]
    TruncatedTransfer {
        url: String,
        expected: u64,
        received: u64,
    },

    /// A 200 response without a declared length cannot be verified
    #[error("Response for '{url}' has no Content-Length, completeness cannot be verified")]
    MissingContentLength { url: String },

    /// The response body could not be decoded (bad gzip stream, unknown encoding)
    #[error("Failed to decode body of '{url}'")]
    Decode {
        url: String,
        #[source]
        source: std::io::Error,
    },

    /// File system I/O errors with file context
    #[error("File operation failed on '{path}' while {operation}")]
    FileSystem {
        path: PathBuf,
        operation: FileOperation,
        #[source]
        source: std::io::Error,
    },

    /// Descriptor URL could not be parsed
    #[error("Invalid URL '{url}'")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// Descriptor failed validation
    #[error("Invalid artifact descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    /// The header provider could not produce request headers
    #[error("Failed to obtain request headers: {reason}")]
    Header { reason: String },

    /// Retryable failures kept happening until the attempt bound was reached
    #[error("Giving up on '{url}' after {attempts} attempts")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<DownloadError>,
    },

    /// At least one artifact of a batch failed terminally
    #[error("Batch download failed ({failed} of {total} artifacts failed)")]
    BatchFailed {
        failed: usize,
        total: usize,
        #[source]
        source: Box<DownloadError>,
    },

    /// A download task panicked or was aborted by the runtime
    #[error("Download task failed: {reason}")]
    TaskPanicked { reason: String },

    /// Configuration errors
    #[error("Invalid configuration: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },
}

/// Types of file operations for error context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOperation {
    Read,
    Write,
    Create,
    Delete,
    Move,
    Metadata,
    CreateDir,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileOperation::Read => write!(f, "reading"),
            FileOperation::Write => write!(f, "writing"),
            FileOperation::Create => write!(f, "creating"),
            FileOperation::Delete => write!(f, "deleting"),
            FileOperation::Move => write!(f, "moving"),
            FileOperation::Metadata => write!(f, "reading metadata"),
            FileOperation::CreateDir => write!(f, "creating directory"),
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

fn cancelled_suffix(url: &Option<String>) -> String {
    match url {
        Some(url) => format!(" while fetching '{url}'"),
        None => String::new(),
    }
}

impl DownloadError {
    /// Check if error is recoverable (worth another attempt)
    ///
    /// Only transport-level problems qualify. Client errors (4xx) and
    /// anything describing local state are terminal.
    pub fn is_recoverable(&self) -> bool {
        match self {
            DownloadError::Transport { source, .. } => !source.is_builder(),
            DownloadError::TruncatedTransfer { .. } => true,
            DownloadError::HttpStatus { status, .. } => (500..=599).contains(status),
            DownloadError::Cancelled { .. } => false,
            DownloadError::MissingContentLength { .. } => false,
            DownloadError::Decode { .. } => false,
            DownloadError::FileSystem { .. } => false,
            DownloadError::InvalidUrl { .. } => false,
            DownloadError::InvalidDescriptor { .. } => false,
            DownloadError::Header { .. } => false,
            DownloadError::RetriesExhausted { .. } => false,
            DownloadError::BatchFailed { .. } => false,
            DownloadError::TaskPanicked { .. } => false,
            DownloadError::Configuration { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DownloadError::Cancelled { .. })
    }

    /// Get error category for metrics and logging
    pub fn category(&self) -> &'static str {
        match self {
            DownloadError::Cancelled { .. } => "cancelled",
            DownloadError::Transport { .. } => "transport",
            DownloadError::HttpStatus { .. } => "http_status",
            DownloadError::TruncatedTransfer { .. } => "truncated_transfer",
            DownloadError::MissingContentLength { .. } => "missing_content_length",
            DownloadError::Decode { .. } => "decode",
            DownloadError::FileSystem { .. } => "file_system",
            DownloadError::InvalidUrl { .. } => "invalid_url",
            DownloadError::InvalidDescriptor { .. } => "invalid_descriptor",
            DownloadError::Header { .. } => "header",
            DownloadError::RetriesExhausted { .. } => "retries_exhausted",
            DownloadError::BatchFailed { .. } => "batch_failed",
            DownloadError::TaskPanicked { .. } => "task_panicked",
            DownloadError::Configuration { .. } => "configuration",
        }
    }

    /// Get severity level for error prioritization
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DownloadError::Cancelled { .. } => ErrorSeverity::Low,
            DownloadError::Transport { .. } => ErrorSeverity::Medium,
            DownloadError::HttpStatus { .. } => ErrorSeverity::Medium,
            DownloadError::TruncatedTransfer { .. } => ErrorSeverity::Medium,
            DownloadError::MissingContentLength { .. } => ErrorSeverity::High,
            DownloadError::Decode { .. } => ErrorSeverity::High,
            DownloadError::FileSystem { .. } => ErrorSeverity::High,
            DownloadError::InvalidUrl { .. } => ErrorSeverity::High,
            DownloadError::InvalidDescriptor { .. } => ErrorSeverity::High,
            DownloadError::Header { .. } => ErrorSeverity::High,
            DownloadError::RetriesExhausted { .. } => ErrorSeverity::High,
            DownloadError::BatchFailed { .. } => ErrorSeverity::High,
            DownloadError::TaskPanicked { .. } => ErrorSeverity::Critical,
            DownloadError::Configuration { .. } => ErrorSeverity::High,
        }
    }

    /// Walk through batch and retry wrappers down to the error that started it
    pub fn root_cause(&self) -> &DownloadError {
        match self {
            DownloadError::RetriesExhausted { source, .. } | DownloadError::BatchFailed { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Create a detailed error report for debugging
    pub fn detailed_report(&self) -> String {
        let mut report = format!("Error: {}\n", self);
        report.push_str(&format!("Category: {}\n", self.category()));
        report.push_str(&format!("Severity: {:?}\n", self.severity()));
        report.push_str(&format!("Recoverable: {}\n", self.is_recoverable()));

        let mut source = self.source();
        while let Some(cause) = source {
            report.push_str(&format!("Caused by: {}\n", cause));
            source = cause.source();
        }

        report
    }
}

/// Error severity levels for prioritization
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> DownloadError {
        DownloadError::HttpStatus {
            url: "http://example.com/a.bin".to_string(),
            status: code,
            body: String::new(),
        }
    }

    #[test]
    fn test_only_server_errors_are_recoverable_statuses() {
        assert!(status(500).is_recoverable());
        assert!(status(503).is_recoverable());
        assert!(!status(404).is_recoverable());
        assert!(!status(403).is_recoverable());
        assert!(!status(304).is_recoverable());
    }

    #[test]
    fn test_truncation_is_recoverable_and_cancellation_is_not() {
        let truncated = DownloadError::TruncatedTransfer {
            url: "http://example.com/a.bin".to_string(),
            expected: 1000,
            received: 900,
        };
        assert!(truncated.is_recoverable());
        assert_eq!(truncated.category(), "truncated_transfer");

        let cancelled = DownloadError::Cancelled { url: None };
        assert!(!cancelled.is_recoverable());
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.severity(), ErrorSeverity::Low);
    }

    #[test]
    fn test_root_cause_unwraps_batch_and_retry_layers() {
        let error = DownloadError::BatchFailed {
            failed: 1,
            total: 5,
            source: Box::new(DownloadError::RetriesExhausted {
                url: "http://example.com/a.bin".to_string(),
                attempts: 3,
                source: Box::new(status(502)),
            }),
        };

        assert!(matches!(error.root_cause(), DownloadError::HttpStatus { status: 502, .. }));
        let report = error.detailed_report();
        assert!(report.contains("Category: batch_failed"));
        assert!(report.contains("after 3 attempts"));
        assert!(report.contains("status 502"));
    }

    #[test]
    fn test_cancelled_message_mentions_url() {
        let error = DownloadError::Cancelled {
            url: Some("http://example.com/a.bin".to_string()),
        };
        assert_eq!(error.to_string(), "Download cancelled while fetching 'http://example.com/a.bin'");
        assert_eq!(DownloadError::Cancelled { url: None }.to_string(), "Download cancelled");
    }

    #[test]
    fn test_error_severity_ordering() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }
}
