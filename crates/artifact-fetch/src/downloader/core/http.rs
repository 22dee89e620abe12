//! HTTP utilities
//!
//! Thin wrapper around a configured `reqwest::Client`. Automatic decompression
//! stays off: the stream copier needs the raw wire bytes to compare them with
//! `Content-Length`, and decodes gzip itself.

use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_LENGTH, HeaderMap, HeaderValue};
use reqwest::{Client, Response};
use tracing::debug;

use crate::downloader::config::DownloadConfig;
use crate::downloader::core::{DownloadError, Result};

/// Response header set by CDN edges; a value containing `HIT` marks a cached answer
pub const X_CACHE: &str = "x-cache";

/// Body encodings a GET is willing to receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptEncoding {
    /// The server may gzip the body; it is decoded before it reaches disk
    Gzip,
    /// The body is stored exactly as sent, whatever `Content-Encoding` says
    Identity,
}

impl AcceptEncoding {
    pub fn header_value(self) -> HeaderValue {
        match self {
            AcceptEncoding::Gzip => HeaderValue::from_static("gzip"),
            AcceptEncoding::Identity => HeaderValue::from_static("identity"),
        }
    }
}

pub struct HttpClient {
    client: Client,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient").finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Create a new HTTP client from download configuration
    pub fn from_config(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .no_gzip()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| DownloadError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
                field: None,
            })?;

        Ok(Self { client })
    }

    /// Declared length of the remote file, `None` when it cannot be learned
    ///
    /// Asks for the identity encoding so the answer matches the bytes a
    /// previous download left on disk.
    pub async fn head_content_length(&self, url: &str, mut headers: HeaderMap) -> Option<u64> {
        headers.insert(ACCEPT_ENCODING, AcceptEncoding::Identity.header_value());

        let response = match self.client.head(url).headers(headers).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("HEAD {} failed: {}", url, e);
                return None;
            }
        };

        if !response.status().is_success() {
            debug!("HEAD {} returned {}", url, response.status());
            return None;
        }

        content_length(response.headers())
    }

    /// Send a GET advertising `accept` as the acceptable body encoding
    pub async fn get(&self, url: &str, mut headers: HeaderMap, accept: AcceptEncoding) -> Result<Response> {
        headers.insert(ACCEPT_ENCODING, accept.header_value());

        self.client
            .get(url)
            .headers(headers)
            .send()
            .await
            .map_err(|source| DownloadError::Transport {
                url: url.to_string(),
                source,
            })
    }
}

/// `Content-Length` as sent by the server
///
/// Read from the header itself: `Response::content_length` reports the body
/// size hint, which is zero for HEAD responses.
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

pub fn content_encoding(headers: &HeaderMap) -> Option<&str> {
    headers.get(CONTENT_ENCODING)?.to_str().ok()
}

pub fn is_cdn_hit(headers: &HeaderMap) -> bool {
    headers
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_uppercase().contains("HIT"))
}

/// Read at most `limit` bytes of an error response for diagnostics
pub async fn read_error_body(mut response: Response, limit: usize) -> String {
    let mut body = Vec::new();
    while body.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => body.extend_from_slice(&chunk),
            Ok(None) => break,
            Err(e) => {
                debug!("Could not read error body: {}", e);
                break;
            }
        }
    }
    body.truncate(limit);
    String::from_utf8_lossy(&body).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_length_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("1000"));
        assert_eq!(content_length(&headers), Some(1000));

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("lots"));
        assert_eq!(content_length(&headers), None);
    }

    #[test]
    fn test_cdn_hit_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_cdn_hit(&headers));

        headers.insert(X_CACHE, HeaderValue::from_static("Hit from cloudfront"));
        assert!(is_cdn_hit(&headers));

        headers.insert(X_CACHE, HeaderValue::from_static("Miss from cloudfront"));
        assert!(!is_cdn_hit(&headers));
    }
}
