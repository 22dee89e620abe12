//! Length-verified stream copying
//!
//! The declared `Content-Length` of a response describes the bytes on the
//! wire, which for a gzip-encoded body is the compressed size. The copier
//! therefore counts what it reads from the wire through [`CountingReader`]
//! and decodes separately with [`BodyDecoder`], so that an early EOF is
//! detected no matter how much the decompressed output has grown.

use flate2::write::GzDecoder;
use std::borrow::Cow;
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Reader wrapper that counts the bytes pulled from the inner reader
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    consumed: u64,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, consumed: 0 }
    }

    /// Bytes consumed from the wire so far
    pub fn bytes_consumed(&self) -> u64 {
        self.consumed
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            self.consumed += (buf.filled().len() - before) as u64;
        }
        poll
    }
}

/// Decoder applied to wire bytes before they reach the output
pub enum BodyDecoder {
    Identity,
    Gzip(Box<GzDecoder<Vec<u8>>>),
}

impl std::fmt::Debug for BodyDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodyDecoder::Identity => write!(f, "BodyDecoder::Identity"),
            BodyDecoder::Gzip(_) => write!(f, "BodyDecoder::Gzip"),
        }
    }
}

impl BodyDecoder {
    /// Decoder inflating a gzip member as chunks arrive
    pub fn gzip() -> Self {
        BodyDecoder::Gzip(Box::new(GzDecoder::new(Vec::new())))
    }

    /// Pick a decoder for a `Content-Encoding` header value
    pub fn for_content_encoding(encoding: Option<&str>) -> io::Result<Self> {
        match encoding.map(|value| value.trim().to_ascii_lowercase()) {
            None => Ok(BodyDecoder::Identity),
            Some(value) if value.is_empty() || value == "identity" => Ok(BodyDecoder::Identity),
            Some(value) if value == "gzip" || value == "x-gzip" => Ok(Self::gzip()),
            Some(value) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported content encoding '{value}'"),
            )),
        }
    }

    /// Whether wire bytes are written unchanged
    pub fn is_identity(&self) -> bool {
        matches!(self, BodyDecoder::Identity)
    }

    fn decode<'a>(&mut self, chunk: &'a [u8]) -> io::Result<Cow<'a, [u8]>> {
        match self {
            BodyDecoder::Identity => Ok(Cow::Borrowed(chunk)),
            BodyDecoder::Gzip(decoder) => {
                // Output may lag behind the input; `finish` drains the rest.
                decoder.write_all(chunk)?;
                Ok(Cow::Owned(std::mem::take(decoder.get_mut())))
            }
        }
    }

    fn finish(&mut self) -> io::Result<Vec<u8>> {
        match self {
            BodyDecoder::Identity => Ok(Vec::new()),
            BodyDecoder::Gzip(decoder) => {
                decoder.try_finish()?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}

/// Failure of a single copy; callers attach URL and path context
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },

    #[error("copy cancelled")]
    Cancelled,

    #[error("reading from the wire failed")]
    Read(#[source] io::Error),

    #[error("decoding the body failed")]
    Decode(#[source] io::Error),

    #[error("writing the output failed")]
    Write(#[source] io::Error),
}

/// Byte counts of a finished copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    /// Bytes consumed from the wire (compressed size for gzip bodies)
    pub wire_bytes: u64,
    /// Bytes written to the output after decoding
    pub written_bytes: u64,
}

/// Chunked copy loop with a length check on the wire side
#[derive(Debug, Clone, Copy)]
pub struct StreamCopier {
    chunk_size: usize,
}

impl Default for StreamCopier {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl StreamCopier {
    /// Copier reading `chunk_size` bytes at a time, at least one
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Copy `input` into `output` until EOF, verifying the wire length
    ///
    /// Cancellation is polled after every chunk, never in the middle of a
    /// write. The output is flushed on success; on failure the caller owns
    /// whatever was partially written.
    pub async fn copy<R, W>(
        &self,
        input: &mut CountingReader<R>,
        decoder: &mut BodyDecoder,
        output: &mut W,
        cancellation: &CancellationToken,
        expected_length: u64,
    ) -> Result<CopyReport, CopyError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buffer = vec![0u8; self.chunk_size];
        let mut written: u64 = 0;

        loop {
            let read = match input.read(&mut buffer).await {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) => {
                    let received = input.bytes_consumed();
                    if received < expected_length {
                        // An early close surfaces as a body error from the client.
                        debug!("Read failed after {} of {} bytes: {}", received, expected_length, error);
                        return Err(CopyError::Truncated { expected: expected_length, received });
                    }
                    return Err(CopyError::Read(error));
                }
            };

            let decoded = decoder.decode(&buffer[..read]).map_err(CopyError::Decode)?;
            output.write_all(&decoded).await.map_err(CopyError::Write)?;
            written += decoded.len() as u64;

            if cancellation.is_cancelled() {
                return Err(CopyError::Cancelled);
            }
        }

        let received = input.bytes_consumed();
        if received < expected_length {
            return Err(CopyError::Truncated { expected: expected_length, received });
        }

        let tail = decoder.finish().map_err(CopyError::Decode)?;
        output.write_all(&tail).await.map_err(CopyError::Write)?;
        written += tail.len() as u64;
        output.flush().await.map_err(CopyError::Write)?;

        debug!("Copied {} wire bytes into {} output bytes", received, written);
        Ok(CopyReport {
            wire_bytes: received,
            written_bytes: written,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Reader that yields its data and then fails like a reset connection
    struct FailingReader {
        data: Vec<u8>,
        served: bool,
    }

    impl AsyncRead for FailingReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.served {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
            }
            self.served = true;
            let data = std::mem::take(&mut self.data);
            buf.put_slice(&data);
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_copy_identity_body() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut input = CountingReader::new(&data[..]);
        let mut output = Vec::new();

        let report = StreamCopier::new(4096)
            .copy(&mut input, &mut BodyDecoder::Identity, &mut output, &CancellationToken::new(), data.len() as u64)
            .await
            .unwrap();

        assert_eq!(report.wire_bytes, data.len() as u64);
        assert_eq!(report.written_bytes, data.len() as u64);
        assert_eq!(output, data);
    }

    #[tokio::test]
    async fn test_early_eof_is_truncation() {
        let data = vec![7u8; 900];
        let mut input = CountingReader::new(&data[..]);
        let mut output = Vec::new();

        let result = StreamCopier::default()
            .copy(&mut input, &mut BodyDecoder::Identity, &mut output, &CancellationToken::new(), 1000)
            .await;

        assert!(matches!(result, Err(CopyError::Truncated { expected: 1000, received: 900 })));
    }

    #[tokio::test]
    async fn test_read_error_before_declared_length_is_truncation() {
        let mut input = CountingReader::new(FailingReader { data: vec![1u8; 512], served: false });
        let mut output = Vec::new();

        let result = StreamCopier::default()
            .copy(&mut input, &mut BodyDecoder::Identity, &mut output, &CancellationToken::new(), 1024)
            .await;

        assert!(matches!(result, Err(CopyError::Truncated { expected: 1024, received: 512 })));
    }

    #[tokio::test]
    async fn test_gzip_body_is_measured_on_the_wire() {
        let plain = b"compiled module output ".repeat(4096);
        let compressed = gzip(&plain);
        assert!(compressed.len() < plain.len());

        let mut input = CountingReader::new(&compressed[..]);
        let mut output = Vec::new();

        let report = StreamCopier::new(1024)
            .copy(&mut input, &mut BodyDecoder::gzip(), &mut output, &CancellationToken::new(), compressed.len() as u64)
            .await
            .unwrap();

        assert_eq!(report.wire_bytes, compressed.len() as u64);
        assert_eq!(report.written_bytes, plain.len() as u64);
        assert_eq!(output, plain);
    }

    #[tokio::test]
    async fn test_truncated_gzip_body_is_detected() {
        let compressed = gzip(&b"metadata blob".repeat(1000));
        let cut = compressed.len() * 9 / 10;
        let mut input = CountingReader::new(&compressed[..cut]);
        let mut output = Vec::new();

        let result = StreamCopier::new(256)
            .copy(&mut input, &mut BodyDecoder::gzip(), &mut output, &CancellationToken::new(), compressed.len() as u64)
            .await;

        assert!(matches!(result, Err(CopyError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_cancellation_is_observed_after_a_chunk() {
        let data = vec![0u8; 10_000];
        let mut input = CountingReader::new(&data[..]);
        let mut output = Vec::new();
        let token = CancellationToken::new();
        token.cancel();

        let result = StreamCopier::new(1000)
            .copy(&mut input, &mut BodyDecoder::Identity, &mut output, &token, data.len() as u64)
            .await;

        assert!(matches!(result, Err(CopyError::Cancelled)));
        // The chunk in flight is written completely before the check.
        assert_eq!(output.len(), 1000);
    }

    #[test]
    fn test_decoder_selection() {
        assert!(BodyDecoder::for_content_encoding(None).unwrap().is_identity());
        assert!(BodyDecoder::for_content_encoding(Some("identity")).unwrap().is_identity());
        assert!(!BodyDecoder::for_content_encoding(Some("GZIP")).unwrap().is_identity());
        assert!(BodyDecoder::for_content_encoding(Some("br")).is_err());
    }
}
