//! Strict CRLF line framing.
//!
//! SMTP lines end in exactly `CR LF`. A bare `CR` or a bare `LF` anywhere in
//! a line is a framing error, and no line may grow past a configured limit.
//! [`scan_line`] is the sans-I/O check; [`read_line`] applies it to an
//! [`AsyncBufRead`] source, treating each `fill_buf` result as one delivery.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};

/// Default maximum line length for commands and replies (RFC 5321 4.5.3.1).
pub const DEFAULT_MAX_LINE_LENGTH: usize = 512;

/// Default time allowed for a line or reply to arrive.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Limits applied while reading a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineOptions {
    /// Maximum line length in bytes, terminator included.
    pub max_line_length: usize,
    /// Time allowed for the whole read. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for LineOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl LineOptions {
    /// Sets the maximum line length.
    #[must_use]
    pub const fn max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Sets the timeout. A zero duration disables it.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Disables the timeout.
    #[must_use]
    pub const fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }
}

/// Looks for the first `CRLF` in `buf`.
///
/// Returns the index of its `CR`, or `None` if more bytes are needed.
pub fn scan_line(buf: &[u8], max_line_length: usize) -> Result<Option<usize>> {
    for (i, &b) in buf.iter().enumerate() {
        match b {
            b'\r' => match buf.get(i + 1) {
                Some(b'\n') => {
                    let length = i + 2;
                    if length > max_line_length {
                        return Err(Error::Oversize {
                            length,
                            limit: max_line_length,
                        });
                    }
                    return Ok(Some(i));
                }
                Some(_) => {
                    return Err(Error::Framing {
                        position: i,
                        reason: "CR not followed by LF",
                    });
                }
                None => break,
            },
            b'\n' => {
                return Err(Error::Framing {
                    position: i,
                    reason: "LF not preceded by CR",
                });
            }
            _ => {}
        }
    }

    // Count the terminator bytes that have not arrived yet.
    let pending = if buf.last() == Some(&b'\r') { 1 } else { 2 };
    let length = buf.len() + pending;
    if length > max_line_length {
        return Err(Error::Oversize {
            length,
            limit: max_line_length,
        });
    }
    Ok(None)
}

/// Accumulation buffer that never holds more than one line's worth of bytes.
#[derive(Debug)]
pub(crate) struct LineBuffer {
    buf: BytesMut,
    limit: usize,
}

impl LineBuffer {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(limit.min(8192)),
            limit,
        }
    }

    /// Copies as much of `chunk` as fits and returns how many bytes were taken.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> usize {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = chunk.len().min(room);
        self.buf.extend_from_slice(&chunk[..take]);
        take
    }

    /// Splits off the next complete line, without its terminator.
    pub(crate) fn next_line(&mut self) -> Result<Option<Bytes>> {
        match scan_line(&self.buf, self.limit)? {
            Some(end) => {
                let mut line = self.buf.split_to(end + 2);
                line.truncate(end);
                Ok(Some(line.freeze()))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Runs `fut` under an optional deadline; the timer is dropped with the future.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) if !limit.is_zero() => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| Error::Timeout(limit))?,
        _ => fut.await,
    }
}

/// Reads exactly one CRLF-terminated line.
///
/// The line must be the only thing in the delivery that completes it;
/// anything after the terminator is reported as [`Error::TrailingData`].
pub async fn read_line<R>(source: &mut R, options: &LineOptions) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    with_timeout(options.timeout, read_line_inner(source, options.max_line_length)).await
}

async fn read_line_inner<R>(source: &mut R, max_line_length: usize) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = LineBuffer::new(max_line_length);

    loop {
        let chunk = source.fill_buf().await?;
        if chunk.is_empty() {
            return Err(Error::PrematureEnd);
        }

        let len = chunk.len();
        let taken = buffer.push(chunk);
        source.consume(len);
        let leftover = len - taken;

        if let Some(line) = buffer.next_line()? {
            let extra = buffer.len() + leftover;
            if extra > 0 {
                return Err(Error::TrailingData(extra));
            }
            let line = std::str::from_utf8(&line)?.to_string();
            tracing::trace!(%line, "line received");
            return Ok(line);
        }

        if leftover > 0 {
            return Err(Error::Oversize {
                length: buffer.len() + leftover,
                limit: max_line_length,
            });
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio_test::io::Builder;

    #[test]
    fn test_scan_line() {
        assert_eq!(scan_line(b"EHLO x\r\n", 512).unwrap(), Some(6));
        assert_eq!(scan_line(b"\r\n", 512).unwrap(), Some(0));
        assert_eq!(scan_line(b"EHLO x", 512).unwrap(), None);
        assert_eq!(scan_line(b"EHLO x\r", 512).unwrap(), None);
    }

    #[test]
    fn test_scan_line_bare_breaks() {
        assert!(matches!(
            scan_line(b"EHLO\rx\r\n", 512),
            Err(Error::Framing { position: 4, .. })
        ));
        assert!(matches!(
            scan_line(b"EHLO\nx\r\n", 512),
            Err(Error::Framing { position: 4, .. })
        ));
    }

    #[test]
    fn test_scan_line_limits() {
        // 8 bytes of text plus CRLF is exactly 10.
        assert_eq!(scan_line(b"12345678\r\n", 10).unwrap(), Some(8));
        assert!(matches!(
            scan_line(b"123456789\r\n", 10),
            Err(Error::Oversize { length: 11, limit: 10 })
        ));
        // Cannot finish within the limit even before the terminator arrives.
        assert!(matches!(
            scan_line(b"123456789", 10),
            Err(Error::Oversize { .. })
        ));
        assert_eq!(scan_line(b"12345678\r", 10).unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_line_across_chunks() {
        let mock = Builder::new().read(b"220 mx.exa").read(b"mple.com\r").read(b"\n").build();
        let mut source = BufReader::new(mock);

        let line = read_line(&mut source, &LineOptions::default()).await.unwrap();
        assert_eq!(line, "220 mx.example.com");
    }

    #[tokio::test]
    async fn test_read_line_trailing_data() {
        let mock = Builder::new().read(b"250 OK\r\n250 again\r\n").build();
        let mut source = BufReader::new(mock);

        let result = read_line(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::TrailingData(11))));
    }

    #[tokio::test]
    async fn test_read_line_premature_end() {
        let mock = Builder::new().read(b"250 O").build();
        let mut source = BufReader::new(mock);

        let result = read_line(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::PrematureEnd)));
    }

    #[tokio::test]
    async fn test_read_line_oversize_single_chunk() {
        let long_line = format!("{}\r\n", "A".repeat(600));
        let mock = Builder::new().read(long_line.as_bytes()).build();
        let mut source = BufReader::new(mock);

        let result = read_line(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::Oversize { limit: 512, .. })));
    }

    #[tokio::test]
    async fn test_read_line_bare_lf() {
        let mock = Builder::new().read(b"250 OK\n").build();
        let mut source = BufReader::new(mock);

        let result = read_line(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::Framing { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_line_timeout() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"250 never fini").await.unwrap();

        let mut source = BufReader::new(client);
        let options = LineOptions::default().timeout(Duration::from_secs(5));
        let result = read_line(&mut source, &options).await;
        assert!(matches!(result, Err(Error::Timeout(d)) if d == Duration::from_secs(5)));
        drop(server);
    }

    #[test]
    fn test_zero_timeout_disables() {
        let options = LineOptions::default().timeout(Duration::ZERO);
        assert_eq!(options.timeout, None);
    }
}
