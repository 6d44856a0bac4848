//! Inbound DATA transform: dot-unstuffing up to the end-of-data line.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use super::DataOptions;
use crate::error::{Error, Result};
use crate::line::with_timeout;

/// Outcome of feeding one chunk to a [`DotDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// Whole chunk consumed; the body continues.
    NeedMore,
    /// The `.` line ended the body after `consumed` bytes of the chunk.
    Done {
        /// Bytes of the chunk used, end marker included.
        consumed: usize,
    },
}

/// Streaming dot-unstuffer.
#[derive(Debug)]
pub struct DotDecoder {
    line: BytesMut,
    max_line_length: usize,
    done: bool,
}

impl DotDecoder {
    /// Creates a decoder allowing lines of up to `max_line_length` bytes.
    #[must_use]
    pub fn new(max_line_length: usize) -> Self {
        Self {
            line: BytesMut::with_capacity(max_line_length.min(8192)),
            max_line_length,
            done: false,
        }
    }

    /// Returns true once the end-of-data line has been seen.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        self.done
    }

    /// Decodes `chunk`, appending complete body lines to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Oversize`] if a line grows past the limit before
    /// its `CRLF`.
    pub fn decode(&mut self, chunk: &[u8], out: &mut BytesMut) -> Result<Decoded> {
        if self.done {
            return Ok(Decoded::Done { consumed: 0 });
        }

        for (i, &b) in chunk.iter().enumerate() {
            if self.line.len() >= self.max_line_length {
                return Err(Error::Oversize {
                    length: self.line.len() + 1,
                    limit: self.max_line_length,
                });
            }
            self.line.put_u8(b);

            if b != b'\n' || !self.line.ends_with(b"\r\n") {
                continue;
            }

            if &self.line[..] == b".\r\n" {
                self.done = true;
                self.line.clear();
                return Ok(Decoded::Done { consumed: i + 1 });
            }

            let skip = usize::from(self.line[0] == b'.');
            out.extend_from_slice(&self.line[skip..]);
            self.line.clear();
        }

        Ok(Decoded::NeedMore)
    }
}

/// Reads an SMTP DATA body from `source` up to and including the `.` line.
///
/// Only the bytes of the body are consumed; anything after the end marker
/// stays buffered in `source`.
///
/// # Errors
///
/// Returns [`Error::Oversize`], [`Error::PrematureEnd`], [`Error::Timeout`] or I/O errors.
pub async fn read_data<R>(source: &mut R, options: &DataOptions) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    with_timeout(options.timeout, read_data_inner(source, options.max_line_length)).await
}

async fn read_data_inner<R>(source: &mut R, max_line_length: usize) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut decoder = DotDecoder::new(max_line_length);
    let mut body = BytesMut::new();

    loop {
        let chunk = source.fill_buf().await?;
        if chunk.is_empty() {
            return Err(Error::PrematureEnd);
        }

        let len = chunk.len();
        match decoder.decode(chunk, &mut body)? {
            Decoded::NeedMore => source.consume(len),
            Decoded::Done { consumed } => {
                source.consume(consumed);
                tracing::debug!(bytes = body.len(), "message data received");
                return Ok(body.to_vec());
            }
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
    use crate::line::{LineOptions, read_line};
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    #[test]
    fn test_decode_terminates() {
        let mut decoder = DotDecoder::new(1000);
        let mut out = BytesMut::new();

        let result = decoder
            .decode(b"This is a test line.\r\n.\r\nNOOP\r\n", &mut out)
            .unwrap();
        assert_eq!(result, Decoded::Done { consumed: 25 });
        assert_eq!(&out[..], b"This is a test line.\r\n");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_decode_unstuffs_leading_dot() {
        let mut decoder = DotDecoder::new(1000);
        let mut out = BytesMut::new();

        decoder.decode(b"..\r\n..hidden\r\n.x\r\n", &mut out).unwrap();
        assert_eq!(&out[..], b".\r\n.hidden\r\nx\r\n");
    }

    #[test]
    fn test_decode_across_chunks() {
        let mut decoder = DotDecoder::new(1000);
        let mut out = BytesMut::new();

        assert_eq!(decoder.decode(b"a\r", &mut out).unwrap(), Decoded::NeedMore);
        assert_eq!(decoder.decode(b"\n.", &mut out).unwrap(), Decoded::NeedMore);
        assert_eq!(
            decoder.decode(b"\r\n", &mut out).unwrap(),
            Decoded::Done { consumed: 2 }
        );
        assert_eq!(&out[..], b"a\r\n");
    }

    #[test]
    fn test_decode_line_limit() {
        let mut decoder = DotDecoder::new(10);
        let mut out = BytesMut::new();

        assert!(decoder.decode(b"12345678\r\n", &mut out).is_ok());
        assert!(matches!(
            decoder.decode(b"123456789\r\n", &mut out),
            Err(Error::Oversize { length: 11, limit: 10 })
        ));
    }

    #[tokio::test]
    async fn test_read_data_leaves_rest_in_source() {
        let mock = Builder::new()
            .read(b"This is a test line.\r\n.\r\nQUIT\r\n")
            .build();
        let mut source = BufReader::new(mock);

        let body = read_data(&mut source, &DataOptions::default()).await.unwrap();
        assert_eq!(body, b"This is a test line.\r\n");

        let next = read_line(&mut source, &LineOptions::default()).await.unwrap();
        assert_eq!(next, "QUIT");
    }

    #[tokio::test]
    async fn test_read_data_premature_end() {
        let mock = Builder::new().read(b"unterminated body\r\n").build();
        let mut source = BufReader::new(mock);

        let result = read_data(&mut source, &DataOptions::default()).await;
        assert!(matches!(result, Err(Error::PrematureEnd)));
    }
}
