//! Outbound DATA transform: dot-stuffing and CRLF normalization.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::DataOptions;
use crate::error::{Error, Result};
use crate::line::with_timeout;

/// Streaming dot-stuffer.
///
/// Feed the message body in arbitrary chunks with [`encode`](Self::encode),
/// then call [`finish`](Self::finish) once to close the last line and append
/// the `.` end-of-data line.
#[derive(Debug, Default)]
pub struct DotEncoder {
    /// Last byte written, `None` at start of stream.
    last: Option<u8>,
}

impl DotEncoder {
    /// Creates an encoder positioned at the start of a line.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes one chunk into `out`.
    pub fn encode(&mut self, chunk: &[u8], out: &mut BytesMut) {
        out.reserve(chunk.len() + chunk.len() / 16 + 2);

        for &b in chunk {
            if self.last == Some(b'\r') && b != b'\n' {
                out.put_u8(b'\n');
                self.last = Some(b'\n');
            }
            if b == b'\n' && self.last != Some(b'\r') {
                out.put_u8(b'\r');
                self.last = Some(b'\r');
            }
            if b == b'.' && matches!(self.last, None | Some(b'\n')) {
                out.put_u8(b'.');
            }
            out.put_u8(b);
            self.last = Some(b);
        }
    }

    /// Terminates the body: completes a dangling line, then writes `.\r\n`.
    pub fn finish(self, out: &mut BytesMut) {
        match self.last {
            Some(b'\r') => out.put_u8(b'\n'),
            Some(b'\n') | None => {}
            Some(_) => out.put_slice(b"\r\n"),
        }
        out.put_slice(b".\r\n");
    }
}

/// Streams `source` to `sink` as an SMTP DATA body, end marker included.
///
/// The next chunk is read only after the previous one has been written,
/// and each write is bounded by `options.timeout`. Returns the number of
/// bytes written to `sink`.
///
/// # Errors
///
/// Returns I/O errors from either side or [`Error::Timeout`] for a stalled write.
pub async fn write_data<R, W>(source: &mut R, sink: &mut W, options: &DataOptions) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut encoder = DotEncoder::new();
    let mut input = vec![0u8; options.chunk_size.max(1)];
    let mut out = BytesMut::with_capacity(options.chunk_size + 64);
    let mut written = 0u64;

    loop {
        let n = source.read(&mut input).await?;
        if n == 0 {
            break;
        }

        encoder.encode(&input[..n], &mut out);
        write_chunk(sink, &out, options).await?;
        written += out.len() as u64;
        out.clear();
    }

    encoder.finish(&mut out);
    write_chunk(sink, &out, options).await?;
    written += out.len() as u64;

    with_timeout(options.timeout, async { sink.flush().await.map_err(Error::from) }).await?;
    tracing::debug!(bytes = written, "message data sent");
    Ok(written)
}

async fn write_chunk<W>(sink: &mut W, chunk: &[u8], options: &DataOptions) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    with_timeout(options.timeout, async {
        sink.write_all(chunk).await.map_err(Error::from)
    })
    .await
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
    use tokio_test::io::Builder;

    fn encode_all(chunks: &[&[u8]]) -> Vec<u8> {
        let mut encoder = DotEncoder::new();
        let mut out = BytesMut::new();
        for chunk in chunks {
            encoder.encode(chunk, &mut out);
        }
        encoder.finish(&mut out);
        out.to_vec()
    }

    #[test]
    fn test_single_dot() {
        assert_eq!(encode_all(&[b"."]), b"..\r\n.\r\n");
    }

    #[test]
    fn test_empty_body() {
        assert_eq!(encode_all(&[]), b".\r\n");
    }

    #[test]
    fn test_dot_after_crlf_is_doubled() {
        assert_eq!(
            encode_all(&[b"Hi\r\n.\r\nBye"]),
            b"Hi\r\n..\r\nBye\r\n.\r\n"
        );
    }

    #[test]
    fn test_dot_mid_line_untouched() {
        assert_eq!(encode_all(&[b"a.b\r\n"]), b"a.b\r\n.\r\n");
    }

    #[test]
    fn test_bare_line_breaks_normalized() {
        assert_eq!(encode_all(&[b"one\ntwo\rthree\r\n"]), b"one\r\ntwo\r\nthree\r\n.\r\n");
        assert_eq!(encode_all(&[b"\r\r"]), b"\r\n\r\n.\r\n");
        assert_eq!(encode_all(&[b"end\r"]), b"end\r\n.\r\n");
    }

    #[test]
    fn test_dot_after_bare_lf_and_cr() {
        assert_eq!(encode_all(&[b"a\n.b"]), b"a\r\n..b\r\n.\r\n");
        assert_eq!(encode_all(&[b"a\r.b"]), b"a\r\n..b\r\n.\r\n");
    }

    #[test]
    fn test_chunk_boundaries() {
        assert_eq!(
            encode_all(&[b"line\r", b"\n", b".", b"dot\n"]),
            encode_all(&[b"line\r\n.dot\n"])
        );
        assert_eq!(encode_all(&[b"a\r", b"b"]), b"a\r\nb\r\n.\r\n");
    }

    #[tokio::test]
    async fn test_write_data_streams_chunks() {
        let mut source = Builder::new().read(b"Subject: hi\n").read(b"\n.hidden\n").build();
        let mut sink = Builder::new()
            .write(b"Subject: hi\r\n")
            .write(b"\r\n..hidden\r\n")
            .write(b".\r\n")
            .build();

        let written = write_data(&mut source, &mut sink, &DataOptions::default())
            .await
            .unwrap();
        assert_eq!(written, 28);
    }
}
