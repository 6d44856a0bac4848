//! SMTP response parser.
//!
//! SMTP replies can be single-line or multi-line:
//! - Single: `250 OK\r\n`
//! - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::error::{Error, Result};
use crate::line::{LineBuffer, LineOptions, with_timeout};
use crate::types::{Reply, ReplyCode, ReplyLine};

/// Parses a single reply line (no terminator).
///
/// `max_line_length` applies to the line without its `CRLF`.
/// [`Reply::serialize`] counts the `CRLF`, so lines of the last two lengths
/// allowed here are accepted but cannot be written back under the same limit.
///
/// # Errors
///
/// - [`Error::EmptyInput`] for an empty line
/// - [`Error::Oversize`] if longer than `max_line_length`
/// - [`Error::Framing`] if the line contains CR or LF
/// - [`Error::InvalidReplyLine`] if it does not match `[2-5]DD[- ]text`
pub fn parse_reply_line(line: &str, max_line_length: usize) -> Result<ReplyLine> {
    if line.is_empty() {
        return Err(Error::EmptyInput);
    }
    if line.len() > max_line_length {
        return Err(Error::Oversize {
            length: line.len(),
            limit: max_line_length,
        });
    }
    if let Some(position) = line.find(['\r', '\n']) {
        return Err(Error::Framing {
            position,
            reason: "line break inside reply line",
        });
    }

    let bytes = line.as_bytes();
    let valid_code = bytes.len() >= 3
        && (b'2'..=b'5').contains(&bytes[0])
        && bytes[1].is_ascii_digit()
        && bytes[2].is_ascii_digit();
    if !valid_code {
        return Err(Error::InvalidReplyLine(line.to_string()));
    }

    let code = line[..3]
        .parse::<u16>()
        .map_err(|_| Error::InvalidReplyLine(line.to_string()))?;

    let (is_last, message) = match bytes.get(3) {
        None => (true, ""),
        Some(b' ') => (true, &line[4..]),
        Some(b'-') => (false, &line[4..]),
        Some(_) => return Err(Error::InvalidReplyLine(line.to_string())),
    };

    Ok(ReplyLine {
        code: ReplyCode::new(code),
        is_last,
        message: message.trim_end().to_string(),
    })
}

/// Parses a complete reply from text or bytes.
///
/// The input is split on `CRLF`; a single trailing `CRLF` is ignored.
///
/// # Errors
///
/// Returns any error of [`parse_reply_line`] or [`Reply::from_lines`].
pub fn parse_reply(input: impl AsRef<[u8]>, max_line_length: usize) -> Result<Reply> {
    let text = std::str::from_utf8(input.as_ref())?;
    let text = text.strip_suffix("\r\n").unwrap_or(text);
    if text.is_empty() {
        return Err(Error::EmptyReply);
    }

    let lines = text
        .split("\r\n")
        .map(|line| parse_reply_line(line, max_line_length))
        .collect::<Result<Vec<_>>>()?;
    Reply::from_lines(lines)
}

/// Serializes an optional reply.
///
/// # Errors
///
/// Returns [`Error::EmptyInput`] for `None`, otherwise see [`Reply::serialize`].
pub fn serialize_reply(reply: Option<&Reply>, max_line_length: usize) -> Result<String> {
    reply.ok_or(Error::EmptyInput)?.serialize(max_line_length)
}

/// Reads one complete reply from a buffered source.
///
/// Lines are parsed as they complete. The reply ends at the first final
/// line; bytes delivered after it in the same read are rejected with
/// [`Error::TrailingOverhead`].
///
/// # Errors
///
/// Returns framing, parse, [`Error::PrematureEnd`] or [`Error::Timeout`] errors.
pub async fn read_reply<R>(source: &mut R, options: &LineOptions) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    with_timeout(options.timeout, read_reply_inner(source, options.max_line_length)).await
}

async fn read_reply_inner<R>(source: &mut R, max_line_length: usize) -> Result<Reply>
where
    R: AsyncBufRead + Unpin,
{
    let mut buffer = LineBuffer::new(max_line_length);
    let mut lines = Vec::new();

    loop {
        let chunk = source.fill_buf().await?;
        if chunk.is_empty() {
            return Err(Error::PrematureEnd);
        }

        let len = chunk.len();
        let mut offset = 0;
        while offset < len {
            offset += buffer.push(&chunk[offset..]);

            while let Some(raw) = buffer.next_line()? {
                let line = parse_reply_line(std::str::from_utf8(&raw)?, max_line_length)?;
                tracing::trace!(code = line.code.as_u16(), last = line.is_last, message = %line.message, "reply line");

                let is_last = line.is_last;
                lines.push(line);

                if is_last {
                    let extra = buffer.len() + (len - offset);
                    source.consume(len);
                    if extra > 0 {
                        return Err(Error::TrailingOverhead(extra));
                    }
                    return Reply::from_lines(lines);
                }
            }
        }
        source.consume(len);
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
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio_test::io::Builder;

    const MAX: usize = 512;

    #[test]
    fn test_parse_reply_line_continuation() {
        let line = parse_reply_line("250-OK", MAX).unwrap();
        assert_eq!(line.code, ReplyCode::OK);
        assert!(!line.is_last);
        assert_eq!(line.message, "OK");
    }

    #[test]
    fn test_parse_reply_line_bare_code() {
        let line = parse_reply_line("250", MAX).unwrap();
        assert_eq!(line.code.as_u16(), 250);
        assert!(line.is_last);
        assert_eq!(line.message, "");
    }

    #[test]
    fn test_parse_reply_line_trims_message() {
        let line = parse_reply_line("220 smtp.example.com ESMTP ready   ", MAX).unwrap();
        assert!(line.is_last);
        assert_eq!(line.message, "smtp.example.com ESMTP ready");
    }

    #[test]
    fn test_parse_reply_line_errors() {
        assert!(matches!(parse_reply_line("", MAX), Err(Error::EmptyInput)));
        assert!(matches!(
            parse_reply_line(&"2".repeat(MAX + 1), MAX),
            Err(Error::Oversize { .. })
        ));
        assert!(matches!(
            parse_reply_line("250 OK\r\n", MAX),
            Err(Error::Framing { position: 6, .. })
        ));
        assert!(matches!(parse_reply_line("ABC OK", MAX), Err(Error::InvalidReplyLine(_))));
        assert!(matches!(parse_reply_line("150 OK", MAX), Err(Error::InvalidReplyLine(_))));
        assert!(matches!(parse_reply_line("600 OK", MAX), Err(Error::InvalidReplyLine(_))));
        assert!(matches!(parse_reply_line("25", MAX), Err(Error::InvalidReplyLine(_))));
        assert!(matches!(parse_reply_line("250OK", MAX), Err(Error::InvalidReplyLine(_))));
    }

    #[test]
    fn test_parse_reply_line_limit_excludes_terminator() {
        let line = format!("250 {}", "x".repeat(MAX - 4));
        let parsed = parse_reply_line(&line, MAX).unwrap();

        let reply = Reply::new(parsed.code, vec![parsed.message]);
        assert!(matches!(
            reply.serialize(MAX),
            Err(Error::Oversize { length, limit }) if length == MAX + 2 && limit == MAX
        ));
    }

    #[test]
    fn test_parse_single_line_reply() {
        let reply = parse_reply("250 OK\r\n", MAX).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.lines, vec!["OK"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let reply = parse_reply("250-First line\r\n250-Second line\r\n250 Last line", MAX).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, "First line");
        assert_eq!(reply.lines, vec!["First line", "Second line", "Last line"]);
    }

    #[test]
    fn test_parse_reply_bytes() {
        let reply = parse_reply(b"354 Go ahead\r\n", MAX).unwrap();
        assert_eq!(reply.code, ReplyCode::START_DATA);
    }

    #[test]
    fn test_parse_reply_errors() {
        assert!(matches!(parse_reply("", MAX), Err(Error::EmptyReply)));
        assert!(matches!(
            parse_reply("250 a\r\n250 b\r\n", MAX),
            Err(Error::PrematureTermination(_))
        ));
        assert!(matches!(parse_reply("250-a\r\n", MAX), Err(Error::UnterminatedReply)));
        assert!(matches!(parse_reply(b"250 \xff", MAX), Err(Error::Utf8(_))));
    }

    #[test]
    fn test_serialize_reply() {
        assert!(matches!(serialize_reply(None, MAX), Err(Error::EmptyInput)));

        let reply = parse_reply("250-mx.example.com\r\n250-SIZE 1000\r\n250 HELP\r\n", MAX).unwrap();
        assert_eq!(
            serialize_reply(Some(&reply), MAX).unwrap(),
            "250-mx.example.com\r\n250-SIZE 1000\r\n250 HELP\r\n"
        );
    }

    #[tokio::test]
    async fn test_read_reply_single_chunk() {
        let mock = Builder::new()
            .read(b"250-mx.example.com\r\n250-PIPELINING\r\n250 STARTTLS\r\n")
            .build();
        let mut source = BufReader::new(mock);

        let reply = read_reply(&mut source, &LineOptions::default()).await.unwrap();
        assert_eq!(reply.lines.len(), 3);
        assert_eq!(reply.message, "mx.example.com");
    }

    #[tokio::test]
    async fn test_read_reply_split_across_chunks() {
        let mock = Builder::new()
            .read(b"250-mx.exam")
            .read(b"ple.com\r\n250")
            .read(b" OK\r")
            .read(b"\n")
            .build();
        let mut source = BufReader::new(mock);

        let reply = read_reply(&mut source, &LineOptions::default()).await.unwrap();
        assert_eq!(reply.lines, vec!["mx.example.com", "OK"]);
    }

    #[tokio::test]
    async fn test_read_reply_trailing_overhead() {
        let mock = Builder::new().read(b"250 OK\r\n221 Bye\r\n").build();
        let mut source = BufReader::new(mock);

        let result = read_reply(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::TrailingOverhead(9))));
    }

    #[tokio::test]
    async fn test_read_reply_premature_end() {
        let mock = Builder::new().read(b"250-first\r\n").build();
        let mut source = BufReader::new(mock);

        let result = read_reply(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::PrematureEnd)));
    }

    #[tokio::test]
    async fn test_read_reply_line_limit() {
        let long_line = format!("250 {}\r\n", "x".repeat(600));
        let mock = Builder::new().read(long_line.as_bytes()).build();
        let mut source = BufReader::new(mock);

        let result = read_reply(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::Oversize { .. })));
    }

    #[tokio::test]
    async fn test_read_reply_invalid_line() {
        let mock = Builder::new().read(b"hello\r\n").build();
        let mut source = BufReader::new(mock);

        let result = read_reply(&mut source, &LineOptions::default()).await;
        assert!(matches!(result, Err(Error::InvalidReplyLine(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_reply_timeout() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"250-waiting\r\n").await.unwrap();

        let mut source = BufReader::new(client);
        let options = LineOptions::default().timeout(Duration::from_millis(500));
        let result = read_reply(&mut source, &options).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        drop(server);
    }
}
