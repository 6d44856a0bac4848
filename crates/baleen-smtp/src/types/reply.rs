//! SMTP reply types.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::Extension;
use crate::error::{Error, Result};

/// One parsed reply line, e.g. `250-SIZE 1000`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyLine {
    /// Reply code.
    pub code: ReplyCode,
    /// False for continuation lines (`DDD-text`).
    pub is_last: bool,
    /// Text after the code, trailing whitespace trimmed.
    pub message: String,
}

/// SMTP reply from server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    /// Reply code (e.g., 250).
    pub code: ReplyCode,
    /// Message of the first line.
    pub message: String,
    /// Messages of every line, in order.
    pub lines: Vec<String>,
}

impl Reply {
    /// Creates a new reply. The first line doubles as the message.
    #[must_use]
    pub fn new(code: ReplyCode, lines: Vec<String>) -> Self {
        Self {
            code,
            message: lines.first().cloned().unwrap_or_default(),
            lines,
        }
    }

    /// Creates a reply builder.
    #[must_use]
    pub fn builder() -> ReplyBuilder {
        ReplyBuilder::default()
    }

    /// Reduces parsed lines into one reply.
    ///
    /// # Errors
    ///
    /// - [`Error::EmptyReply`] for no lines
    /// - [`Error::PrematureTermination`] if a final line is not the last one
    /// - [`Error::UnterminatedReply`] if the last line is a continuation
    /// - [`Error::InvalidReplyLine`] if the lines disagree on the code
    pub fn from_lines(lines: impl IntoIterator<Item = ReplyLine>) -> Result<Self> {
        let mut lines = lines.into_iter().peekable();
        let first = lines.peek().cloned().ok_or(Error::EmptyReply)?;

        let mut code = first.code;
        let mut messages = Vec::new();
        let mut terminated = false;

        for (index, line) in lines.enumerate() {
            if terminated {
                return Err(Error::PrematureTermination(index));
            }
            if line.code != first.code {
                return Err(Error::InvalidReplyLine(format!(
                    "code {} does not match {} on line {}",
                    line.code,
                    first.code,
                    index + 1
                )));
            }
            code = line.code;
            terminated = line.is_last;
            messages.push(line.message);
        }

        if !terminated {
            return Err(Error::UnterminatedReply);
        }

        Ok(Self {
            code,
            message: first.message,
            lines: messages,
        })
    }

    /// Serializes the reply to CRLF-terminated lines.
    ///
    /// A non-empty `message` replaces the first line.
    ///
    /// `max_line_length` counts the `CRLF`, so a rendered line carries at
    /// most `max_line_length - 2` bytes of text. [`parse_reply_line`]
    /// applies the same limit to the line without its terminator, so a
    /// parsed line longer than `max_line_length - 2` bytes does not
    /// serialize again under the same limit.
    ///
    /// [`parse_reply_line`]: crate::parse_reply_line
    ///
    /// # Errors
    ///
    /// - [`Error::MissingLines`] if there is nothing to send
    /// - [`Error::InvalidReplyLine`] if the code is outside 200-599
    /// - [`Error::Framing`] if a line contains CR or LF inside its text
    /// - [`Error::Oversize`] if a rendered line exceeds `max_line_length`
    pub fn serialize(&self, max_line_length: usize) -> Result<String> {
        let mut lines = self.lines.clone();
        if !self.message.is_empty() {
            match lines.first_mut() {
                Some(first) => first.clone_from(&self.message),
                None => lines.push(self.message.clone()),
            }
        }
        if lines.is_empty() {
            return Err(Error::MissingLines);
        }
        if !(200..600).contains(&self.code.as_u16()) {
            return Err(Error::InvalidReplyLine(format!(
                "code {} out of range",
                self.code
            )));
        }

        let last = lines.len() - 1;
        let mut out = String::new();
        for (index, line) in lines.iter().enumerate() {
            let separator = if index == last { ' ' } else { '-' };
            let text = line.trim();
            if let Some(position) = text.find(['\r', '\n']) {
                return Err(Error::Framing {
                    position: out.len() + 4 + position,
                    reason: "line break inside reply text",
                });
            }
            let rendered = format!("{}{separator}{text}\r\n", self.code);
            if rendered.len() > max_line_length {
                return Err(Error::Oversize {
                    length: rendered.len(),
                    limit: max_line_length,
                });
            }
            out.push_str(&rendered);
        }
        Ok(out)
    }

    /// Returns true if this is a success reply (2xx).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.is_success()
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(&self) -> bool {
        self.code.is_intermediate()
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient_error(&self) -> bool {
        self.code.is_transient()
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent_error(&self) -> bool {
        self.code.is_permanent()
    }

    /// Returns the full message as a single string.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.lines.join("\n")
    }

    /// Parses the EHLO keywords carried after the first line.
    #[must_use]
    pub fn extensions(&self) -> Vec<Extension> {
        self.lines.iter().skip(1).map(|line| Extension::parse(line)).collect()
    }

    /// Converts a reply into an error carrying its code and text.
    #[must_use]
    pub fn into_error(self) -> Error {
        Error::smtp_error(self.code.as_u16(), self.message_text())
    }
}

/// Builder for replies assembled by hand.
#[derive(Debug, Clone, Default)]
pub struct ReplyBuilder {
    code: Option<u16>,
    message: Option<String>,
    lines: Vec<String>,
}

impl ReplyBuilder {
    /// Sets the reply code.
    #[must_use]
    pub const fn code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// Sets the first-line message.
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Appends a line.
    #[must_use]
    pub fn line(mut self, line: impl Into<String>) -> Self {
        self.lines.push(line.into());
        self
    }

    /// Builds the reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCode`] without a code and [`Error::MissingLines`]
    /// without any line or message.
    pub fn build(self) -> Result<Reply> {
        let code = self.code.ok_or(Error::MissingCode)?;
        let mut lines = self.lines;
        match (self.message, lines.first_mut()) {
            (Some(message), Some(first)) => *first = message,
            (Some(message), None) => lines.push(message),
            (None, Some(_)) => {}
            (None, None) => return Err(Error::MissingLines),
        }
        Ok(Reply::new(ReplyCode::new(code), lines))
    }
}

/// SMTP reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Creates a new reply code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// Returns the numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Returns true if this is a success code (2xx).
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 >= 200 && self.0 < 300
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(self) -> bool {
        self.0 >= 400 && self.0 < 500
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 500 && self.0 < 600
    }

    /// Returns true if this is an intermediate reply (3xx).
    #[must_use]
    pub const fn is_intermediate(self) -> bool {
        self.0 >= 300 && self.0 < 400
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Common reply codes
impl ReplyCode {
    /// 220 Service ready
    pub const SERVICE_READY: Self = Self(220);
    /// 221 Service closing transmission channel
    pub const CLOSING: Self = Self(221);
    /// 250 Requested mail action okay, completed
    pub const OK: Self = Self(250);
    /// 251 User not local; will forward
    pub const FORWARD: Self = Self(251);
    /// 354 Start mail input
    pub const START_DATA: Self = Self(354);
    /// 421 Service not available, closing transmission channel
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// 450 Mailbox unavailable (busy)
    pub const MAILBOX_BUSY: Self = Self(450);
    /// 451 Local error in processing
    pub const LOCAL_ERROR: Self = Self(451);
    /// 452 Insufficient system storage
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// 454 TLS not available due to temporary reason
    pub const TLS_UNAVAILABLE: Self = Self(454);
    /// 500 Syntax error, command unrecognized
    pub const SYNTAX_ERROR: Self = Self(500);
    /// 501 Syntax error in parameters or arguments
    pub const PARAMETER_ERROR: Self = Self(501);
    /// 502 Command not implemented
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// 503 Bad sequence of commands
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 550 Mailbox unavailable (not found, access denied)
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// 552 Exceeded storage allocation
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// 554 Transaction failed
    pub const TRANSACTION_FAILED: Self = Self(554);
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

    fn line(code: u16, is_last: bool, message: &str) -> ReplyLine {
        ReplyLine {
            code: ReplyCode::new(code),
            is_last,
            message: message.to_string(),
        }
    }

    mod reply_code_tests {
        use super::*;

        #[test]
        fn classes() {
            assert!(ReplyCode::OK.is_success());
            assert!(ReplyCode::START_DATA.is_intermediate());
            assert!(ReplyCode::MAILBOX_BUSY.is_transient());
            assert!(ReplyCode::MAILBOX_UNAVAILABLE.is_permanent());
            assert!(!ReplyCode::OK.is_permanent());
        }

        #[test]
        fn display_and_ordering() {
            assert_eq!(format!("{}", ReplyCode::OK), "250");
            assert!(ReplyCode::OK < ReplyCode::MAILBOX_BUSY);
        }
    }

    mod from_lines_tests {
        use super::*;

        #[test]
        fn multi_line() {
            let reply = Reply::from_lines(vec![
                line(250, false, "mx.example.com"),
                line(250, false, "SIZE 1000"),
                line(250, true, "STARTTLS"),
            ])
            .unwrap();
            assert_eq!(reply.code, ReplyCode::OK);
            assert_eq!(reply.message, "mx.example.com");
            assert_eq!(reply.lines, vec!["mx.example.com", "SIZE 1000", "STARTTLS"]);
        }

        #[test]
        fn empty() {
            assert!(matches!(Reply::from_lines(vec![]), Err(Error::EmptyReply)));
        }

        #[test]
        fn premature_termination() {
            let result = Reply::from_lines(vec![line(250, true, "a"), line(250, true, "b")]);
            assert!(matches!(result, Err(Error::PrematureTermination(1))));
        }

        #[test]
        fn unterminated() {
            let result = Reply::from_lines(vec![line(250, false, "a"), line(250, false, "b")]);
            assert!(matches!(result, Err(Error::UnterminatedReply)));
        }

        #[test]
        fn mixed_codes() {
            let result = Reply::from_lines(vec![line(250, false, "a"), line(550, true, "b")]);
            assert!(matches!(result, Err(Error::InvalidReplyLine(_))));
        }
    }

    mod serialize_tests {
        use super::*;

        #[test]
        fn multi_line() {
            let reply = Reply::new(
                ReplyCode::OK,
                vec!["mx.example.com".to_string(), "PIPELINING".to_string()],
            );
            assert_eq!(
                reply.serialize(512).unwrap(),
                "250-mx.example.com\r\n250 PIPELINING\r\n"
            );
        }

        #[test]
        fn message_overwrites_first_line() {
            let mut reply = Reply::new(ReplyCode::OK, vec!["old".to_string(), "tail".to_string()]);
            reply.message = "new  ".to_string();
            assert_eq!(reply.serialize(512).unwrap(), "250-new\r\n250 tail\r\n");
        }

        #[test]
        fn missing_lines() {
            let reply = Reply::new(ReplyCode::OK, vec![]);
            assert!(matches!(reply.serialize(512), Err(Error::MissingLines)));
        }

        #[test]
        fn line_breaks_in_text() {
            let reply = Reply::new(ReplyCode::OK, vec!["ok\r\n550 fake".to_string()]);
            assert!(matches!(
                reply.serialize(512),
                Err(Error::Framing { position: 6, .. })
            ));

            let reply = Reply::new(
                ReplyCode::OK,
                vec!["first".to_string(), "second\nthird".to_string()],
            );
            assert!(matches!(
                reply.serialize(512),
                Err(Error::Framing { position: 21, .. })
            ));

            let mut reply = Reply::new(ReplyCode::OK, vec!["fine".to_string()]);
            reply.message = "bad\rline".to_string();
            assert!(matches!(reply.serialize(512), Err(Error::Framing { .. })));
        }

        #[test]
        fn limit_counts_terminator() {
            let reply = Reply::new(ReplyCode::OK, vec!["x".repeat(506)]);
            assert_eq!(reply.serialize(512).unwrap().len(), 512);

            let reply = Reply::new(ReplyCode::OK, vec!["x".repeat(507)]);
            assert!(matches!(
                reply.serialize(512),
                Err(Error::Oversize { length: 513, limit: 512 })
            ));
        }

        #[test]
        fn oversize() {
            let reply = Reply::new(ReplyCode::OK, vec!["x".repeat(600)]);
            assert!(matches!(reply.serialize(512), Err(Error::Oversize { .. })));
        }
    }

    mod builder_tests {
        use super::*;

        #[test]
        fn builds() {
            let reply = Reply::builder().code(354).message("Go ahead").build().unwrap();
            assert_eq!(reply.code, ReplyCode::START_DATA);
            assert_eq!(reply.lines, vec!["Go ahead"]);
        }

        #[test]
        fn missing_code() {
            assert!(matches!(
                Reply::builder().message("hi").build(),
                Err(Error::MissingCode)
            ));
        }

        #[test]
        fn missing_lines() {
            assert!(matches!(
                Reply::builder().code(250).build(),
                Err(Error::MissingLines)
            ));
        }
    }

    #[test]
    fn extensions_skip_greeting_line() {
        let reply = Reply::new(
            ReplyCode::OK,
            vec![
                "mx.example.com".to_string(),
                "STARTTLS".to_string(),
                "SIZE 35882577".to_string(),
            ],
        );
        assert_eq!(
            reply.extensions(),
            vec![Extension::StartTls, Extension::Size(Some(35_882_577))]
        );
    }

    #[test]
    fn into_error() {
        let reply = Reply::new(ReplyCode::MAILBOX_UNAVAILABLE, vec!["no such user".to_string()]);
        let err = reply.into_error();
        assert!(err.is_permanent());
        assert_eq!(err.to_string(), "SMTP error 550: no such user");
    }
}
