//! Error types for SMTP operations.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Stage;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Protocol bytes were not valid UTF-8.
    #[error("Invalid UTF-8 in protocol line: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    /// Input was empty.
    #[error("Empty input")]
    EmptyInput,

    /// A line exceeded its length limit.
    #[error("Line of {length} bytes exceeds limit of {limit} bytes")]
    Oversize {
        /// Length seen (or that would have been reached).
        length: usize,
        /// Configured limit.
        limit: usize,
    },

    /// A bare CR or bare LF was found.
    #[error("Invalid line break at byte {position}: {reason}")]
    Framing {
        /// Offset of the offending byte.
        position: usize,
        /// What was wrong.
        reason: &'static str,
    },

    /// Bytes followed a single line in the same delivery.
    #[error("Unexpected {0} bytes after line terminator")]
    TrailingData(usize),

    /// Bytes followed the final line of a reply in the same delivery.
    #[error("Unexpected {0} bytes after final reply line")]
    TrailingOverhead(usize),

    /// Input ended before a terminator was found.
    #[error("Input ended before line terminator")]
    PrematureEnd,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// A verb is missing a required argument.
    #[error("{verb} requires {argument}")]
    MissingArgument {
        /// Command verb.
        verb: String,
        /// The argument that is missing or malformed.
        argument: &'static str,
    },

    /// Command has no verb.
    #[error("Command verb is missing")]
    MissingVerb,

    /// Reply line does not match `DDD[- ]text`.
    #[error("Invalid reply line: {0}")]
    InvalidReplyLine(String),

    /// Reply contained no lines.
    #[error("Empty reply")]
    EmptyReply,

    /// A final reply line appeared before the last position.
    #[error("Reply terminated early at line {0}")]
    PrematureTermination(usize),

    /// The last reply line was a continuation line.
    #[error("Reply has no final line")]
    UnterminatedReply,

    /// Reply has no code.
    #[error("Reply code is missing")]
    MissingCode,

    /// Reply has neither lines nor a message.
    #[error("Reply has no lines")]
    MissingLines,

    /// Session is not connected or has ended.
    #[error("Session is not connected")]
    NotConnected,

    /// An observer vetoed a checkpoint.
    #[error("Vetoed: {0}")]
    Veto(#[from] Veto),

    /// Observers did not complete a checkpoint in time.
    #[error("Checkpoint observers did not complete within {0:?}")]
    VetoTimeout(Duration),

    /// Connection URI was rejected.
    #[error("Invalid connection URI: {0}")]
    InvalidUri(String),

    /// Server returned an unexpected reply.
    #[error("SMTP error {code}: {message}")]
    Smtp {
        /// Reply code (e.g., 550).
        code: u16,
        /// Error message from server.
        message: String,
    },

    /// Feature not supported by server.
    #[error("Server does not support {0}")]
    NotSupported(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    /// The session was aborted.
    #[error(transparent)]
    Aborted(Arc<Abort>),
}

impl Error {
    /// Creates an SMTP error from a reply code and message.
    #[must_use]
    pub fn smtp_error(code: u16, message: impl Into<String>) -> Self {
        Self::Smtp {
            code,
            message: message.into(),
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if *code >= 500 && *code < 600)
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Smtp { code, .. } if *code >= 400 && *code < 500)
    }

    /// Returns the abort record if this error ended a session.
    #[must_use]
    pub fn as_abort(&self) -> Option<&Abort> {
        match self {
            Self::Aborted(abort) => Some(abort),
            _ => None,
        }
    }
}

/// Reason given by an observer to stop a session step.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct Veto {
    reason: String,
}

impl Veto {
    /// Creates a veto with the given reason.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Returns the reason text.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Terminal failure of a session, with the peer and stage it happened in.
#[derive(Debug, thiserror::Error)]
#[error("SMTP session with {peer} aborted while {stage}: {cause}")]
pub struct Abort {
    /// `host:port` of the remote endpoint.
    pub peer: String,
    /// Stage the session was in when it failed.
    pub stage: Stage,
    /// Underlying failure.
    #[source]
    pub cause: Error,
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

    #[test]
    fn smtp_error_classification() {
        assert!(Error::smtp_error(550, "no such user").is_permanent());
        assert!(Error::smtp_error(451, "try later").is_transient());
        assert!(!Error::smtp_error(250, "ok").is_permanent());
        assert!(!Error::EmptyInput.is_transient());
    }

    #[test]
    fn abort_display_names_peer_and_stage() {
        let abort = Abort {
            peer: "mx.example.com:25".to_string(),
            stage: Stage::AwaitingReply,
            cause: Error::PrematureEnd,
        };
        let text = Error::Aborted(Arc::new(abort)).to_string();
        assert!(text.contains("mx.example.com:25"));
        assert!(text.contains("awaiting reply"));
        assert!(text.contains("before line terminator"));
    }

    #[test]
    fn veto_converts_into_error() {
        let err: Error = Veto::new("blocked sender").into();
        assert_eq!(err.to_string(), "Vetoed: blocked sender");
    }
}
