//! DATA-phase transparency (RFC 5321 4.5.2).
//!
//! Outbound bodies go through [`DotEncoder`]: line endings become `CRLF`, a
//! `.` at the start of a line is doubled, and the body ends with a line
//! holding a single `.`. [`DotDecoder`] reverses this and stops at that line.

#![allow(clippy::missing_errors_doc)]

mod decoder;
mod encoder;

use std::time::Duration;

pub use decoder::{Decoded, DotDecoder, read_data};
pub use encoder::{DotEncoder, write_data};

/// Default maximum DATA line length (RFC 5321 4.5.3.1.6).
pub const DEFAULT_MAX_DATA_LINE_LENGTH: usize = 1000;

/// Limits for streaming a message body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataOptions {
    /// Maximum decoded line length, terminator included.
    pub max_line_length: usize,
    /// Time allowed per write when sending, or for the whole body when reading.
    pub timeout: Option<Duration>,
    /// Bytes read from the body source per chunk when sending.
    pub chunk_size: usize,
}

impl Default for DataOptions {
    fn default() -> Self {
        Self {
            max_line_length: DEFAULT_MAX_DATA_LINE_LENGTH,
            timeout: Some(crate::line::DEFAULT_TIMEOUT),
            chunk_size: 8192,
        }
    }
}

impl DataOptions {
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

    /// Sets the read chunk size used when sending.
    #[must_use]
    pub const fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }
}
