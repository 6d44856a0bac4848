//! SMTP command lines.
//!
//! A [`Command`] is a verb plus the verb-specific argument (EHLO domain,
//! MAIL reverse path, RCPT forward path) and trailing ESMTP parameters.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// ESMTP parameter following the command argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    /// Keyword without a value, e.g. `SMTPUTF8`.
    Flag(String),
    /// `KEY=VALUE` pair, e.g. `SIZE=1000`.
    Pair(String, String),
}

impl Param {
    /// Parses a single parameter token.
    #[must_use]
    pub fn parse(token: &str) -> Self {
        match token.split_once('=') {
            Some((key, value)) => Self::Pair(key.to_string(), value.to_string()),
            None => Self::Flag(token.to_string()),
        }
    }

    /// Returns the parameter keyword.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Flag(key) | Self::Pair(key, _) => key,
        }
    }

    /// Returns the value of a `KEY=VALUE` parameter.
    #[must_use]
    pub fn value(&self) -> Option<&str> {
        match self {
            Self::Flag(_) => None,
            Self::Pair(_, value) => Some(value),
        }
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flag(key) => f.write_str(key),
            Self::Pair(key, value) => write!(f, "{key}={value}"),
        }
    }
}

/// SMTP command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Command verb as given, conventionally upper case.
    pub verb: String,
    /// EHLO client domain.
    pub domain: Option<String>,
    /// MAIL reverse path, without angle brackets. May be empty (`<>`).
    pub return_path: Option<String>,
    /// RCPT forward path, without angle brackets.
    pub forward_path: Option<String>,
    /// ESMTP parameters in input order.
    pub params: Vec<Param>,
}

impl Command {
    /// Creates a command with only a verb.
    #[must_use]
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            ..Self::default()
        }
    }

    /// EHLO - Extended greeting
    #[must_use]
    pub fn ehlo(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ..Self::new("EHLO")
        }
    }

    /// MAIL FROM - Start mail transaction
    #[must_use]
    pub fn mail_from(return_path: impl Into<String>) -> Self {
        Self {
            return_path: Some(return_path.into()),
            ..Self::new("MAIL")
        }
    }

    /// RCPT TO - Add recipient
    #[must_use]
    pub fn rcpt_to(forward_path: impl Into<String>) -> Self {
        Self {
            forward_path: Some(forward_path.into()),
            ..Self::new("RCPT")
        }
    }

    /// DATA - Begin message data
    #[must_use]
    pub fn data() -> Self {
        Self::new("DATA")
    }

    /// STARTTLS - Upgrade to TLS
    #[must_use]
    pub fn starttls() -> Self {
        Self::new("STARTTLS")
    }

    /// RSET - Reset transaction
    #[must_use]
    pub fn rset() -> Self {
        Self::new("RSET")
    }

    /// NOOP - No operation
    #[must_use]
    pub fn noop() -> Self {
        Self::new("NOOP")
    }

    /// QUIT - Close connection
    #[must_use]
    pub fn quit() -> Self {
        Self::new("QUIT")
    }

    /// Appends a parameter.
    #[must_use]
    pub fn with_param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    /// Returns true if the verb matches `verb`, ignoring ASCII case.
    #[must_use]
    pub fn is(&self, verb: &str) -> bool {
        self.verb.eq_ignore_ascii_case(verb)
    }

    /// Parses a command line. See [`parse_command_line`].
    ///
    /// # Errors
    ///
    /// Returns an error if the line is empty, too long, or lacks a required argument.
    pub fn parse(line: &str, max_line_length: usize) -> Result<Self> {
        parse_command_line(line, max_line_length)
    }

    /// Serializes the command to a CRLF-terminated line.
    ///
    /// # Errors
    ///
    /// Returns an error if the verb or a required argument is missing,
    /// [`Error::Framing`] if any field contains CR or LF, or
    /// [`Error::Oversize`] if the line would exceed `max_line_length`.
    pub fn serialize(&self, max_line_length: usize) -> Result<String> {
        if self.verb.is_empty() {
            return Err(Error::MissingVerb);
        }

        let mut line = self.verb.clone();

        if self.is("EHLO") {
            let domain = self
                .domain
                .as_deref()
                .filter(|d| !d.is_empty())
                .ok_or_else(|| self.missing("a domain"))?;
            line.push(' ');
            line.push_str(domain);
        } else if self.is("MAIL") {
            line.push_str(" FROM:<");
            line.push_str(self.return_path.as_deref().unwrap_or_default());
            line.push('>');
        } else if self.is("RCPT") {
            let path = self
                .forward_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| self.missing("a forward path"))?;
            line.push_str(" TO:<");
            line.push_str(path);
            line.push('>');
        }

        for param in &self.params {
            line.push(' ');
            line.push_str(&param.to_string());
        }

        if let Some(position) = line.find(['\r', '\n']) {
            return Err(Error::Framing {
                position,
                reason: "line break inside command field",
            });
        }
        line.push_str("\r\n");

        if line.len() > max_line_length {
            return Err(Error::Oversize {
                length: line.len(),
                limit: max_line_length,
            });
        }
        Ok(line)
    }

    fn missing(&self, argument: &'static str) -> Error {
        Error::MissingArgument {
            verb: self.verb.clone(),
            argument,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.serialize(usize::MAX) {
            Ok(line) => f.write_str(line.trim_end()),
            Err(_) => f.write_str(&self.verb),
        }
    }
}

/// Parses one command line (terminator optional).
///
/// Trailing whitespace is trimmed first. The trimmed line must leave room
/// for a `CRLF` within `max_line_length`.
///
/// # Errors
///
/// - [`Error::EmptyInput`] for a blank line
/// - [`Error::Oversize`] if the trimmed line is longer than `max_line_length - 2`
/// - [`Error::MissingArgument`] if EHLO, MAIL or RCPT lack their argument
pub fn parse_command_line(line: &str, max_line_length: usize) -> Result<Command> {
    let line = line.trim_end();
    if line.is_empty() {
        return Err(Error::EmptyInput);
    }

    let limit = max_line_length.saturating_sub(2);
    if line.len() > limit {
        return Err(Error::Oversize {
            length: line.len(),
            limit,
        });
    }

    let mut tokens = line.split_whitespace();
    let verb = tokens.next().ok_or(Error::EmptyInput)?;
    let mut command = Command::new(verb);

    if command.is("EHLO") {
        let domain = tokens.next().ok_or_else(|| command.missing("a domain"))?;
        command.domain = Some(domain.to_string());
    } else if command.is("MAIL") {
        let path = tokens
            .next()
            .and_then(|token| parse_path(token, "FROM:"))
            .ok_or_else(|| command.missing("FROM:<reverse-path>"))?;
        command.return_path = Some(path.to_string());
    } else if command.is("RCPT") {
        let path = tokens
            .next()
            .and_then(|token| parse_path(token, "TO:"))
            .filter(|path| !path.is_empty())
            .ok_or_else(|| command.missing("TO:<forward-path>"))?;
        command.forward_path = Some(path.to_string());
    }

    command.params = tokens.map(Param::parse).collect();
    Ok(command)
}

/// Serializes an optional command; `None` becomes `NOOP`.
///
/// # Errors
///
/// See [`Command::serialize`].
pub fn serialize_command(command: Option<&Command>, max_line_length: usize) -> Result<String> {
    match command {
        Some(command) => command.serialize(max_line_length),
        None => Command::noop().serialize(max_line_length),
    }
}

/// Extracts the path from `FROM:<path>` / `TO:<path>`.
///
/// Brackets are optional but must be paired when present.
fn parse_path<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    let head = token.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &token[prefix.len()..];

    match (rest.strip_prefix('<'), rest.ends_with('>')) {
        (Some(inner), true) => inner.strip_suffix('>'),
        (None, false) => Some(rest),
        _ => None,
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
    use crate::line::DEFAULT_MAX_LINE_LENGTH as MAX;

    #[test]
    fn test_parse_mail_with_params() {
        let cmd = parse_command_line("MAIL FROM:<test@baleen.io> SIZE=1000000 TESTPARAM", MAX)
            .unwrap();
        assert_eq!(cmd.verb, "MAIL");
        assert_eq!(cmd.return_path.as_deref(), Some("test@baleen.io"));
        assert_eq!(
            cmd.params,
            vec![
                Param::Pair("SIZE".to_string(), "1000000".to_string()),
                Param::Flag("TESTPARAM".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_mail_null_sender() {
        let cmd = parse_command_line("MAIL FROM:<>", MAX).unwrap();
        assert_eq!(cmd.return_path.as_deref(), Some(""));
    }

    #[test]
    fn test_parse_mail_without_brackets() {
        let cmd = parse_command_line("MAIL FROM:user@example.com", MAX).unwrap();
        assert_eq!(cmd.return_path.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn test_parse_mail_unpaired_bracket() {
        assert!(matches!(
            parse_command_line("MAIL FROM:<user@example.com", MAX),
            Err(Error::MissingArgument { .. })
        ));
        assert!(matches!(
            parse_command_line("MAIL FROM:user@example.com>", MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_parse_mail_missing_from() {
        assert!(matches!(
            parse_command_line("MAIL", MAX),
            Err(Error::MissingArgument { .. })
        ));
        assert!(matches!(
            parse_command_line("MAIL TO:<a@b.c>", MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_parse_rcpt() {
        let cmd = parse_command_line("RCPT TO:<recipient@example.com> NOTIFY=NEVER", MAX).unwrap();
        assert_eq!(cmd.forward_path.as_deref(), Some("recipient@example.com"));
        assert_eq!(cmd.params.len(), 1);
        assert_eq!(cmd.params[0].key(), "NOTIFY");
        assert_eq!(cmd.params[0].value(), Some("NEVER"));
    }

    #[test]
    fn test_parse_rcpt_empty_path_rejected() {
        assert!(matches!(
            parse_command_line("RCPT TO:<>", MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_parse_ehlo() {
        let cmd = parse_command_line("EHLO client.example.com\r\n", MAX).unwrap();
        assert_eq!(cmd.domain.as_deref(), Some("client.example.com"));
        assert!(cmd.params.is_empty());

        assert!(matches!(
            parse_command_line("EHLO", MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_parse_other_verbs() {
        let cmd = parse_command_line("VRFY postmaster", MAX).unwrap();
        assert_eq!(cmd.verb, "VRFY");
        assert_eq!(cmd.params, vec![Param::Flag("postmaster".to_string())]);

        let cmd = parse_command_line("quit", MAX).unwrap();
        assert_eq!(cmd.verb, "quit");
        assert!(cmd.is("QUIT"));
    }

    #[test]
    fn test_parse_empty() {
        assert!(matches!(parse_command_line("", MAX), Err(Error::EmptyInput)));
        assert!(matches!(parse_command_line("  \r\n", MAX), Err(Error::EmptyInput)));
    }

    #[test]
    fn test_parse_length_boundary() {
        let exact = format!("NOOP {}", "x".repeat(MAX - 2 - 5));
        assert_eq!(exact.len(), MAX - 2);
        assert!(parse_command_line(&exact, MAX).is_ok());

        let over = format!("{exact}x");
        assert!(matches!(
            parse_command_line(&over, MAX),
            Err(Error::Oversize { length, limit }) if length == MAX - 1 && limit == MAX - 2
        ));
    }

    #[test]
    fn test_serialize_none_is_noop() {
        assert_eq!(serialize_command(None, MAX).unwrap(), "NOOP\r\n");
    }

    #[test]
    fn test_serialize_missing_verb() {
        assert!(matches!(
            Command::default().serialize(MAX),
            Err(Error::MissingVerb)
        ));
    }

    #[test]
    fn test_serialize_ehlo() {
        assert_eq!(
            Command::ehlo("client.example.com").serialize(MAX).unwrap(),
            "EHLO client.example.com\r\n"
        );
        assert!(matches!(
            Command::new("EHLO").serialize(MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_serialize_mail_from() {
        assert_eq!(
            Command::mail_from("sender@example.com").serialize(MAX).unwrap(),
            "MAIL FROM:<sender@example.com>\r\n"
        );
        // The reverse path is rendered even when absent.
        assert_eq!(Command::new("MAIL").serialize(MAX).unwrap(), "MAIL FROM:<>\r\n");
    }

    #[test]
    fn test_serialize_mail_from_with_params() {
        let cmd = Command::mail_from("sender@example.com")
            .with_param(Param::Pair("BODY".to_string(), "8BITMIME".to_string()))
            .with_param(Param::Pair("SIZE".to_string(), "12345".to_string()))
            .with_param(Param::Flag("SMTPUTF8".to_string()));
        assert_eq!(
            cmd.serialize(MAX).unwrap(),
            "MAIL FROM:<sender@example.com> BODY=8BITMIME SIZE=12345 SMTPUTF8\r\n"
        );
    }

    #[test]
    fn test_serialize_rcpt_to() {
        assert_eq!(
            Command::rcpt_to("recipient@example.com").serialize(MAX).unwrap(),
            "RCPT TO:<recipient@example.com>\r\n"
        );
        assert!(matches!(
            Command::new("RCPT").serialize(MAX),
            Err(Error::MissingArgument { .. })
        ));
    }

    #[test]
    fn test_serialize_simple_verbs() {
        assert_eq!(Command::data().serialize(MAX).unwrap(), "DATA\r\n");
        assert_eq!(Command::rset().serialize(MAX).unwrap(), "RSET\r\n");
        assert_eq!(Command::quit().serialize(MAX).unwrap(), "QUIT\r\n");
        assert_eq!(Command::starttls().serialize(MAX).unwrap(), "STARTTLS\r\n");
    }

    #[test]
    fn test_serialize_oversize() {
        let cmd = Command::ehlo("x".repeat(MAX));
        assert!(matches!(cmd.serialize(MAX), Err(Error::Oversize { .. })));
    }

    #[test]
    fn test_serialize_rejects_line_breaks_in_fields() {
        assert!(matches!(
            Command::ehlo("a.example\r\nRCPT TO:<evil@x>").serialize(MAX),
            Err(Error::Framing { position: 14, .. })
        ));
        assert!(matches!(
            Command::mail_from("a@b.example\nDATA").serialize(MAX),
            Err(Error::Framing { .. })
        ));
        assert!(matches!(
            Command::rcpt_to("c@d.example\r").serialize(MAX),
            Err(Error::Framing { .. })
        ));
        assert!(matches!(
            Command::noop().with_param(Param::Flag("X\r\nQUIT".to_string())).serialize(MAX),
            Err(Error::Framing { position: 6, .. })
        ));
        assert!(matches!(
            Command::mail_from("a@b.example")
                .with_param(Param::Pair("SIZE".to_string(), "1\r\nQUIT".to_string()))
                .serialize(MAX),
            Err(Error::Framing { .. })
        ));
        assert!(matches!(
            Command::new("NO\nOP").serialize(MAX),
            Err(Error::Framing { position: 2, .. })
        ));
    }

    #[test]
    fn test_round_trip_normalizes() {
        let cmd = parse_command_line("MAIL   FROM:<a@b.example>   SIZE=10  ", MAX).unwrap();
        assert_eq!(cmd.serialize(MAX).unwrap(), "MAIL FROM:<a@b.example> SIZE=10\r\n");
    }

    #[test]
    fn test_display() {
        assert_eq!(Command::rcpt_to("a@b.c").to_string(), "RCPT TO:<a@b.c>");
    }
}
