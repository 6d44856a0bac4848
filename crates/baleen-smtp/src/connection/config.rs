//! Session configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::codec::DataOptions;
use crate::error::{Error, Result};
use crate::line::LineOptions;

/// Connection security mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    /// No encryption (port 25).
    None,
    /// Start with plaintext, upgrade with STARTTLS (port 25).
    #[default]
    StartTls,
    /// TLS from the start (port 587).
    Implicit,
}

impl Security {
    /// Returns the default port for this security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None | Self::StartTls => 25,
            Self::Implicit => 587,
        }
    }

    /// Returns true if the transport is encrypted from the first byte.
    #[must_use]
    pub const fn is_implicit(self) -> bool {
        matches!(self, Self::Implicit)
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "smtp" => Some(Self::None),
            "smtps" => Some(Self::Implicit),
            "smtp+starttls" => Some(Self::StartTls),
            _ => None,
        }
    }
}

/// SMTP session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
    /// Connection (and implicit TLS handshake) timeout.
    pub connect_timeout: Duration,
    /// Default deadline for one checkpoint's observer chain.
    pub veto_timeout: Duration,
    /// Reply line limits and read timeout.
    pub reply: LineOptions,
    /// DATA line limit and write timeout.
    pub data: DataOptions,
    /// Timeout for writing one command line. `None` disables it.
    pub write_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Creates a new configuration for plaintext with STARTTLS on port 25.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        SessionConfigBuilder::new(host).build()
    }

    /// Creates a configuration builder.
    #[must_use]
    pub fn builder(host: impl Into<String>) -> SessionConfigBuilder {
        SessionConfigBuilder::new(host)
    }

    /// Parses a connection URI such as `smtps://mail.example.com:465`.
    ///
    /// Accepted schemes are `smtp`, `smtps` and `smtp+starttls`. Without an
    /// explicit port the scheme's default port is used.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUri`] for relative URIs, other schemes, empty
    /// hosts and unparsable or zero ports.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| Error::InvalidUri(format!("{uri}: {e}")))?;

        let security = Security::from_scheme(url.scheme())
            .ok_or_else(|| Error::InvalidUri(format!("unsupported scheme {}", url.scheme())))?;

        let host = url
            .host_str()
            .map(|host| host.trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidUri(format!("{uri}: missing host")))?;

        let port = url.port().unwrap_or_else(|| security.default_port());
        if port == 0 {
            return Err(Error::InvalidUri(format!("{uri}: port 0")));
        }

        Ok(Self::builder(host).security(security).port(port).build())
    }

    /// Returns `host:port`.
    #[must_use]
    pub fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    host: String,
    port: Option<u16>,
    security: Security,
    connect_timeout: Duration,
    veto_timeout: Duration,
    reply: LineOptions,
    data: DataOptions,
    write_timeout: Option<Duration>,
}

impl SessionConfigBuilder {
    /// Creates a new builder with the given hostname.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
            security: Security::default(),
            connect_timeout: Duration::from_secs(30),
            veto_timeout: Duration::from_secs(3),
            reply: LineOptions::default(),
            data: DataOptions::default(),
            write_timeout: Some(Duration::from_secs(60)),
        }
    }

    /// Sets the port.
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Sets the security mode.
    #[must_use]
    pub const fn security(mut self, security: Security) -> Self {
        self.security = security;
        self
    }

    /// Sets the connection timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the default checkpoint deadline.
    #[must_use]
    pub const fn veto_timeout(mut self, timeout: Duration) -> Self {
        self.veto_timeout = timeout;
        self
    }

    /// Sets reply line options.
    #[must_use]
    pub const fn reply(mut self, options: LineOptions) -> Self {
        self.reply = options;
        self
    }

    /// Sets DATA options.
    #[must_use]
    pub const fn data(mut self, options: DataOptions) -> Self {
        self.data = options;
        self
    }

    /// Sets the command write timeout. A zero duration disables it.
    #[must_use]
    pub const fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SessionConfig {
        SessionConfig {
            host: self.host,
            port: self.port.unwrap_or_else(|| self.security.default_port()),
            security: self.security,
            connect_timeout: self.connect_timeout,
            veto_timeout: self.veto_timeout,
            reply: self.reply,
            data: self.data,
            write_timeout: self.write_timeout,
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

    #[test]
    fn test_default_ports() {
        assert_eq!(Security::None.default_port(), 25);
        assert_eq!(Security::StartTls.default_port(), 25);
        assert_eq!(Security::Implicit.default_port(), 587);
    }

    #[test]
    fn test_config_new() {
        let config = SessionConfig::new("smtp.example.com");
        assert_eq!(config.host, "smtp.example.com");
        assert_eq!(config.port, 25);
        assert_eq!(config.security, Security::StartTls);
        assert_eq!(config.veto_timeout, Duration::from_secs(3));
        assert_eq!(config.reply.max_line_length, 512);
        assert_eq!(config.data.max_line_length, 1000);
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::builder("smtp.example.com")
            .port(2525)
            .security(Security::None)
            .connect_timeout(Duration::from_secs(10))
            .write_timeout(Duration::ZERO)
            .build();

        assert_eq!(config.port, 2525);
        assert_eq!(config.security, Security::None);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, None);
        assert_eq!(config.peer(), "smtp.example.com:2525");
    }

    #[test]
    fn test_from_uri_schemes() {
        let config = SessionConfig::from_uri("smtp://mx.example.com").unwrap();
        assert_eq!(config.security, Security::None);
        assert_eq!(config.port, 25);

        let config = SessionConfig::from_uri("smtps://mail.example.com").unwrap();
        assert_eq!(config.security, Security::Implicit);
        assert_eq!(config.port, 587);

        let config = SessionConfig::from_uri("smtp+starttls://mail.example.com:2525").unwrap();
        assert_eq!(config.security, Security::StartTls);
        assert_eq!(config.host, "mail.example.com");
        assert_eq!(config.port, 2525);
    }

    #[test]
    fn test_from_uri_rejects() {
        for uri in [
            "mail.example.com",
            "http://mail.example.com",
            "smtp://",
            "smtp://mail.example.com:0",
            "smtp://mail.example.com:smtp",
            "smtp://mail.example.com:70000",
        ] {
            assert!(
                matches!(SessionConfig::from_uri(uri), Err(Error::InvalidUri(_))),
                "{uri} should be rejected"
            );
        }
    }
}
