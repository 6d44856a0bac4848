//! Transports for SMTP sessions.

#![allow(clippy::missing_errors_doc)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use super::observer::ConnectInfo;
use crate::error::{Error, Result};

/// Opens and upgrades the byte streams a session runs over.
pub trait Connector: Send + Sync {
    /// Stream type produced by this connector.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Opens a stream to `info`, with TLS from the start for
    /// [`Security::Implicit`](super::Security::Implicit).
    fn connect(&self, info: &ConnectInfo) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Re-wraps a plaintext stream in TLS after `STARTTLS`.
    fn upgrade(
        &self,
        stream: Self::Stream,
        hostname: &str,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// A stream that can be either plaintext or TLS.
pub enum SmtpStream {
    /// Plaintext TCP stream.
    Plain(TcpStream),
    /// TLS-encrypted stream (boxed to reduce enum size).
    Tls(Box<TlsStream<TcpStream>>),
}

impl SmtpStream {
    /// Returns true if the stream is TLS-encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl AsyncRead for SmtpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SmtpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// TCP connector with rustls and the webpki root store.
#[derive(Clone)]
pub struct TcpConnector {
    tls: TlsConnector,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpConnector {
    /// Creates a connector trusting the webpki roots.
    #[must_use]
    pub fn new() -> Self {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self::with_tls(TlsConnector::from(Arc::new(config)))
    }

    /// Creates a connector using a caller-provided TLS configuration.
    #[must_use]
    pub const fn with_tls(tls: TlsConnector) -> Self {
        Self { tls }
    }

    async fn handshake(&self, tcp: TcpStream, hostname: &str) -> Result<SmtpStream> {
        let server_name = ServerName::try_from(hostname.to_string())?;
        let tls = self.tls.connect(server_name, tcp).await?;
        tracing::debug!(hostname, "TLS established");
        Ok(SmtpStream::Tls(Box::new(tls)))
    }
}

impl Connector for TcpConnector {
    type Stream = SmtpStream;

    async fn connect(&self, info: &ConnectInfo) -> Result<SmtpStream> {
        let tcp = TcpStream::connect((info.hostname.as_str(), info.port)).await?;
        tracing::debug!(hostname = %info.hostname, port = info.port, "TCP connected");

        if info.security.is_implicit() {
            self.handshake(tcp, &info.hostname).await
        } else {
            Ok(SmtpStream::Plain(tcp))
        }
    }

    async fn upgrade(&self, stream: SmtpStream, hostname: &str) -> Result<SmtpStream> {
        match stream {
            SmtpStream::Plain(tcp) => self.handshake(tcp, hostname).await,
            SmtpStream::Tls(_) => Err(Error::InvalidState("stream is already TLS".to_string())),
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
    use crate::connection::Security;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"220 ready\r\n").await.unwrap();
        });

        let info = ConnectInfo {
            hostname: "127.0.0.1".to_string(),
            port,
            security: Security::None,
        };
        let mut stream = TcpConnector::new().connect(&info).await.unwrap();
        assert!(!stream.is_tls());

        let mut greeting = [0u8; 11];
        stream.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 ready\r\n");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let info = ConnectInfo {
            hostname: "127.0.0.1".to_string(),
            port,
            security: Security::None,
        };
        let result = TcpConnector::new().connect(&info).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
