//! # baleen-smtp
//!
//! Client side of the SMTP wire protocol (RFC 5321).
//!
//! ## Features
//!
//! - **Strict framing**: CRLF-only line breaks, byte limits and timeouts
//!   over arbitrarily chunked input
//! - **Command and reply codecs**: parse and serialize command lines and
//!   single or multi-line replies, including a streaming reply reader
//! - **Dot transparency**: streaming encoder and decoder for `DATA` bodies
//! - **Observable sessions**: connect, command and reply checkpoints where
//!   observers can rewrite payloads or veto the step, bounded by a deadline
//! - **TLS**: implicit TLS and `STARTTLS` through rustls
//!
//! ## Quick Start
//!
//! ```ignore
//! use baleen_smtp::{Channel, Command, CommandOptions, Event, Session, SessionConfig, Veto};
//!
//! #[tokio::main]
//! async fn main() -> baleen_smtp::Result<()> {
//!     let config = SessionConfig::from_uri("smtp+starttls://smtp.example.com")?;
//!     let mut session = Session::new(config);
//!
//!     // Refuse to relay for one sender
//!     session.on(Channel::Command, |event: &mut Event| match event {
//!         Event::Command { command, .. } if command.return_path.as_deref() == Some("spam@example.com") => {
//!             Err(Veto::new("sender blocked"))
//!         }
//!         _ => Ok(()),
//!     });
//!
//!     session.start().await?;
//!     session.ehlo("client.example.com").await?;
//!     session.starttls().await?;
//!     session.ehlo("client.example.com").await?;
//!
//!     session.command(Command::mail_from("sender@example.com"), CommandOptions::default(), None).await?;
//!     session.command("RCPT TO:<recipient@example.com>", CommandOptions::default(), None).await?;
//!     session.data(&b"Subject: Test\r\n\r\nHello, World!\r\n"[..], None).await?;
//!
//!     session.quit().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Session Stages
//!
//! ```text
//! Idle ──start()──→ Connecting ──greeting──→ Connected ⇄ SendingCommand → AwaitingReply
//!                                               │
//!                                               ├── end()/quit() ──→ Ended
//!                                               └── failure/veto ──→ Aborted
//! ```
//!
//! ## Modules
//!
//! - [`line`]: line framing primitive
//! - [`command`]: command line parser and serializer
//! - [`parser`]: reply parser, streaming reader and serializer
//! - [`codec`]: dot-stuffing encoder and decoder
//! - [`connection`]: configuration, transports, observers and the session
//! - [`types`]: replies, reply codes and extensions

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod command;
pub mod connection;
mod error;
pub mod line;
pub mod parser;
pub mod types;

pub use codec::{DataOptions, DotDecoder, DotEncoder};
pub use command::{Command, Param, parse_command_line, serialize_command};
pub use connection::{
    Channel, CommandOptions, Connector, Event, Observer, Security, Session, SessionConfig,
    SessionState, Stage, TcpConnector,
};
pub use error::{Abort, Error, Result, Veto};
pub use line::LineOptions;
pub use parser::{parse_reply, parse_reply_line, read_reply, serialize_reply};
pub use types::{Extension, Reply, ReplyCode, ReplyLine};
