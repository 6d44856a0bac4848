//! Client session state machine.
//!
//! A [`Session`] owns one transport and walks it through
//! connect, command/reply cycles and shutdown. Every step that moves the
//! session forward first passes a checkpoint where registered observers may
//! rewrite the payload or veto the step.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt, BufReader};

use super::config::SessionConfig;
use super::observer::{Channel, CommandOptions, ConnectInfo, Event, Observer, Observers};
use super::stream::{Connector, TcpConnector};
use crate::codec::write_data;
use crate::command::{Command, parse_command_line};
use crate::error::{Abort, Error, Result, Veto};
use crate::line::{LineOptions, with_timeout};
use crate::parser::read_reply;
use crate::types::{Extension, Reply, ReplyCode};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stage {
    /// Not started.
    #[default]
    Idle,
    /// Opening the transport or waiting for the greeting.
    Connecting,
    /// Ready for a command.
    Connected,
    /// Writing a command line.
    SendingCommand,
    /// Waiting for a reply.
    AwaitingReply,
    /// TLS handshake after `STARTTLS`.
    Upgrading,
    /// Streaming a message body.
    Data,
    /// Closed normally.
    Ended,
    /// Closed after a failure.
    Aborted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SendingCommand => "sending command",
            Self::AwaitingReply => "awaiting reply",
            Self::Upgrading => "upgrading to TLS",
            Self::Data => "sending data",
            Self::Ended => "ended",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Details recorded once the greeting has been read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectDetails {
    /// Hostname actually connected to.
    pub hostname: String,
    /// Port actually connected to.
    pub port: u16,
    /// True for implicit TLS.
    pub secure: bool,
    /// Server greeting.
    pub reply: Reply,
}

/// Observable session state.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    /// Current stage.
    pub stage: Stage,
    /// A transport is open and the greeting was read.
    pub connected: bool,
    /// The transport is encrypted.
    pub secure: bool,
    /// The session is over, normally or not.
    pub ended: bool,
    /// Set when the session aborted.
    pub error: Option<Arc<Abort>>,
    /// Connection details.
    pub connect: Option<ConnectDetails>,
    /// Last command issued.
    pub last_command: Option<Command>,
    /// Options of the last command.
    pub last_command_options: Option<CommandOptions>,
    /// Last reply received.
    pub last_reply: Option<Reply>,
    /// Extensions from the last successful EHLO.
    pub extensions: Vec<Extension>,
}

/// Command given either structured or as a raw line.
#[derive(Debug, Clone)]
pub enum CommandInput {
    /// Already structured.
    Command(Command),
    /// Raw line, parsed before sending.
    Line(String),
}

impl From<Command> for CommandInput {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<String> for CommandInput {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<&str> for CommandInput {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

/// SMTP client session.
pub struct Session<C: Connector = TcpConnector> {
    config: SessionConfig,
    connector: C,
    observers: Observers,
    stream: Option<BufReader<C::Stream>>,
    state: SessionState,
}

impl<C: Connector> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer())
            .field("state", &self.state)
            .field("observers", &self.observers)
            .finish_non_exhaustive()
    }
}

impl Session<TcpConnector> {
    /// Creates a session over TCP.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self::with_connector(config, TcpConnector::new())
    }
}

impl<C: Connector> Session<C> {
    /// Creates a session over a custom transport.
    #[must_use]
    pub fn with_connector(config: SessionConfig, connector: C) -> Self {
        Self {
            config,
            connector,
            observers: Observers::new(),
            stream: None,
            state: SessionState::default(),
        }
    }

    /// Registers a synchronous observer.
    pub fn on<F>(&mut self, channel: Channel, observer: F)
    where
        F: Fn(&mut Event) -> std::result::Result<(), Veto> + Send + Sync + 'static,
    {
        self.observers.on(channel, observer);
    }

    /// Registers an asynchronous observer.
    pub fn observe(&mut self, channel: Channel, observer: impl Observer + 'static) {
        self.observers.observe(channel, observer);
    }

    /// Returns the session state.
    #[must_use]
    pub const fn state(&self) -> &SessionState {
        &self.state
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns `host:port` of the connected (or configured) endpoint.
    #[must_use]
    pub fn peer(&self) -> String {
        self.state.connect.as_ref().map_or_else(
            || self.config.peer(),
            |details| format!("{}:{}", details.hostname, details.port),
        )
    }

    /// Returns true if the server advertised `extension` in its last EHLO reply.
    #[must_use]
    pub fn supports(&self, extension: &Extension) -> bool {
        self.state.extensions.contains(extension)
    }

    /// Connects and reads the greeting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if a transport is already open and
    /// [`Error::Aborted`] if connecting, reading the greeting or a
    /// checkpoint fails.
    pub async fn start(&mut self) -> Result<Reply> {
        if self.stream.is_some() {
            return Err(Error::InvalidState("session already started".to_string()));
        }
        self.state = SessionState::default();
        self.set_stage(Stage::Connecting);

        let mut event = Event::Connect(ConnectInfo {
            hostname: self.config.host.clone(),
            port: self.config.port,
            security: self.config.security,
        });
        let checked = self.observers.checkpoint(&mut event, self.config.veto_timeout).await;
        self.or_abort(checked).await?;
        let Event::Connect(info) = event else {
            return Err(self.replaced_payload(Channel::Connect).await);
        };

        let connected = with_timeout(
            Some(self.config.connect_timeout),
            self.connector.connect(&info),
        )
        .await;
        let stream = self.or_abort(connected).await?;
        self.stream = Some(BufReader::new(stream));

        let reply_options = self.config.reply;
        let greeting = self.receive_reply(&reply_options).await;
        let greeting = self.or_abort(greeting).await?;

        let secure = info.security.is_implicit();
        self.state.connected = true;
        self.state.secure = secure;
        self.state.connect = Some(ConnectDetails {
            hostname: info.hostname,
            port: info.port,
            secure,
            reply: greeting.clone(),
        });
        tracing::debug!(peer = %self.peer(), secure, code = greeting.code.as_u16(), "greeting received");

        let greeting = self.reply_checkpoint(greeting, self.config.veto_timeout).await?;
        self.set_stage(Stage::Connected);
        Ok(greeting)
    }

    /// Sends one command and reads its reply.
    ///
    /// `timeout` overrides the checkpoint deadline for this command.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] before `start` or after the session
    /// ended, parse errors for a malformed raw line (the session stays
    /// usable), and [`Error::Aborted`] for transport, reply or checkpoint
    /// failures.
    pub async fn command(
        &mut self,
        input: impl Into<CommandInput>,
        options: CommandOptions,
        timeout: Option<Duration>,
    ) -> Result<Reply> {
        self.ensure_connected()?;
        let max_line_length = self.config.reply.max_line_length;
        let command = match input.into() {
            CommandInput::Command(command) => command,
            CommandInput::Line(line) => parse_command_line(&line, max_line_length)?,
        };
        let deadline = timeout.unwrap_or(self.config.veto_timeout);

        self.state.last_command = Some(command.clone());
        self.state.last_command_options = Some(options.clone());

        let mut event = Event::Command { command, options };
        let checked = self.observers.checkpoint(&mut event, deadline).await;
        self.or_abort(checked).await?;
        let Event::Command { command, options } = event else {
            return Err(self.replaced_payload(Channel::Command).await);
        };

        let line = command.serialize(max_line_length)?;
        self.state.last_command = Some(command);
        self.state.last_command_options = Some(options.clone());

        self.set_stage(Stage::SendingCommand);
        let sent = self.send_line(&line).await;
        self.or_abort(sent).await?;

        let reply_options = options.reply.unwrap_or(self.config.reply);
        let reply = self.receive_reply(&reply_options).await;
        let reply = self.or_abort(reply).await?;

        let reply = self.reply_checkpoint(reply, deadline).await?;
        self.set_stage(Stage::Connected);
        Ok(reply)
    }

    /// Sends `EHLO` and records the advertised extensions.
    ///
    /// # Errors
    ///
    /// As [`command`](Self::command); a non-2xx reply becomes [`Error::Smtp`].
    pub async fn ehlo(&mut self, domain: impl Into<String>) -> Result<Reply> {
        let reply = self
            .command(Command::ehlo(domain), CommandOptions::default(), None)
            .await?;
        if !reply.is_success() {
            return Err(reply.into_error());
        }

        self.state.extensions = reply.extensions();
        tracing::debug!(count = self.state.extensions.len(), "extensions recorded");
        Ok(reply)
    }

    /// Upgrades the connection with `STARTTLS`.
    ///
    /// Extensions are cleared afterwards; send `EHLO` again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] on an encrypted connection,
    /// [`Error::NotSupported`] without an advertised `STARTTLS`,
    /// [`Error::Smtp`] if the server declines, and [`Error::Aborted`] if
    /// the handshake fails.
    pub async fn starttls(&mut self) -> Result<Reply> {
        self.ensure_connected()?;
        if self.state.secure {
            return Err(Error::InvalidState("connection is already TLS".to_string()));
        }
        if !self.supports(&Extension::StartTls) {
            return Err(Error::NotSupported("STARTTLS".to_string()));
        }

        let reply = self
            .command(Command::starttls(), CommandOptions::default(), None)
            .await?;
        if reply.code != ReplyCode::SERVICE_READY {
            return Err(reply.into_error());
        }

        self.set_stage(Stage::Upgrading);
        let Some(reader) = self.stream.take() else {
            return Err(self.abort(Error::NotConnected).await);
        };

        let hostname = self
            .state
            .connect
            .as_ref()
            .map_or_else(|| self.config.host.clone(), |details| details.hostname.clone());
        let upgraded = with_timeout(
            Some(self.config.connect_timeout),
            self.connector.upgrade(reader.into_inner(), &hostname),
        )
        .await;
        let stream = self.or_abort(upgraded).await?;

        self.stream = Some(BufReader::new(stream));
        self.state.secure = true;
        self.state.extensions.clear();
        self.set_stage(Stage::Connected);
        tracing::debug!(%hostname, "connection upgraded");
        Ok(reply)
    }

    /// Sends `DATA`, streams `body` with dot-stuffing and reads the final reply.
    ///
    /// # Errors
    ///
    /// A reply other than 354 to `DATA`, or a non-2xx final reply, becomes
    /// [`Error::Smtp`]. Write, read and checkpoint failures abort.
    pub async fn data<R>(&mut self, mut body: R, timeout: Option<Duration>) -> Result<Reply>
    where
        R: AsyncRead + Unpin,
    {
        let reply = self
            .command(Command::data(), CommandOptions::default(), timeout)
            .await?;
        if reply.code != ReplyCode::START_DATA {
            return Err(reply.into_error());
        }

        self.set_stage(Stage::Data);
        let data_options = self.config.data;
        let written = match self.stream.as_mut() {
            Some(reader) => write_data(&mut body, reader.get_mut(), &data_options).await,
            None => Err(Error::NotConnected),
        };
        self.or_abort(written).await?;

        let reply_options = self.config.reply;
        let reply = self.receive_reply(&reply_options).await;
        let reply = self.or_abort(reply).await?;
        let reply = self
            .reply_checkpoint(reply, timeout.unwrap_or(self.config.veto_timeout))
            .await?;
        self.set_stage(Stage::Connected);

        if !reply.is_success() {
            return Err(reply.into_error());
        }
        Ok(reply)
    }

    /// Sends `QUIT` and ends the session.
    ///
    /// # Errors
    ///
    /// As [`command`](Self::command).
    pub async fn quit(&mut self) -> Result<Reply> {
        let reply = self
            .command(Command::quit(), CommandOptions::default(), None)
            .await?;
        self.end().await;
        Ok(reply)
    }

    /// Ends the session and closes the transport. Repeated calls do nothing.
    pub async fn end(&mut self) {
        if self.state.ended {
            return;
        }
        self.state.ended = true;
        self.set_stage(Stage::Ended);
        self.close().await;
        self.observers.notify(Event::End, self.config.veto_timeout).await;
    }

    /// Aborts the session with `cause`.
    ///
    /// Records the failure, closes the transport and notifies observers on
    /// [`Channel::Error`]. Returns the [`Error::Aborted`] to hand to the
    /// caller. On a session that already ended, `cause` is returned as is.
    pub async fn abort(&mut self, cause: Error) -> Error {
        if self.state.ended {
            return cause;
        }

        let abort = Arc::new(Abort {
            peer: self.peer(),
            stage: self.state.stage,
            cause,
        });
        tracing::warn!(peer = %abort.peer, stage = %abort.stage, cause = %abort.cause, "session aborted");

        self.state.ended = true;
        self.state.error = Some(Arc::clone(&abort));
        self.set_stage(Stage::Aborted);
        self.close().await;
        self.observers
            .notify(Event::Error(Arc::clone(&abort)), self.config.veto_timeout)
            .await;

        Error::Aborted(abort)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.ended || !self.state.connected || self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(())
    }

    fn set_stage(&mut self, stage: Stage) {
        tracing::debug!(from = %self.state.stage, to = %stage, "stage");
        self.state.stage = stage;
    }

    async fn or_abort<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.abort(e).await),
        }
    }

    async fn replaced_payload(&mut self, channel: Channel) -> Error {
        let cause = Error::InvalidState(format!("{channel:?} observer replaced the event"));
        self.abort(cause).await
    }

    async fn reply_checkpoint(&mut self, reply: Reply, deadline: Duration) -> Result<Reply> {
        let mut event = Event::Reply(reply);
        let checked = self.observers.checkpoint(&mut event, deadline).await;
        self.or_abort(checked).await?;
        match event {
            Event::Reply(reply) => Ok(reply),
            _ => Err(self.replaced_payload(Channel::Reply).await),
        }
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let timeout = self.config.write_timeout;
        let reader = self.stream.as_mut().ok_or(Error::NotConnected)?;
        tracing::trace!(line = line.trim_end(), "command sent");

        with_timeout(timeout, async {
            let stream = reader.get_mut();
            stream.write_all(line.as_bytes()).await?;
            stream.flush().await?;
            Ok::<(), Error>(())
        })
        .await
    }

    async fn receive_reply(&mut self, options: &LineOptions) -> Result<Reply> {
        self.set_stage(Stage::AwaitingReply);
        let reader = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let reply = read_reply(reader, options).await?;
        self.state.last_reply = Some(reply.clone());
        Ok(reply)
    }

    async fn close(&mut self) {
        self.state.connected = false;
        if let Some(mut reader) = self.stream.take() {
            let closed = with_timeout(self.config.write_timeout, async {
                reader.get_mut().shutdown().await.map_err(Error::from)
            })
            .await;
            if let Err(e) = closed {
                tracing::debug!(?e, "transport close failed");
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
    use crate::command::Param;
    use crate::connection::{ObserverFuture, Security};
    use std::collections::VecDeque;
    use std::future::Future;
    use std::io;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_test::io::{Builder, Mock};

    /// Hands out scripted streams, one per connect or upgrade.
    struct ScriptedConnector {
        streams: Mutex<VecDeque<Mock>>,
        requests: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(streams: impl IntoIterator<Item = Mock>) -> Self {
            Self {
                streams: Mutex::new(streams.into_iter().collect()),
                requests: AtomicUsize::new(0),
            }
        }

        fn next(&self) -> Result<Mock> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.streams.lock().unwrap().pop_front().ok_or_else(|| {
                Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "no script"))
            })
        }
    }

    impl Connector for ScriptedConnector {
        type Stream = Mock;

        fn connect(&self, _info: &ConnectInfo) -> impl Future<Output = Result<Mock>> + Send {
            std::future::ready(self.next())
        }

        fn upgrade(&self, stream: Mock, _hostname: &str) -> impl Future<Output = Result<Mock>> + Send {
            drop(stream);
            std::future::ready(self.next())
        }
    }

    struct Stalled {
        finished: Arc<AtomicBool>,
    }

    impl Observer for Stalled {
        fn observe<'a>(&'a self, _event: &'a mut Event) -> ObserverFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn session(streams: impl IntoIterator<Item = Mock>) -> Session<ScriptedConnector> {
        let config = SessionConfig::builder("mx.example.com")
            .security(Security::StartTls)
            .build();
        Session::with_connector(config, ScriptedConnector::new(streams))
    }

    fn count_on(session: &mut Session<ScriptedConnector>, channel: Channel) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        session.on(channel, move |_event: &mut Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[tokio::test]
    async fn test_start_records_greeting() {
        let mock = Builder::new().read(b"220 mx.example.com ESMTP\r\n").build();
        let mut session = session([mock]);

        let greeting = session.start().await.unwrap();
        assert_eq!(greeting.code, ReplyCode::SERVICE_READY);

        let state = session.state();
        assert!(state.connected);
        assert!(!state.secure);
        assert_eq!(state.stage, Stage::Connected);
        let details = state.connect.as_ref().unwrap();
        assert_eq!(details.hostname, "mx.example.com");
        assert_eq!(details.port, 25);
        assert_eq!(details.reply.message, "mx.example.com ESMTP");
    }

    #[tokio::test]
    async fn test_connect_observer_rewrites_target() {
        let mock = Builder::new().read(b"220 relay ready\r\n").build();
        let mut session = session([mock]);
        session.on(Channel::Connect, |event: &mut Event| {
            if let Event::Connect(info) = event {
                info.hostname = "relay.example.net".to_string();
                info.port = 2525;
            }
            Ok(())
        });

        session.start().await.unwrap();
        assert_eq!(session.peer(), "relay.example.net:2525");
    }

    #[tokio::test]
    async fn test_connect_veto_aborts_before_connecting() {
        let mut session = session(Vec::new());
        let errors = count_on(&mut session, Channel::Error);
        session.on(Channel::Connect, |event: &mut Event| match event {
            Event::Connect(info) if info.hostname == "mx.example.com" => {
                Err(Veto::new("destination not allowed"))
            }
            _ => Ok(()),
        });

        let result = session.start().await;

        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort, got {result:?}");
        };
        assert!(matches!(&abort.cause, Error::Veto(v) if v.reason() == "destination not allowed"));
        assert_eq!(abort.stage, Stage::Connecting);
        assert_eq!(session.connector.requests.load(Ordering::SeqCst), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!session.state().connected);
        assert_eq!(session.state().stage, Stage::Aborted);
    }

    #[tokio::test]
    async fn test_command_runs_observers_in_order() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"NOOP\r\n")
            .read(b"250 OK\r\n")
            .build();
        let mut session = session([mock]);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = Arc::clone(&order);
            session.on(Channel::Command, move |_event: &mut Event| {
                order.lock().unwrap().push(i);
                Ok(())
            });
        }

        session.start().await.unwrap();
        let reply = session
            .command(Command::noop(), CommandOptions::default(), None)
            .await
            .unwrap();
        assert!(reply.is_success());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(session.state().last_reply.as_ref(), Some(&reply));
    }

    #[tokio::test]
    async fn test_command_veto_aborts() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut session = session([mock]);
        let errors = count_on(&mut session, Channel::Error);
        session.on(Channel::Command, |_event: &mut Event| Ok(()));
        session.on(Channel::Command, |event: &mut Event| match event {
            Event::Command { command, .. } if command.is("MAIL") => Err(Veto::new("sender blocked")),
            _ => Ok(()),
        });

        session.start().await.unwrap();
        let result = session
            .command("MAIL FROM:<spam@example.com>", CommandOptions::default(), None)
            .await;

        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort, got {result:?}");
        };
        assert!(matches!(&abort.cause, Error::Veto(v) if v.reason() == "sender blocked"));
        assert_eq!(abort.stage, Stage::Connected);
        assert!(session.state().ended);
        assert_eq!(session.state().stage, Stage::Aborted);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reply_veto_aborts_and_keeps_reply() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"RCPT TO:<nobody@example.com>\r\n")
            .read(b"550 no such user\r\n")
            .build();
        let mut session = session([mock]);
        let errors = count_on(&mut session, Channel::Error);
        session.on(Channel::Reply, |event: &mut Event| match event {
            Event::Reply(reply) if reply.is_permanent_error() => Err(Veto::new("recipient refused")),
            _ => Ok(()),
        });

        session.start().await.unwrap();
        let result = session
            .command(Command::rcpt_to("nobody@example.com"), CommandOptions::default(), None)
            .await;

        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort, got {result:?}");
        };
        assert!(matches!(&abort.cause, Error::Veto(v) if v.reason() == "recipient refused"));
        assert_eq!(abort.stage, Stage::AwaitingReply);
        let last_reply = session.state().last_reply.as_ref().unwrap();
        assert_eq!(last_reply.code, ReplyCode::MAILBOX_UNAVAILABLE);
        assert_eq!(session.state().stage, Stage::Aborted);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_command_with_line_break_is_not_sent() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"NOOP\r\n")
            .read(b"250 OK\r\n")
            .build();
        let mut session = session([mock]);

        session.start().await.unwrap();
        let result = session
            .command(
                Command::ehlo("a.example\r\nRCPT TO:<evil@x>"),
                CommandOptions::default(),
                None,
            )
            .await;
        assert!(matches!(result, Err(Error::Framing { .. })));
        assert!(!session.state().ended);

        let reply = session
            .command(Command::noop(), CommandOptions::default(), None)
            .await
            .unwrap();
        assert!(reply.is_success());
    }

    #[tokio::test]
    async fn test_rewritten_command_with_line_break_is_not_sent() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"RSET\r\n")
            .read(b"250 flushed\r\n")
            .build();
        let mut session = session([mock]);
        session.on(Channel::Command, |event: &mut Event| {
            if let Event::Command { command, .. } = event {
                if command.is("NOOP") {
                    command.params.push(Param::Flag("X\r\nQUIT".to_string()));
                }
            }
            Ok(())
        });

        session.start().await.unwrap();
        let result = session
            .command(Command::noop(), CommandOptions::default(), None)
            .await;
        assert!(matches!(result, Err(Error::Framing { .. })));
        assert!(!session.state().ended);

        session
            .command(Command::rset(), CommandOptions::default(), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_command_observer_rewrites_command() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"RSET\r\n")
            .read(b"250 flushed\r\n")
            .build();
        let mut session = session([mock]);
        session.on(Channel::Command, |event: &mut Event| {
            if let Event::Command { command, .. } = event {
                *command = Command::rset();
            }
            Ok(())
        });

        session.start().await.unwrap();
        session
            .command(Command::noop(), CommandOptions::default(), None)
            .await
            .unwrap();
        assert!(session.state().last_command.as_ref().unwrap().is("RSET"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_timeout_aborts() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut session = session([mock]);
        let finished = Arc::new(AtomicBool::new(false));
        session.observe(
            Channel::Command,
            Stalled {
                finished: Arc::clone(&finished),
            },
        );

        session.start().await.unwrap();
        let result = session
            .command(Command::noop(), CommandOptions::default(), Some(Duration::from_millis(100)))
            .await;
        assert!(matches!(
            result,
            Err(Error::Aborted(ref abort)) if matches!(abort.cause, Error::VetoTimeout(_))
        ));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
        assert!(matches!(
            session.command(Command::noop(), CommandOptions::default(), None).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_greeting_veto_aborts_connected_session() {
        let mock = Builder::new().read(b"554 go away\r\n").build();
        let mut session = session([mock]);
        session.on(Channel::Reply, |event: &mut Event| match event {
            Event::Reply(reply) if reply.is_permanent_error() => Err(Veto::new("rejected")),
            _ => Ok(()),
        });

        let result = session.start().await;
        assert!(matches!(result, Err(Error::Aborted(_))));
        assert!(!session.state().connected);
        assert!(session.state().connect.is_some());
    }

    #[tokio::test]
    async fn test_raw_line_parse_error_does_not_abort() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"NOOP\r\n")
            .read(b"250 OK\r\n")
            .build();
        let mut session = session([mock]);

        session.start().await.unwrap();
        let result = session.command("RCPT TO:", CommandOptions::default(), None).await;
        assert!(matches!(result, Err(Error::MissingArgument { .. })));
        assert!(!session.state().ended);

        session.command("NOOP", CommandOptions::default(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_reply_parse_error_aborts() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"NOOP\r\n")
            .read(b"hello\r\n")
            .build();
        let mut session = session([mock]);

        session.start().await.unwrap();
        let result = session.command(Command::noop(), CommandOptions::default(), None).await;
        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort");
        };
        assert_eq!(abort.stage, Stage::AwaitingReply);
        assert!(matches!(abort.cause, Error::InvalidReplyLine(_)));
    }

    #[tokio::test]
    async fn test_command_before_start() {
        let mut session = session(Vec::new());
        let result = session.command(Command::noop(), CommandOptions::default(), None).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_connect_failure_aborts() {
        let mut session = session(Vec::new());
        let result = session.start().await;
        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort");
        };
        assert_eq!(abort.stage, Stage::Connecting);
        assert_eq!(abort.peer, "mx.example.com:25");
    }

    #[tokio::test]
    async fn test_end_is_idempotent() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut session = session([mock]);
        let ends = count_on(&mut session, Channel::End);
        let errors = count_on(&mut session, Channel::Error);

        session.start().await.unwrap();
        session.end().await;
        session.end().await;
        let returned = session.abort(Error::PrematureEnd).await;

        assert!(matches!(returned, Error::PrematureEnd));
        assert_eq!(ends.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(session.state().stage, Stage::Ended);
        assert!(session.state().error.is_none());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut session = session([mock]);
        let errors = count_on(&mut session, Channel::Error);

        session.start().await.unwrap();
        let first = session.abort(Error::PrematureEnd).await;
        let second = session.abort(Error::EmptyReply).await;

        assert!(matches!(first, Error::Aborted(_)));
        assert!(matches!(second, Error::EmptyReply));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(matches!(
            session.state().error.as_deref().map(|a| &a.cause),
            Some(Error::PrematureEnd)
        ));
    }

    #[tokio::test]
    async fn test_ehlo_and_starttls() {
        let plain = Builder::new()
            .read(b"220 mx.example.com ESMTP\r\n")
            .write(b"EHLO client.example.com\r\n")
            .read(b"250-mx.example.com\r\n250-SIZE 35882577\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"220 Ready to start TLS\r\n")
            .build();
        let tls = Builder::new()
            .write(b"EHLO client.example.com\r\n")
            .read(b"250-mx.example.com\r\n250 AUTH PLAIN\r\n")
            .build();
        let mut session = session([plain, tls]);

        session.start().await.unwrap();
        session.ehlo("client.example.com").await.unwrap();
        assert!(session.supports(&Extension::StartTls));
        assert!(session.supports(&Extension::Size(Some(35_882_577))));

        session.starttls().await.unwrap();
        assert!(session.state().secure);
        assert!(session.state().extensions.is_empty());

        session.ehlo("client.example.com").await.unwrap();
        assert!(session.supports(&Extension::Auth(vec!["PLAIN".to_string()])));
        assert!(matches!(session.starttls().await, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_starttls_rejects_plaintext_after_ready() {
        let plain = Builder::new()
            .read(b"220 mx.example.com ESMTP\r\n")
            .write(b"EHLO client.example.com\r\n")
            .read(b"250-mx.example.com\r\n250 STARTTLS\r\n")
            .write(b"STARTTLS\r\n")
            .read(b"220 Ready to start TLS\r\n250 injected\r\n")
            .build();
        let mut session = session([plain]);

        session.start().await.unwrap();
        session.ehlo("client.example.com").await.unwrap();
        let result = session.starttls().await;

        let Err(Error::Aborted(abort)) = result else {
            panic!("expected abort, got {result:?}");
        };
        assert!(matches!(abort.cause, Error::TrailingOverhead(14)));
        assert!(!session.state().secure);
        assert_eq!(session.connector.requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_starttls_requires_extension() {
        let mock = Builder::new().read(b"220 ready\r\n").build();
        let mut session = session([mock]);

        session.start().await.unwrap();
        assert!(matches!(session.starttls().await, Err(Error::NotSupported(_))));
        assert!(!session.state().ended);
    }

    #[tokio::test]
    async fn test_data_transaction_and_quit() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"DATA\r\n")
            .read(b"354 End data with <CR><LF>.<CR><LF>\r\n")
            .write(b"Subject: hi\r\n\r\n..leading dot\r\n")
            .write(b".\r\n")
            .read(b"250 2.0.0 queued as 4F2A\r\n")
            .write(b"QUIT\r\n")
            .read(b"221 bye\r\n")
            .build();
        let mut session = session([mock]);
        let ends = count_on(&mut session, Channel::End);

        session.start().await.unwrap();
        let body: &[u8] = b"Subject: hi\n\n.leading dot\n";
        let reply = session.data(body, None).await.unwrap();
        assert_eq!(reply.message, "2.0.0 queued as 4F2A");

        let reply = session.quit().await.unwrap();
        assert_eq!(reply.code, ReplyCode::CLOSING);
        assert!(session.state().ended);
        assert_eq!(ends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_data_rejected_keeps_session() {
        let mock = Builder::new()
            .read(b"220 ready\r\n")
            .write(b"DATA\r\n")
            .read(b"503 need RCPT first\r\n")
            .build();
        let mut session = session([mock]);

        session.start().await.unwrap();
        let body: &[u8] = b"ignored";
        let result = session.data(body, None).await;
        assert!(matches!(result, Err(Error::Smtp { code: 503, .. })));
        assert!(!session.state().ended);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::AwaitingReply.to_string(), "awaiting reply");
        assert_eq!(Stage::default(), Stage::Idle);
    }
}
