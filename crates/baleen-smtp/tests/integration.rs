//! Integration tests for the SMTP client.
//!
//! These tests run a session against a scripted in-memory server that
//! answers each command line with the next canned reply.

#![allow(clippy::unwrap_used, clippy::needless_collect, clippy::similar_names)]

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use bytes::BytesMut;
use proptest::prelude::*;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use baleen_smtp::codec::Decoded;
use baleen_smtp::connection::{ConnectInfo, Connector};
use baleen_smtp::{
    Channel, Command, CommandOptions, DotDecoder, DotEncoder, Error, Event, Param, Reply,
    ReplyCode, Security, Session, SessionConfig, Stage, parse_command_line, parse_reply,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// In-memory server: releases one reply per command line it receives.
struct ScriptedServer {
    replies: VecDeque<Vec<u8>>,
    ready: usize,
    line: Vec<u8>,
    in_data: bool,
    sent: Arc<Mutex<Vec<u8>>>,
    waker: Option<Waker>,
}

impl ScriptedServer {
    fn new(replies: &[&str]) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let server = Self {
            replies: replies.iter().map(|r| r.as_bytes().to_vec()).collect(),
            ready: 1,
            line: Vec::new(),
            in_data: false,
            sent: Arc::clone(&sent),
            waker: None,
        };
        (server, sent)
    }

    fn line_complete(&mut self) {
        let line = std::mem::take(&mut self.line);
        if self.in_data {
            if line == b".\r\n" {
                self.in_data = false;
                self.ready += 1;
            }
            return;
        }

        if line.eq_ignore_ascii_case(b"DATA\r\n") {
            self.in_data = self.replies.front().is_some_and(|r| r.starts_with(b"354"));
        }
        self.ready += 1;
    }
}

impl AsyncRead for ScriptedServer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.replies.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if self.ready == 0 {
            self.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let reply = self.replies.pop_front().unwrap();
        self.ready -= 1;
        buf.put_slice(&reply);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ScriptedServer {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.sent.lock().unwrap().extend_from_slice(buf);
        for &b in buf {
            self.line.push(b);
            if self.line.ends_with(b"\r\n") {
                self.line_complete();
            }
        }
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

struct ScriptedConnector {
    server: Mutex<Option<ScriptedServer>>,
}

impl Connector for ScriptedConnector {
    type Stream = ScriptedServer;

    fn connect(&self, _info: &ConnectInfo) -> impl Future<Output = baleen_smtp::Result<ScriptedServer>> + Send {
        let server = self.server.lock().unwrap().take().ok_or_else(|| {
            Error::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "already connected"))
        });
        std::future::ready(server)
    }

    fn upgrade(
        &self,
        stream: ScriptedServer,
        _hostname: &str,
    ) -> impl Future<Output = baleen_smtp::Result<ScriptedServer>> + Send {
        std::future::ready(Ok(stream))
    }
}

fn scripted_session(replies: &[&str]) -> (Session<ScriptedConnector>, Arc<Mutex<Vec<u8>>>) {
    let (server, sent) = ScriptedServer::new(replies);
    let config = SessionConfig::from_uri("smtp://mx.example.com").unwrap();
    let connector = ScriptedConnector {
        server: Mutex::new(Some(server)),
    };
    (Session::with_connector(config, connector), sent)
}

fn record_events(session: &mut Session<ScriptedConnector>) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for channel in [
        Channel::Connect,
        Channel::Command,
        Channel::Reply,
        Channel::End,
        Channel::Error,
    ] {
        let log = Arc::clone(&log);
        session.on(channel, move |event: &mut Event| {
            let entry = match event {
                Event::Connect(info) => format!("connect {}:{}", info.hostname, info.port),
                Event::Command { command, .. } => format!("command {command}"),
                Event::Reply(reply) => format!("reply {}", reply.code),
                Event::End => "end".to_string(),
                Event::Error(abort) => format!("error {}", abort.stage),
            };
            log.lock().unwrap().push(entry);
            Ok(())
        });
    }
    log
}

#[tokio::test]
async fn test_full_transaction() {
    init_tracing();
    let (mut session, sent) = scripted_session(&[
        "220 mx.example.com ESMTP\r\n",
        "250-mx.example.com\r\n250-PIPELINING\r\n250 8BITMIME\r\n",
        "250 2.1.0 Ok\r\n",
        "250 2.1.5 Ok\r\n",
        "354 End data with <CR><LF>.<CR><LF>\r\n",
        "250 2.0.0 Ok: queued\r\n",
        "221 2.0.0 Bye\r\n",
    ]);
    let log = record_events(&mut session);

    session.start().await.unwrap();
    session.ehlo("client.example.com").await.unwrap();
    assert_eq!(session.state().extensions.len(), 2);

    let mail = Command::mail_from("alice@example.com")
        .with_param(Param::Pair("BODY".to_string(), "8BITMIME".to_string()));
    session
        .command(mail, CommandOptions::default(), None)
        .await
        .unwrap();
    session
        .command("RCPT TO:<bob@example.org>", CommandOptions::default(), None)
        .await
        .unwrap();

    let body: &[u8] = b"Subject: greetings\n\n.signature\n";
    let queued = session.data(body, None).await.unwrap();
    assert_eq!(queued.message, "2.0.0 Ok: queued");

    let bye = session.quit().await.unwrap();
    assert_eq!(bye.code, ReplyCode::CLOSING);
    assert_eq!(session.state().stage, Stage::Ended);

    let transcript = String::from_utf8(sent.lock().unwrap().clone()).unwrap();
    assert_eq!(
        transcript,
        "EHLO client.example.com\r\n\
         MAIL FROM:<alice@example.com> BODY=8BITMIME\r\n\
         RCPT TO:<bob@example.org>\r\n\
         DATA\r\n\
         Subject: greetings\r\n\r\n..signature\r\n.\r\n\
         QUIT\r\n"
    );

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "connect mx.example.com:25",
            "reply 220",
            "command EHLO client.example.com",
            "reply 250",
            "command MAIL FROM:<alice@example.com> BODY=8BITMIME",
            "reply 250",
            "command RCPT TO:<bob@example.org>",
            "reply 250",
            "command DATA",
            "reply 354",
            "reply 250",
            "command QUIT",
            "reply 221",
            "end",
        ]
    );
}

#[tokio::test]
async fn test_server_hangs_up_mid_reply() {
    init_tracing();
    let (mut session, _sent) = scripted_session(&[
        "220 mx.example.com ESMTP\r\n",
        "250-mx.example.com\r\n",
    ]);
    let log = record_events(&mut session);

    session.start().await.unwrap();
    let result = session.ehlo("client.example.com").await;

    let Err(Error::Aborted(abort)) = result else {
        panic!("expected abort, got {result:?}");
    };
    assert!(matches!(abort.cause, Error::PrematureEnd));
    assert_eq!(abort.peer, "mx.example.com:25");
    assert_eq!(session.state().stage, Stage::Aborted);
    assert_eq!(log.lock().unwrap().last().unwrap(), "error awaiting reply");

    session.end().await;
    assert_eq!(log.lock().unwrap().last().unwrap(), "error awaiting reply");
}

#[tokio::test]
async fn test_transient_rejection_is_returned() {
    init_tracing();
    let (mut session, _sent) = scripted_session(&[
        "220 mx.example.com ESMTP\r\n",
        "250 2.1.0 Ok\r\n",
        "450 4.2.0 <bob@example.org>: Recipient address rejected: Greylisted\r\n",
        "250 2.0.0 Ok\r\n",
    ]);

    session.start().await.unwrap();
    session
        .command("MAIL FROM:<>", CommandOptions::default(), None)
        .await
        .unwrap();
    let reply = session
        .command("RCPT TO:<bob@example.org>", CommandOptions::default(), None)
        .await
        .unwrap();
    assert!(reply.is_transient_error());
    assert!(reply.into_error().is_transient());

    session
        .command(Command::rset(), CommandOptions::default(), None)
        .await
        .unwrap();
    assert!(!session.state().ended);
}

#[test]
fn test_transcript_serde() {
    let reply = parse_reply("250-mx.example.com\r\n250 SIZE 1000\r\n", 512).unwrap();
    let json = serde_json::to_string(&reply).unwrap();
    assert_eq!(serde_json::from_str::<Reply>(&json).unwrap(), reply);

    let command = parse_command_line("MAIL FROM:<a@b.c> SMTPUTF8", 512).unwrap();
    let json = serde_json::to_string(&command).unwrap();
    assert_eq!(serde_json::from_str::<Command>(&json).unwrap(), command);

    assert_eq!(serde_json::to_string(&Security::StartTls).unwrap(), "\"starttls\"");
}

fn encode(body: &[u8], chunk_sizes: &[usize]) -> Vec<u8> {
    let mut encoder = DotEncoder::new();
    let mut out = BytesMut::new();
    let mut rest = body;
    for &size in chunk_sizes.iter().cycle() {
        if rest.is_empty() {
            break;
        }
        let (chunk, tail) = rest.split_at(size.min(rest.len()));
        encoder.encode(chunk, &mut out);
        rest = tail;
    }
    encoder.finish(&mut out);
    out.to_vec()
}

fn decode(wire: &[u8], chunk_sizes: &[usize]) -> (Vec<u8>, usize) {
    let mut decoder = DotDecoder::new(1000);
    let mut out = BytesMut::new();
    let mut offset = 0;
    for &size in chunk_sizes.iter().cycle() {
        let end = (offset + size).min(wire.len());
        match decoder.decode(&wire[offset..end], &mut out).unwrap() {
            Decoded::NeedMore => offset = end,
            Decoded::Done { consumed } => return (out.to_vec(), offset + consumed),
        }
        assert!(offset < wire.len(), "ran out of input before end marker");
    }
    unreachable!()
}

proptest! {
    #[test]
    fn dot_codec_round_trip(
        lines in prop::collection::vec("[ -~]{0,80}", 0..20),
        encode_chunks in prop::collection::vec(1usize..64, 1..8),
        decode_chunks in prop::collection::vec(1usize..64, 1..8),
    ) {
        let body: String = lines.iter().map(|line| format!("{line}\r\n")).collect();
        let mut wire = encode(body.as_bytes(), &encode_chunks);
        let marker_end = wire.len();
        wire.extend_from_slice(b"NOOP\r\n");

        let (decoded, consumed) = decode(&wire, &decode_chunks);
        prop_assert_eq!(decoded, body.into_bytes());
        prop_assert_eq!(consumed, marker_end);
    }

    #[test]
    fn command_round_trip(
        local in "[a-z0-9.]{1,16}",
        domain in "[a-z]{1,12}\\.[a-z]{2,6}",
        params in prop::collection::vec(("[A-Z]{1,10}", proptest::option::of("[A-Za-z0-9]{1,12}")), 0..4),
    ) {
        let mut command = Command::mail_from(format!("{local}@{domain}"));
        for (key, value) in params {
            let param = match value {
                Some(value) => Param::Pair(key, value),
                None => Param::Flag(key),
            };
            command = command.with_param(param);
        }

        let line = command.serialize(512).unwrap();
        let parsed = parse_command_line(&line, 512).unwrap();
        prop_assert_eq!(parsed.serialize(512).unwrap(), line);
        prop_assert_eq!(parsed, command);
    }

    #[test]
    fn reply_round_trip(
        code in 200u16..600,
        lines in prop::collection::vec("[!-~]( ?[!-~]){0,20}", 1..6),
    ) {
        let reply = Reply::new(ReplyCode::new(code), lines.clone());
        let wire = reply.serialize(512).unwrap();
        let parsed = parse_reply(&wire, 512).unwrap();
        prop_assert_eq!(parsed.lines.len(), lines.len());
        prop_assert_eq!(parsed.serialize(512).unwrap(), wire);
    }
}
