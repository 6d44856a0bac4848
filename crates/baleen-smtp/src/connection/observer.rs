//! Session observers and checkpoints.
//!
//! Observers are registered per [`Channel`]. At a checkpoint the session
//! hands the event to every observer of that channel, one at a time and in
//! registration order. An observer may rewrite the payload or return a
//! [`Veto`] to stop the session. The whole chain shares one deadline.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::config::Security;
use crate::command::Command;
use crate::error::{Abort, Error, Result, Veto};
use crate::line::LineOptions;
use crate::types::Reply;

/// Future returned by [`Observer::observe`].
pub type ObserverFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), Veto>> + Send + 'a>>;

/// Event names observers subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Before the transport is opened.
    Connect,
    /// Before a command is written.
    Command,
    /// After a reply has been read.
    Reply,
    /// The session ended normally.
    End,
    /// The session aborted.
    Error,
}

/// Where the session is about to connect. Observers may rewrite it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Server hostname, also used for TLS name verification.
    pub hostname: String,
    /// Server port.
    pub port: u16,
    /// Security mode.
    pub security: Security,
}

/// Per-command settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOptions {
    /// Reply limits for this command, overriding the session's.
    pub reply: Option<LineOptions>,
}

impl CommandOptions {
    /// Overrides reply line options for one command.
    #[must_use]
    pub const fn reply(mut self, options: LineOptions) -> Self {
        self.reply = Some(options);
        self
    }
}

/// Payload passed to observers.
#[derive(Debug, Clone)]
pub enum Event {
    /// Connection target.
    Connect(ConnectInfo),
    /// Command about to be sent.
    Command {
        /// The command; observers may replace it.
        command: Command,
        /// Options it was issued with.
        options: CommandOptions,
    },
    /// Reply just received.
    Reply(Reply),
    /// Session ended.
    End,
    /// Session aborted.
    Error(Arc<Abort>),
}

impl Event {
    /// Returns the channel this event is delivered on.
    #[must_use]
    pub const fn channel(&self) -> Channel {
        match self {
            Self::Connect(_) => Channel::Connect,
            Self::Command { .. } => Channel::Command,
            Self::Reply(_) => Channel::Reply,
            Self::End => Channel::End,
            Self::Error(_) => Channel::Error,
        }
    }
}

/// Asynchronous session observer.
///
/// Plain closures can be registered with [`Observers::on`]; implement this
/// trait when an observer needs to await something.
pub trait Observer: Send + Sync {
    /// Inspects (and possibly rewrites) an event.
    fn observe<'a>(&'a self, event: &'a mut Event) -> ObserverFuture<'a>;
}

struct FnObserver<F>(F);

impl<F> Observer for FnObserver<F>
where
    F: Fn(&mut Event) -> std::result::Result<(), Veto> + Send + Sync,
{
    fn observe<'a>(&'a self, event: &'a mut Event) -> ObserverFuture<'a> {
        Box::pin(std::future::ready((self.0)(event)))
    }
}

/// Registered observers, in registration order.
#[derive(Clone, Default)]
pub struct Observers {
    entries: Vec<(Channel, Arc<dyn Observer>)>,
}

impl fmt::Debug for Observers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.len())
            .finish()
    }
}

impl Observers {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a synchronous observer.
    pub fn on<F>(&mut self, channel: Channel, observer: F)
    where
        F: Fn(&mut Event) -> std::result::Result<(), Veto> + Send + Sync + 'static,
    {
        self.entries.push((channel, Arc::new(FnObserver(observer))));
    }

    /// Registers an asynchronous observer.
    pub fn observe(&mut self, channel: Channel, observer: impl Observer + 'static) {
        self.entries.push((channel, Arc::new(observer)));
    }

    /// Returns how many observers listen on `channel`.
    #[must_use]
    pub fn count(&self, channel: Channel) -> usize {
        self.entries.iter().filter(|(c, _)| *c == channel).count()
    }

    /// Runs the observer chain for `event`.
    ///
    /// A zero `deadline` disables the timer. When it expires the chain is
    /// dropped, so a lagging observer never resumes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Veto`] from the first vetoing observer or
    /// [`Error::VetoTimeout`] if the chain outlives `deadline`.
    pub async fn checkpoint(&self, event: &mut Event, deadline: Duration) -> Result<()> {
        let channel = event.channel();
        if self.count(channel) == 0 {
            return Ok(());
        }

        let chain = async {
            for (_, observer) in self.entries.iter().filter(|(c, _)| *c == channel) {
                observer.observe(event).await?;
            }
            Ok::<(), Veto>(())
        };

        let outcome = if deadline.is_zero() {
            chain.await
        } else {
            tokio::time::timeout(deadline, chain)
                .await
                .map_err(|_| Error::VetoTimeout(deadline))?
        };

        outcome.map_err(|veto| {
            tracing::warn!(?channel, reason = veto.reason(), "checkpoint vetoed");
            Error::Veto(veto)
        })
    }

    /// Delivers a notification; failures are logged and dropped.
    pub async fn notify(&self, mut event: Event, deadline: Duration) {
        let channel = event.channel();
        if let Err(e) = self.checkpoint(&mut event, deadline).await {
            tracing::warn!(?channel, ?e, "observer failed on notification");
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
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    const DEADLINE: Duration = Duration::from_secs(3);

    struct Sleepy {
        finished: Arc<AtomicBool>,
    }

    impl Observer for Sleepy {
        fn observe<'a>(&'a self, _event: &'a mut Event) -> ObserverFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                self.finished.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn noop_event() -> Event {
        Event::Command {
            command: Command::noop(),
            options: CommandOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_no_observers_proceeds() {
        let observers = Observers::new();
        let mut event = noop_event();
        assert!(observers.checkpoint(&mut event, DEADLINE).await.is_ok());
    }

    #[tokio::test]
    async fn test_observers_run_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut observers = Observers::new();
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            observers.on(Channel::Command, move |_event: &mut Event| {
                seen.lock().unwrap().push(i);
                Ok(())
            });
        }
        observers.on(Channel::Reply, |_event: &mut Event| Err(Veto::new("wrong channel")));

        let mut event = noop_event();
        observers.checkpoint(&mut event, DEADLINE).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_veto_stops_chain() {
        let reached = Arc::new(AtomicBool::new(false));
        let mut observers = Observers::new();
        observers.on(Channel::Command, |_event: &mut Event| Err(Veto::new("not today")));
        let flag = Arc::clone(&reached);
        observers.on(Channel::Command, move |_event: &mut Event| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });

        let mut event = noop_event();
        let result = observers.checkpoint(&mut event, DEADLINE).await;
        assert!(matches!(result, Err(Error::Veto(v)) if v.reason() == "not today"));
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_observer_rewrites_payload() {
        let mut observers = Observers::new();
        observers.on(Channel::Command, |event: &mut Event| {
            if let Event::Command { command, .. } = event {
                *command = Command::rset();
            }
            Ok(())
        });

        let mut event = noop_event();
        observers.checkpoint(&mut event, DEADLINE).await.unwrap();
        assert!(matches!(event, Event::Command { command, .. } if command.is("RSET")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_drops_late_observer() {
        let finished = Arc::new(AtomicBool::new(false));
        let mut observers = Observers::new();
        observers.observe(
            Channel::Command,
            Sleepy {
                finished: Arc::clone(&finished),
            },
        );

        let mut event = noop_event();
        let result = observers.checkpoint(&mut event, DEADLINE).await;
        assert!(matches!(result, Err(Error::VetoTimeout(d)) if d == DEADLINE));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
