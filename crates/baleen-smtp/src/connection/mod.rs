//! SMTP client sessions.
//!
//! [`Session`] drives one connection through greeting, command/reply
//! cycles, `STARTTLS`, `DATA` and shutdown. Transports come from a
//! [`Connector`]; [`TcpConnector`] is the default.

mod config;
mod observer;
mod session;
mod stream;

pub use config::{Security, SessionConfig, SessionConfigBuilder};
pub use observer::{
    Channel, CommandOptions, ConnectInfo, Event, Observer, ObserverFuture, Observers,
};
pub use session::{CommandInput, ConnectDetails, Session, SessionState, Stage};
pub use stream::{Connector, SmtpStream, TcpConnector};
