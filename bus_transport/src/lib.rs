//! Message bus transports.
//!
//! A [`Transport`] carries the messages of one connection over a byte stream. It
//! runs a short authentication conversation with the peer, splits the incoming
//! stream into NUL-terminated [`Message`]s and writes the connection's outgoing
//! queue back out. The concrete channel lives behind the [`TransportBackend`]
//! trait; [`Transport::from_stream`] builds one over a unix or tcp socket.
//!
//! A transport is driven by its connection, through the callbacks of
//! [`ConnectionHandler`]. [`BusConnection`] is a ready made single threaded
//! connection.
//!
//! ```rust,no_run
//! # use bus_transport::{BusConnection, Message, TransportConfig};
//! # fn main() -> bus_transport::Result<()> {
//! let connection = BusConnection::open("unix:/run/example.sock", TransportConfig::default())?;
//! connection.block_until_authenticated(5000)?;
//! connection.send(Message::from_json(&serde_json::json!({ "ping": "hello" }))?)?;
//! connection.flush(5000)?;
//!
//! while connection.read_write_dispatch(5000)? {
//!     if let Some(reply) = connection.pop_message() {
//!         println!("{}", String::from_utf8_lossy(reply.body()));
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Serving is the mirror image, using a [`Listener`]:
//!
//! ```rust,no_run
//! # use bus_transport::{BusConnection, Listener, TransportConfig};
//! # fn main() -> bus_transport::Result<()> {
//! let config = TransportConfig::default();
//! let listener = Listener::new("unix:/run/example.sock")?;
//! let connection = BusConnection::from_transport(listener.accept(0, &config)?)?;
//!
//! while connection.read_write_dispatch(-1)? {
//!     while let Some(message) = connection.pop_message() {
//!         connection.send(message)?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

mod auth;
mod config;
mod connection;
mod error;
pub mod loader;
mod server;
mod socket;
mod stream;
mod transport;
mod watch;

pub use crate::auth::{Auth, AuthState, Role};
pub use crate::config::TransportConfig;
pub use crate::connection::{BusConnection, ConnectionHandler};
pub use crate::error::{Error, Result};
pub use crate::loader::{Message, MessageLoader};
pub use crate::server::{Listener, ACTIVATION_FD_NAME};
pub use crate::socket::SocketBackend;
pub use crate::stream::{connect, Stream};
pub use crate::transport::{IterationFlags, LinkState, Transport, TransportBackend, TransportCore};
pub use crate::watch::{Watch, WatchFlags};
