//! The connection side of a transport.
//!
//! [`ConnectionHandler`] is what a transport calls back into. [`BusConnection`] is
//! a small single threaded connection built on it: it queues messages in both
//! directions, keeps the watch list, and drives the transport either through its
//! watches or through blocking iterations.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::loader::Message;
use crate::transport::{IterationFlags, Transport};
use crate::watch::{Watch, WatchFlags};

/// Callbacks a transport makes into its owning connection.
///
/// All of them may run while the transport is in the middle of an operation.
/// Implementations may call back into the transport. A `disconnect` issued from
/// here makes the transport report itself disconnected at once; the channel
/// itself closes, and a `messages_pending` reaches the backend, once the
/// operation returns.
pub trait ConnectionHandler {
    /// A fatal condition was detected. A disconnect follows.
    fn transport_error(&self, error: &Error);

    /// The transport went from connected to disconnected. Called once.
    fn transport_disconnected(&self);

    fn queue_received_message(&self, message: Message);

    /// Start watching `watch`. Returns `false` if the event loop refused it.
    fn add_watch(&self, watch: &Watch) -> bool;

    fn remove_watch(&self, watch: &Watch);

    /// `watch` was enabled or disabled.
    fn watch_toggled(&self, _watch: &Watch) {}

    /// The next message to send, left at the head of the queue.
    fn peek_outgoing(&self) -> Option<Message>;

    /// The message last returned by [`ConnectionHandler::peek_outgoing`] is
    /// completely written.
    fn message_sent(&self);
}

/// A connection owning one transport.
pub struct BusConnection {
    transport: Transport,
    outgoing: RefCell<VecDeque<Message>>,
    incoming: RefCell<VecDeque<Message>>,
    watches: RefCell<Vec<Watch>>,
    last_error: RefCell<Option<String>>,
    disconnected: Cell<bool>,
}

impl BusConnection {
    /// Connect to `address` as a client.
    pub fn open(address: &str, config: TransportConfig) -> Result<Rc<BusConnection>> {
        BusConnection::from_transport(Transport::open(address, config)?)
    }

    /// Take ownership of `transport` and bind to it.
    pub fn from_transport(transport: Transport) -> Result<Rc<BusConnection>> {
        let connection = Rc::new(BusConnection {
            transport,
            outgoing: RefCell::new(VecDeque::new()),
            incoming: RefCell::new(VecDeque::new()),
            watches: RefCell::new(Vec::new()),
            last_error: RefCell::new(None),
            disconnected: Cell::new(false),
        });

        let weak: Weak<BusConnection> = Rc::downgrade(&connection);
        connection.transport.set_connection(weak)?;
        Ok(connection)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.transport.is_authenticated()
    }

    /// The last error the transport reported.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.borrow().clone()
    }

    /// Queue `message` for sending.
    pub fn send(&self, message: Message) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::Disconnected);
        }

        let max = self.transport.core().config().max_message_size;
        if message.len() > max {
            return Err(Error::MessageTooLarge {
                size: message.len(),
                max,
            });
        }

        let queue_length = {
            let mut outgoing = self.outgoing.borrow_mut();
            outgoing.push_back(message);
            outgoing.len()
        };
        self.transport.messages_pending(queue_length);
        Ok(())
    }

    pub fn pop_message(&self) -> Option<Message> {
        self.incoming.borrow_mut().pop_front()
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.borrow().len()
    }

    /// Block until authenticated. A negative `timeout_ms` waits forever.
    pub fn block_until_authenticated(&self, timeout_ms: i32) -> Result<()> {
        let deadline = Deadline::new(timeout_ms);

        while !self.is_authenticated() {
            if !self.is_connected() {
                return Err(self.disconnect_error());
            }
            let remaining = deadline.remaining().ok_or(Error::Timeout)?;
            self.transport.do_iteration(
                IterationFlags::DO_READING | IterationFlags::DO_WRITING | IterationFlags::BLOCK,
                remaining,
            );
        }
        Ok(())
    }

    /// Block until every queued message is written.
    pub fn flush(&self, timeout_ms: i32) -> Result<()> {
        let deadline = Deadline::new(timeout_ms);

        while self.outgoing_len() > 0 {
            if !self.is_connected() {
                return Err(self.disconnect_error());
            }
            let remaining = deadline.remaining().ok_or(Error::Timeout)?;
            self.transport.do_iteration(
                IterationFlags::DO_READING | IterationFlags::DO_WRITING | IterationFlags::BLOCK,
                remaining,
            );
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` for the watches to become ready and let the
    /// transport handle them. Returns whether still connected.
    pub fn read_write_dispatch(&self, timeout_ms: i32) -> Result<bool> {
        if self.disconnected.get() || !self.is_connected() {
            return Ok(false);
        }

        let watches: Vec<(Watch, libc::pollfd)> = self
            .watches
            .borrow()
            .iter()
            .filter_map(|w| w.to_pollfd().map(|pfd| (w.clone(), pfd)))
            .collect();
        if watches.is_empty() {
            return Ok(true);
        }
        let mut pollfds: Vec<libc::pollfd> = watches.iter().map(|(_, pfd)| *pfd).collect();

        let ready = loop {
            let ret = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if ret >= 0 {
                break ret;
            }
            let err = std::io::Error::last_os_error();
            if err.kind() != std::io::ErrorKind::Interrupted {
                return Err(err.into());
            }
        };

        if ready > 0 {
            for ((watch, _), pfd) in watches.iter().zip(pollfds.iter()) {
                let condition = WatchFlags::from_revents(pfd.revents);
                if condition.is_empty() || watch.fd().is_none() {
                    continue;
                }
                if !self.is_connected() {
                    break;
                }
                self.transport.handle_watch(watch, condition);
            }
        }

        Ok(self.is_connected())
    }

    pub fn close(&self) {
        self.transport.disconnect();
    }

    fn disconnect_error(&self) -> Error {
        if let Some(reason) = self.last_error() {
            debug!(%reason, "connection lost");
        }
        Error::Disconnected
    }
}

impl ConnectionHandler for BusConnection {
    fn transport_error(&self, error: &Error) {
        if !error.is_disconnect() {
            warn!(%error, "transport error");
        }
        self.last_error.replace(Some(error.to_string()));
    }

    fn transport_disconnected(&self) {
        debug!(
            unsent = self.outgoing_len(),
            "connection disconnected"
        );
        self.disconnected.set(true);
    }

    fn queue_received_message(&self, message: Message) {
        self.incoming.borrow_mut().push_back(message);
    }

    fn add_watch(&self, watch: &Watch) -> bool {
        self.watches.borrow_mut().push(watch.clone());
        true
    }

    fn remove_watch(&self, watch: &Watch) {
        self.watches.borrow_mut().retain(|w| !w.ptr_eq(watch));
    }

    fn peek_outgoing(&self) -> Option<Message> {
        self.outgoing.borrow().front().cloned()
    }

    fn message_sent(&self) {
        let queue_length = {
            let mut outgoing = self.outgoing.borrow_mut();
            outgoing.pop_front();
            outgoing.len()
        };
        if self.transport.is_connected() {
            self.transport.messages_pending(queue_length);
        }
    }
}

impl Drop for BusConnection {
    fn drop(&mut self) {
        self.transport.disconnect();
    }
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn new(timeout_ms: i32) -> Self {
        Deadline(
            u64::try_from(timeout_ms)
                .ok()
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
        )
    }

    /// Milliseconds left, `-1` for no deadline, `None` once expired.
    fn remaining(&self) -> Option<i32> {
        match self.0 {
            None => Some(-1),
            Some(deadline) => {
                let left = deadline.checked_duration_since(Instant::now())?;
                if left.is_zero() {
                    return None;
                }
                Some(i32::try_from(left.as_millis()).unwrap_or(i32::MAX).max(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Rc<BusConnection>, Rc<BusConnection>) {
        let (a, b) = UnixStream::pair().unwrap();
        let config = TransportConfig::default();
        let client = Transport::from_stream(a, Role::Client, config.clone()).unwrap();
        let server = Transport::from_stream(b, Role::Server, config).unwrap();
        (
            BusConnection::from_transport(client).unwrap(),
            BusConnection::from_transport(server).unwrap(),
        )
    }

    fn pump(a: &BusConnection, b: &BusConnection) {
        for _ in 0..10 {
            a.read_write_dispatch(0).unwrap();
            b.read_write_dispatch(0).unwrap();
        }
    }

    #[test]
    fn test_deadline() {
        assert_eq!(Deadline::new(-1).remaining(), Some(-1));
        assert!(Deadline::new(10_000).remaining().unwrap() > 0);
        assert_eq!(Deadline::new(0).remaining(), None);
    }

    #[test]
    fn test_watches_drive_the_handshake() {
        let (client, server) = pair();
        assert_eq!(client.watches.borrow().len(), 2);

        pump(&client, &server);
        assert!(client.is_authenticated());
        assert!(server.is_authenticated());

        client.send(Message::new("ping").unwrap()).unwrap();
        assert_eq!(client.outgoing_len(), 1);
        pump(&client, &server);

        assert_eq!(client.outgoing_len(), 0);
        assert!(!client.transport().messages_need_sending());
        assert_eq!(server.pop_message().unwrap().body(), b"ping");
        assert!(server.pop_message().is_none());
    }

    #[test]
    fn test_send_rejects_oversized_message() {
        let (a, _b) = UnixStream::pair().unwrap();
        let config = TransportConfig {
            max_message_size: 4,
            ..Default::default()
        };
        let transport = Transport::from_stream(a, Role::Client, config).unwrap();
        let connection = BusConnection::from_transport(transport).unwrap();

        assert!(matches!(
            connection.send(Message::new("too long").unwrap()),
            Err(Error::MessageTooLarge { size: 8, max: 4 })
        ));
        assert_eq!(connection.outgoing_len(), 0);
    }

    #[test]
    fn test_close_then_send() {
        let (client, _server) = pair();
        client.close();
        assert!(!client.is_connected());
        assert!(client.watches.borrow().is_empty());
        assert!(client.disconnected.get());
        assert!(matches!(
            client.send(Message::new("x").unwrap()),
            Err(Error::Disconnected)
        ));
        assert!(!client.read_write_dispatch(0).unwrap());
    }

    #[test]
    fn test_dropping_peer_is_reported() {
        let (client, server) = pair();
        pump(&client, &server);
        drop(client);

        assert!(!server.read_write_dispatch(1000).unwrap());
        assert!(server.last_error().is_some());
        assert!(server.disconnected.get());
    }

    #[test]
    fn test_flush_times_out_without_peer_progress() {
        let (a, _b) = UnixStream::pair().unwrap();
        let transport = Transport::from_stream(a, Role::Client, TransportConfig::default()).unwrap();
        let client = BusConnection::from_transport(transport).unwrap();

        // nobody answers the AUTH line, so the message never leaves
        client.send(Message::new("stuck").unwrap()).unwrap();
        assert!(matches!(client.flush(50), Err(Error::Timeout)));
        assert!(matches!(
            client.block_until_authenticated(50),
            Err(Error::Timeout)
        ));
    }
}
