//! Transport over a connected stream socket.
//!
//! The backend runs the authentication conversation over the socket first and
//! then moves NUL-terminated messages in both directions. It can be driven either
//! through the watches it registers with the connection or through
//! [`Transport::do_iteration`].

use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::auth::{AuthState, Role};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::stream::{self, Stream};
use crate::transport::{IterationFlags, Transport, TransportBackend, TransportCore};
use crate::watch::{Watch, WatchFlags};

/// A frame being written, and how much of it already went out.
struct PendingFrame {
    bytes: Vec<u8>,
    written: usize,
}

pub struct SocketBackend {
    stream: Option<Box<dyn Stream>>,
    fd: RawFd,
    read_buf: Vec<u8>,
    read_watch: Option<Watch>,
    write_watch: Option<Watch>,
    sending: Option<PendingFrame>,
    switched_to_messages: bool,
    failed: bool,
}

impl SocketBackend {
    fn new(stream: Box<dyn Stream>, read_chunk_size: usize) -> Self {
        let fd = stream.as_raw_fd();
        SocketBackend {
            stream: Some(stream),
            fd,
            read_buf: vec![0; read_chunk_size.max(1)],
            read_watch: None,
            write_watch: None,
            sending: None,
            switched_to_messages: false,
            failed: false,
        }
    }

    /// Report `error` and schedule the disconnect. Stops all further I/O.
    fn fail(&mut self, transport: &Transport, error: Error) {
        if self.failed {
            return;
        }
        self.failed = true;

        if error.is_disconnect() {
            debug!(fd = self.fd, %error, "peer went away");
        } else {
            warn!(fd = self.fd, %error, "socket transport failed");
        }

        transport.core().report_error(error);
        transport.disconnect();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some() && !self.failed
    }

    /// Move the auth conversation forward; on success hand over to message mode.
    fn advance_auth(&mut self, transport: &Transport) {
        if !self.is_open() {
            return;
        }

        if transport.is_authenticated() {
            if !self.switched_to_messages {
                self.switched_to_messages = true;
                let unused = transport.core().auth().take_unused_bytes();
                if !unused.is_empty() {
                    transport.core().loader().append(&unused);
                }
                debug!(fd = self.fd, role = %transport.role(), "authenticated, exchanging messages");
            }
            self.queue_messages(transport);
            self.update_write_watch(transport);
            return;
        }

        let state = transport.core().auth().do_work();
        if state == AuthState::NeedDisconnect {
            let reason = transport
                .core()
                .auth()
                .failure()
                .unwrap_or("authentication failed")
                .to_string();
            self.fail(transport, Error::AuthRejected(reason));
            return;
        }

        self.update_write_watch(transport);
    }

    /// Hand every complete message in the loader to the connection.
    fn queue_messages(&mut self, transport: &Transport) {
        loop {
            let message = transport.core().loader().pop_message();
            let Some(message) = message else {
                break;
            };

            trace!(fd = self.fd, len = message.len(), "message received");
            match transport.core().connection() {
                Some(connection) => connection.queue_received_message(message),
                None => warn!(fd = self.fd, "dropping message, no connection"),
            }
        }

        let corruption = transport.core().loader().corruption().map(str::to_owned);
        if let Some(reason) = corruption {
            self.fail(transport, Error::InvalidFrame(reason));
        }
    }

    fn wants_to_write(&self, transport: &Transport) -> bool {
        if !self.is_open() {
            return false;
        }
        if !self.switched_to_messages {
            return !transport.core().auth().bytes_to_send().is_empty();
        }
        self.sending.is_some() || transport.messages_need_sending()
    }

    fn wants_to_read(&self, transport: &Transport) -> bool {
        if !self.is_open() {
            return false;
        }
        self.switched_to_messages || transport.core().auth().bytes_to_send().is_empty()
    }

    fn update_write_watch(&mut self, transport: &Transport) {
        let wanted = self.wants_to_write(transport);
        if let Some(watch) = &self.write_watch {
            if watch.set_enabled(wanted) {
                trace!(fd = self.fd, enabled = wanted, "write watch toggled");
                if let Some(connection) = transport.core().connection() {
                    connection.watch_toggled(watch);
                }
            }
        }
    }

    fn do_reading(&mut self, transport: &Transport) {
        let Some(stream) = self.stream.as_mut() else {
            return;
        };

        let n = match stream.read(&mut self.read_buf) {
            Ok(0) => {
                self.fail(transport, io::Error::from(io::ErrorKind::UnexpectedEof).into());
                return;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(e) => {
                self.fail(transport, e.into());
                return;
            }
        };
        trace!(fd = self.fd, n, "read");

        if self.switched_to_messages {
            transport.core().loader().append(&self.read_buf[..n]);
        } else {
            transport.core().auth().bytes_received(&self.read_buf[..n]);
        }
        self.advance_auth(transport);
    }

    fn do_writing(&mut self, transport: &Transport) {
        if self.switched_to_messages {
            self.write_messages(transport);
        } else {
            self.write_auth(transport);
        }
        self.advance_auth(transport);
    }

    fn write_auth(&mut self, transport: &Transport) {
        let bytes = transport.core().auth().bytes_to_send().to_vec();
        if bytes.is_empty() {
            return;
        }
        if let Some(n) = self.write_some(transport, &bytes) {
            trace!(fd = self.fd, n, "auth bytes written");
            transport.core().auth().bytes_sent(n);
        }
    }

    fn write_messages(&mut self, transport: &Transport) {
        while self.is_open() {
            let connection = transport.core().connection();

            if self.sending.is_none() {
                let next = connection
                    .as_ref()
                    .and_then(|connection| connection.peek_outgoing());
                match next {
                    Some(message) => {
                        self.sending = Some(PendingFrame {
                            bytes: message.to_frame(),
                            written: 0,
                        })
                    }
                    None => break,
                }
            }

            let Some(mut frame) = self.sending.take() else {
                break;
            };
            let Some(n) = self.write_some(transport, &frame.bytes[frame.written..]) else {
                self.sending = Some(frame);
                break;
            };

            frame.written += n;
            trace!(fd = self.fd, n, "message bytes written");
            if frame.written < frame.bytes.len() {
                self.sending = Some(frame);
                break;
            }

            if let Some(connection) = &connection {
                connection.message_sent();
            }
        }
    }

    /// One write attempt. `None` if nothing could be written.
    fn write_some(&mut self, transport: &Transport, bytes: &[u8]) -> Option<usize> {
        let stream = self.stream.as_mut()?;
        match stream.write(bytes) {
            Ok(0) => {
                self.fail(transport, io::Error::from(io::ErrorKind::WriteZero).into());
                None
            }
            Ok(n) => Some(n),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                None
            }
            Err(e) => {
                self.fail(transport, e.into());
                None
            }
        }
    }

    fn poll(&mut self, transport: &Transport, events: libc::c_short, timeout_ms: i32) -> WatchFlags {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };

        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                self.fail(transport, err.into());
                return WatchFlags::empty();
            }
        }

        WatchFlags::from_revents(pfd.revents)
    }
}

impl TransportBackend for SocketBackend {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn finalize(&mut self, _core: &TransportCore) {
        self.stream = None;
        self.sending = None;
        self.read_buf = Vec::new();
        trace!(fd = self.fd, "socket backend released");
    }

    fn handle_watch(&mut self, transport: &Transport, watch: &Watch, condition: WatchFlags) {
        let is_read_watch = self.read_watch.as_ref().is_some_and(|w| w.ptr_eq(watch));
        let is_write_watch = self.write_watch.as_ref().is_some_and(|w| w.ptr_eq(watch));

        if !is_read_watch && !is_write_watch {
            warn!(fd = self.fd, ?watch, "watch does not belong to this transport");
            return;
        }

        if is_read_watch
            && condition.intersects(WatchFlags::READABLE | WatchFlags::ERROR | WatchFlags::HANGUP)
        {
            self.do_reading(transport);
        }

        if is_write_watch && condition.contains(WatchFlags::WRITABLE) && self.is_open() {
            self.do_writing(transport);
        }

        if is_write_watch
            && condition.intersects(WatchFlags::ERROR | WatchFlags::HANGUP)
            && self.is_open()
        {
            self.fail(
                transport,
                io::Error::from(io::ErrorKind::ConnectionReset).into(),
            );
        }
    }

    fn disconnect(&mut self, core: &TransportCore) {
        let watches = [self.read_watch.take(), self.write_watch.take()];
        let connection = core.connection();

        for watch in watches.into_iter().flatten() {
            if let Some(connection) = &connection {
                connection.remove_watch(&watch);
            }
            watch.invalidate();
        }

        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.shutdown() {
                debug!(fd = self.fd, %error, "shutdown failed");
            }
        }
        self.sending = None;
        debug!(fd = self.fd, "socket closed");
    }

    fn connection_set(&mut self, transport: &Transport) {
        if !self.is_open() {
            return;
        }

        let read_watch = Watch::new(self.fd, WatchFlags::READABLE, true);
        let write_watch = Watch::new(self.fd, WatchFlags::WRITABLE, false);

        if let Some(connection) = transport.core().connection() {
            for watch in [&read_watch, &write_watch] {
                if !connection.add_watch(watch) {
                    warn!(fd = self.fd, ?watch, "connection refused watch");
                }
            }
        }

        self.read_watch = Some(read_watch);
        self.write_watch = Some(write_watch);
        self.advance_auth(transport);
    }

    fn messages_pending(&mut self, transport: &Transport, _queue_length: usize) {
        self.update_write_watch(transport);
    }

    fn do_iteration(&mut self, transport: &Transport, flags: IterationFlags, timeout_ms: i32) {
        self.advance_auth(transport);
        if !self.is_open() {
            return;
        }

        let mut events = 0;
        if flags.contains(IterationFlags::DO_READING) && self.wants_to_read(transport) {
            events |= libc::POLLIN;
        }
        if flags.contains(IterationFlags::DO_WRITING) && self.wants_to_write(transport) {
            events |= libc::POLLOUT;
        }
        if events == 0 {
            return;
        }

        let timeout_ms = if flags.contains(IterationFlags::BLOCK) {
            timeout_ms
        } else {
            0
        };

        let condition = self.poll(transport, events, timeout_ms);
        trace!(fd = self.fd, ?flags, ?condition, "poll");

        if condition.intersects(WatchFlags::READABLE | WatchFlags::ERROR | WatchFlags::HANGUP) {
            self.do_reading(transport);
        }
        if condition.contains(WatchFlags::WRITABLE) && self.is_open() {
            self.do_writing(transport);
        }
    }
}

impl Transport {
    /// Build a transport around an already connected stream.
    ///
    /// The stream is switched to non-blocking mode. A server picks up the
    /// peer's credentials from the socket when the OS provides them.
    pub fn from_stream<S: Stream + 'static>(
        stream: S,
        role: Role,
        config: TransportConfig,
    ) -> Result<Transport> {
        Transport::from_boxed_stream(Box::new(stream), role, config)
    }

    /// Connect to `address` as a client.
    ///
    /// See [`stream::connect`] for the accepted address forms.
    pub fn open(address: &str, config: TransportConfig) -> Result<Transport> {
        let stream = stream::connect(address)?;
        debug!(address, "connected");
        Transport::from_boxed_stream(stream, Role::Client, config)
    }

    pub(crate) fn from_boxed_stream(
        mut stream: Box<dyn Stream>,
        role: Role,
        config: TransportConfig,
    ) -> Result<Transport> {
        stream.set_nonblocking(true)?;
        let peer_uid = match role {
            Role::Server => stream.peer_uid(),
            Role::Client => None,
        };

        let backend = SocketBackend::new(stream, config.read_chunk_size);
        let transport = Transport::new(backend, role, config);
        transport.core().auth().set_peer_uid(peer_uid);
        Ok(transport)
    }
}
