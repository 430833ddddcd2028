//! The transport object.
//!
//! A [`Transport`] turns a byte channel into something a connection can drive: it
//! owns the authentication conversation and the message loader, and forwards I/O
//! work to a [`TransportBackend`] that knows the concrete channel.
//!
//! # Ownership
//!
//! The connection owns its transport. The transport only keeps a [`Weak`] handle
//! back to the connection, set once by [`Transport::set_connection`].
//!
//! # Reentrancy
//!
//! Backend code may call back into the transport or the connection, and the
//! connection may react by releasing its reference to the transport. Every
//! dispatch into the backend therefore runs under a [`DispatchGuard`], which keeps
//! both the transport and the connection alive until the backend returns.
//!
//! While a backend operation runs, the backend is exclusively borrowed. A
//! `disconnect` or `messages_pending` issued from inside that operation is
//! recorded and replayed as soon as the backend returns, still under the guard.
//! A recorded disconnect already counts: the transport reports itself
//! disconnected from that point on, only the backend's channel closes later.

use std::cell::{Cell, OnceCell, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::auth::{Auth, AuthState, Role};
use crate::config::TransportConfig;
use crate::connection::ConnectionHandler;
use crate::error::Error;
use crate::loader::MessageLoader;
use crate::watch::{Watch, WatchFlags};

bitflags! {
    /// What a single [`Transport::do_iteration`] may do.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct IterationFlags: u32 {
        const DO_READING = 1 << 0;
        const DO_WRITING = 1 << 1;
        /// Wait up to the given timeout for the descriptor to become ready
        const BLOCK = 1 << 2;
    }
}

/// Operations a concrete transport supplies.
///
/// The methods are only ever called by [`Transport`], never while the transport
/// is disconnected (except `finalize`), and never reentrantly.
pub trait TransportBackend {
    /// Short name used in log output.
    fn name(&self) -> &'static str {
        "transport"
    }

    /// Release backend resources. Called once, when the last handle is dropped,
    /// after the transport has been disconnected.
    fn finalize(&mut self, core: &TransportCore);

    /// Read and/or write as `condition` allows, feeding the loader and handing
    /// complete messages to the connection. Failures are reported to the
    /// connection and end in a disconnect.
    fn handle_watch(&mut self, transport: &Transport, watch: &Watch, condition: WatchFlags);

    /// Close the underlying channel. Called at most once.
    fn disconnect(&mut self, core: &TransportCore);

    /// The connection handle was just set; register watches with it.
    fn connection_set(&mut self, transport: &Transport);

    /// The outgoing queue changed length.
    fn messages_pending(&mut self, transport: &Transport, queue_length: usize);

    /// One poll cycle restricted to `flags`. A negative `timeout_ms` blocks
    /// indefinitely when `IterationFlags::BLOCK` is set.
    fn do_iteration(&mut self, transport: &Transport, flags: IterationFlags, timeout_ms: i32);
}

/// Link state of a transport.
///
/// `authenticated` only ever goes from `false` to `true` and survives the
/// transition to `Disconnected`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Connected { authenticated: bool },
    Disconnected { authenticated: bool },
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected { .. })
    }

    pub fn is_authenticated(self) -> bool {
        match self {
            LinkState::Connected { authenticated } | LinkState::Disconnected { authenticated } => {
                authenticated
            }
        }
    }

    fn authenticated(self) -> Self {
        match self {
            LinkState::Connected { .. } => LinkState::Connected {
                authenticated: true,
            },
            LinkState::Disconnected { .. } => LinkState::Disconnected {
                authenticated: true,
            },
        }
    }

    fn disconnected(self) -> Self {
        LinkState::Disconnected {
            authenticated: self.is_authenticated(),
        }
    }
}

/// State shared by every transport, independent of the backend.
pub struct TransportCore {
    role: Role,
    config: TransportConfig,
    state: Cell<LinkState>,
    messages_need_sending: Cell<bool>,
    loader: RefCell<MessageLoader>,
    auth: RefCell<Auth>,
    connection: OnceCell<Weak<dyn ConnectionHandler>>,
    pending_disconnect: Cell<bool>,
    pending_queue_length: Cell<Option<usize>>,
}

impl TransportCore {
    fn new(role: Role, config: TransportConfig) -> Self {
        TransportCore {
            role,
            state: Cell::new(LinkState::Connected {
                authenticated: false,
            }),
            messages_need_sending: Cell::new(false),
            loader: RefCell::new(MessageLoader::new(config.max_message_size)),
            auth: RefCell::new(Auth::new(role, config.max_auth_line)),
            connection: OnceCell::new(),
            pending_disconnect: Cell::new(false),
            pending_queue_length: Cell::new(None),
            config,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Current link state. A disconnect requested from backend code shows as
    /// `Disconnected` right away.
    pub fn state(&self) -> LinkState {
        let state = self.state.get();
        if self.pending_disconnect.get() {
            state.disconnected()
        } else {
            state
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Whether the connection's outgoing queue was non-empty at the last
    /// [`Transport::messages_pending`] call.
    pub fn messages_need_sending(&self) -> bool {
        self.messages_need_sending.get()
    }

    /// Whether the peer is authenticated.
    ///
    /// Asks the auth conversation to make progress until it reports success,
    /// then answers from the cached state forever after.
    pub fn is_authenticated(&self) -> bool {
        let state = self.state.get();
        if state.is_authenticated() {
            return true;
        }

        let Ok(mut auth) = self.auth.try_borrow_mut() else {
            trace!("auth conversation busy, answering from cache");
            return false;
        };

        if auth.do_work() == AuthState::Authenticated {
            debug!(role = %self.role, "transport authenticated");
            self.state.set(self.state.get().authenticated());
            true
        } else {
            false
        }
    }

    pub fn loader(&self) -> RefMut<'_, MessageLoader> {
        self.loader.borrow_mut()
    }

    pub fn auth(&self) -> RefMut<'_, Auth> {
        self.auth.borrow_mut()
    }

    /// The owning connection, if one was set and is still alive.
    pub fn connection(&self) -> Option<Rc<dyn ConnectionHandler>> {
        self.connection.get().and_then(Weak::upgrade)
    }

    /// Report a fatal condition to the connection.
    pub fn report_error(&self, error: Error) {
        match self.connection() {
            Some(connection) => connection.transport_error(&error),
            None => warn!(%error, "transport error with no connection to report it to"),
        }
    }

    fn mark_disconnected(&self) {
        self.state.set(self.state.get().disconnected());
        self.pending_disconnect.set(false);
        self.pending_queue_length.set(None);
    }
}

impl fmt::Debug for TransportCore {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TransportCore")
            .field("role", &self.role)
            .field("state", &self.state())
            .field("messages_need_sending", &self.messages_need_sending.get())
            .field("has_connection", &self.connection.get().is_some())
            .finish()
    }
}

struct TransportShared {
    core: TransportCore,
    backend: RefCell<Box<dyn TransportBackend>>,
}

impl Drop for TransportShared {
    fn drop(&mut self) {
        let backend = self.backend.get_mut();
        let name = backend.name();

        if self.core.state.get().is_connected() {
            debug!(transport = name, "finalizing a connected transport, disconnecting first");
            backend.disconnect(&self.core);
            self.core.mark_disconnected();
            if let Some(connection) = self.core.connection() {
                connection.transport_disconnected();
            }
        }

        backend.finalize(&self.core);
        debug!(transport = name, role = %self.core.role, "transport finalized");
    }
}

/// Keeps a transport and its connection alive across a call into backend code.
///
/// Fields drop in declaration order: the connection is released before the
/// transport, the reverse of how they were acquired.
struct DispatchGuard {
    connection: Option<Rc<dyn ConnectionHandler>>,
    _transport: Transport,
}

impl DispatchGuard {
    fn hold(transport: &Transport) -> Self {
        let transport = transport.clone();
        let connection = transport.core().connection();
        DispatchGuard {
            connection,
            _transport: transport,
        }
    }
}

/// Handle to a transport.
///
/// Cloning a handle takes a reference, dropping it releases one. The backend is
/// finalized exactly once, when the last handle goes away.
#[derive(Clone)]
pub struct Transport {
    shared: Rc<TransportShared>,
}

impl Transport {
    /// Build a transport around `backend`.
    ///
    /// The base state starts connected and unauthenticated, with a fresh
    /// loader and an auth conversation for `role`.
    pub fn new<B>(backend: B, role: Role, config: TransportConfig) -> Transport
    where
        B: TransportBackend + 'static,
    {
        debug!(transport = backend.name(), %role, "creating transport");
        Transport {
            shared: Rc::new(TransportShared {
                core: TransportCore::new(role, config),
                backend: RefCell::new(Box::new(backend)),
            }),
        }
    }

    pub fn core(&self) -> &TransportCore {
        &self.shared.core
    }

    pub fn role(&self) -> Role {
        self.shared.core.role
    }

    /// Number of live handles to this transport.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.shared)
    }

    /// Whether both handles refer to the same transport.
    pub fn ptr_eq(&self, other: &Transport) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.core.is_connected()
    }

    pub fn is_authenticated(&self) -> bool {
        self.shared.core.is_authenticated()
    }

    pub fn messages_need_sending(&self) -> bool {
        self.shared.core.messages_need_sending()
    }

    /// Close the link. Only the first call has an effect.
    ///
    /// The backend closes its channel first, then the transport is marked
    /// disconnected, then the connection is told. Called from inside a
    /// backend operation, the transport counts as disconnected at once and
    /// the rest runs as soon as that operation returns.
    pub fn disconnect(&self) {
        let core = self.core();
        if !core.is_connected() {
            return;
        }

        let guard = DispatchGuard::hold(self);

        let Ok(mut backend) = self.shared.backend.try_borrow_mut() else {
            core.pending_disconnect.set(true);
            debug!("disconnect requested from backend code, deferring");
            return;
        };
        let name = backend.name();
        backend.disconnect(core);
        drop(backend);

        core.mark_disconnected();
        debug!(transport = name, role = %core.role, "transport disconnected");

        if let Some(connection) = &guard.connection {
            connection.transport_disconnected();
        }
    }

    /// Bind the owning connection and let the backend register its watches.
    ///
    /// May be called once per transport.
    pub fn set_connection(&self, connection: Weak<dyn ConnectionHandler>) -> Result<(), Error> {
        if self.shared.core.connection.set(connection).is_err() {
            warn!("transport already has a connection");
            return Err(Error::ConnectionAlreadySet);
        }

        self.dispatch("connection_set", |backend, transport| {
            backend.connection_set(transport)
        });
        Ok(())
    }

    /// Handle readiness reported by the event loop for one of our watches.
    pub fn handle_watch(&self, watch: &Watch, condition: WatchFlags) {
        let core = self.core();
        if !core.is_connected() {
            core.report_error(Error::Disconnected);
            return;
        }

        if watch.fd().is_none() {
            let error = Error::InvalidWatch;
            warn!(%error, ?watch, "skipping watch, it should have been removed");
            return;
        }

        let condition = watch.sanitize_condition(condition);
        let watch = watch.clone();
        self.dispatch("handle_watch", |backend, transport| {
            backend.handle_watch(transport, &watch, condition)
        });
    }

    /// Tell the transport the outgoing queue is now `queue_length` long.
    pub fn messages_pending(&self, queue_length: usize) {
        let core = self.core();
        if !core.is_connected() {
            core.report_error(Error::Disconnected);
            return;
        }

        core.messages_need_sending.set(queue_length > 0);

        if self.is_dispatching() {
            trace!(queue_length, "queue change during dispatch, deferring");
            core.pending_queue_length.set(Some(queue_length));
            return;
        }

        self.dispatch("messages_pending", |backend, transport| {
            backend.messages_pending(transport, queue_length)
        });
    }

    /// Run one read/write cycle outside of the watch machinery.
    pub fn do_iteration(&self, flags: IterationFlags, timeout_ms: i32) {
        if !flags.intersects(IterationFlags::DO_READING | IterationFlags::DO_WRITING) {
            return;
        }

        let core = self.core();
        if !core.is_connected() {
            core.report_error(Error::Disconnected);
            return;
        }

        self.dispatch("do_iteration", |backend, transport| {
            backend.do_iteration(transport, flags, timeout_ms)
        });
    }

    fn is_dispatching(&self) -> bool {
        self.shared.backend.try_borrow().is_err()
    }

    fn dispatch<F>(&self, operation: &'static str, f: F)
    where
        F: FnOnce(&mut dyn TransportBackend, &Transport),
    {
        let _guard = DispatchGuard::hold(self);

        match self.shared.backend.try_borrow_mut() {
            Ok(mut backend) => f(&mut **backend, self),
            Err(_) => {
                warn!(operation, "reentrant call into the transport backend skipped");
                return;
            }
        }

        self.run_deferred();
    }

    fn run_deferred(&self) {
        let core = self.core();

        if core.pending_disconnect.take() {
            self.disconnect();
        }

        if let Some(queue_length) = core.pending_queue_length.take() {
            if core.is_connected() {
                self.dispatch("messages_pending", |backend, transport| {
                    backend.messages_pending(transport, queue_length)
                });
            }
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Transport")
            .field("refs", &self.ref_count())
            .field("core", &self.shared.core)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Message;
    use static_assertions::assert_not_impl_any;

    assert_not_impl_any!(Transport: Send, Sync);

    #[derive(Default)]
    struct Calls {
        finalize: usize,
        disconnect: usize,
        connection_set: usize,
        handle_watch: Vec<WatchFlags>,
        messages_pending: Vec<(usize, bool)>,
        do_iteration: Vec<(IterationFlags, i32)>,
        refs_during_dispatch: Vec<usize>,
        connected_during_disconnect: Vec<bool>,
        state_after_reentrant_disconnect: Vec<LinkState>,
    }

    #[derive(Default)]
    struct MockBackend {
        calls: Rc<RefCell<Calls>>,
        disconnect_in_handle_watch: bool,
        queue_change_in_handle_watch: bool,
        drop_from_connection: bool,
    }

    impl TransportBackend for MockBackend {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn finalize(&mut self, core: &TransportCore) {
            assert!(!core.is_connected());
            self.calls.borrow_mut().finalize += 1;
        }

        fn handle_watch(&mut self, transport: &Transport, _watch: &Watch, condition: WatchFlags) {
            {
                let mut calls = self.calls.borrow_mut();
                calls.handle_watch.push(condition);
                calls.refs_during_dispatch.push(transport.ref_count());
            }
            if self.queue_change_in_handle_watch {
                transport.messages_pending(0);
                assert!(!transport.messages_need_sending());
            }
            if self.drop_from_connection {
                transport.core().report_error(Error::InvalidFrame("test".into()));
            }
            if self.disconnect_in_handle_watch {
                transport.disconnect();
                self.calls
                    .borrow_mut()
                    .state_after_reentrant_disconnect
                    .push(transport.core().state());
                assert!(!transport.is_connected());
                transport.disconnect();
                // the queue can no longer be announced
                transport.messages_pending(1);
                assert!(!transport.messages_need_sending());
            }
        }

        fn disconnect(&mut self, core: &TransportCore) {
            let mut calls = self.calls.borrow_mut();
            calls.disconnect += 1;
            calls.connected_during_disconnect.push(core.is_connected());
        }

        fn connection_set(&mut self, transport: &Transport) {
            let mut calls = self.calls.borrow_mut();
            calls.connection_set += 1;
            calls.refs_during_dispatch.push(transport.ref_count());
        }

        fn messages_pending(&mut self, transport: &Transport, queue_length: usize) {
            self.calls
                .borrow_mut()
                .messages_pending
                .push((queue_length, transport.messages_need_sending()));
        }

        fn do_iteration(&mut self, _transport: &Transport, flags: IterationFlags, timeout_ms: i32) {
            self.calls.borrow_mut().do_iteration.push((flags, timeout_ms));
        }
    }

    #[derive(Default)]
    struct MockConnection {
        errors: RefCell<Vec<String>>,
        disconnected: Cell<usize>,
        transport: RefCell<Option<Transport>>,
    }

    impl ConnectionHandler for MockConnection {
        fn transport_error(&self, error: &Error) {
            self.errors.borrow_mut().push(error.to_string());
            if let Error::InvalidFrame(_) = error {
                // drop our reference while the backend is still running
                self.transport.borrow_mut().take();
            }
        }

        fn transport_disconnected(&self) {
            self.disconnected.set(self.disconnected.get() + 1);
        }

        fn queue_received_message(&self, _message: Message) {}

        fn add_watch(&self, _watch: &Watch) -> bool {
            true
        }

        fn remove_watch(&self, _watch: &Watch) {}

        fn peek_outgoing(&self) -> Option<Message> {
            None
        }

        fn message_sent(&self) {}
    }

    fn new_transport(backend: MockBackend) -> (Transport, Rc<RefCell<Calls>>) {
        let calls = backend.calls.clone();
        let transport = Transport::new(backend, Role::Client, TransportConfig::default());
        (transport, calls)
    }

    fn connect(transport: &Transport) -> Rc<MockConnection> {
        let connection = Rc::new(MockConnection::default());
        let weak: Weak<MockConnection> = Rc::downgrade(&connection);
        transport.set_connection(weak).unwrap();
        connection
    }

    fn watch() -> Watch {
        Watch::new(0, WatchFlags::READABLE, true)
    }

    #[test]
    fn test_fresh_client_transport() {
        let (transport, _calls) = new_transport(MockBackend::default());
        assert!(transport.is_connected());
        assert!(!transport.is_authenticated());
        assert!(!transport.messages_need_sending());
        assert_eq!(transport.role(), Role::Client);
        assert_eq!(
            transport.core().state(),
            LinkState::Connected {
                authenticated: false
            }
        );
    }

    #[test]
    fn test_finalized_exactly_when_last_reference_drops() {
        let (transport, calls) = new_transport(MockBackend::default());
        assert_eq!(transport.ref_count(), 1);

        let refs: Vec<Transport> = (0..5).map(|_| transport.clone()).collect();
        assert_eq!(transport.ref_count(), 6);

        drop(transport);
        for r in refs {
            assert_eq!(calls.borrow().finalize, 0);
            drop(r);
        }

        let calls = calls.borrow();
        assert_eq!(calls.finalize, 1);
        // finalizing a connected transport disconnects it first
        assert_eq!(calls.disconnect, 1);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let (transport, calls) = new_transport(MockBackend::default());
        let connection = connect(&transport);

        for _ in 0..3 {
            transport.disconnect();
            assert!(!transport.is_connected());
        }

        assert_eq!(calls.borrow().disconnect, 1);
        assert_eq!(calls.borrow().connected_during_disconnect, vec![true]);
        assert_eq!(connection.disconnected.get(), 1);

        drop(transport);
        assert_eq!(calls.borrow().disconnect, 1);
        assert_eq!(calls.borrow().finalize, 1);
        assert_eq!(connection.disconnected.get(), 1);
    }

    #[test]
    fn test_operations_after_disconnect_report_errors() {
        let (transport, calls) = new_transport(MockBackend::default());
        let connection = connect(&transport);
        transport.disconnect();

        transport.handle_watch(&watch(), WatchFlags::READABLE);
        transport.messages_pending(3);
        transport.do_iteration(IterationFlags::DO_READING, 0);

        let calls = calls.borrow();
        assert!(calls.handle_watch.is_empty());
        assert!(calls.messages_pending.is_empty());
        assert!(calls.do_iteration.is_empty());

        let errors = connection.errors.borrow();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().all(|e| e == "transport is disconnected"));
        assert!(!transport.messages_need_sending());
    }

    #[test]
    fn test_do_iteration_without_direction_is_noop() {
        let (transport, calls) = new_transport(MockBackend::default());
        let connection = connect(&transport);

        transport.do_iteration(IterationFlags::BLOCK, -1);
        assert!(calls.borrow().do_iteration.is_empty());

        transport.disconnect();
        transport.do_iteration(IterationFlags::BLOCK, -1);
        assert!(connection.errors.borrow().is_empty());

        let (transport, calls) = new_transport(MockBackend::default());
        transport.do_iteration(IterationFlags::DO_WRITING | IterationFlags::BLOCK, 250);
        assert_eq!(
            calls.borrow().do_iteration,
            vec![(IterationFlags::DO_WRITING | IterationFlags::BLOCK, 250)]
        );
    }

    #[test]
    fn test_set_connection_only_once() {
        let (transport, calls) = new_transport(MockBackend::default());
        let _connection = connect(&transport);
        assert_eq!(calls.borrow().connection_set, 1);
        // the guard holds one extra reference during the call
        assert_eq!(calls.borrow().refs_during_dispatch, vec![2]);

        let other = Rc::new(MockConnection::default());
        let weak: Weak<MockConnection> = Rc::downgrade(&other);
        assert!(matches!(
            transport.set_connection(weak),
            Err(Error::ConnectionAlreadySet)
        ));
        assert_eq!(calls.borrow().connection_set, 1);
    }

    #[test]
    fn test_handle_watch_sanitizes_condition() {
        let (transport, calls) = new_transport(MockBackend::default());
        let _connection = connect(&transport);

        transport.handle_watch(&watch(), WatchFlags::READABLE | WatchFlags::WRITABLE);
        transport.handle_watch(&watch(), WatchFlags::HANGUP);

        assert_eq!(
            calls.borrow().handle_watch,
            vec![WatchFlags::READABLE, WatchFlags::HANGUP]
        );
    }

    #[test]
    fn test_handle_invalidated_watch_is_skipped() {
        let (transport, calls) = new_transport(MockBackend::default());
        let connection = connect(&transport);

        let w = watch();
        w.invalidate();
        transport.handle_watch(&w, WatchFlags::READABLE);

        assert!(calls.borrow().handle_watch.is_empty());
        assert!(connection.errors.borrow().is_empty());
        assert!(transport.is_connected());
    }

    #[test]
    fn test_messages_pending_flag_seen_by_backend() {
        let (transport, calls) = new_transport(MockBackend::default());
        let _connection = connect(&transport);

        transport.messages_pending(5);
        transport.messages_pending(0);

        assert_eq!(calls.borrow().messages_pending, vec![(5, true), (0, false)]);
        assert!(!transport.messages_need_sending());
    }

    #[test]
    fn test_authentication_is_monotonic() {
        let (transport, _calls) = new_transport(MockBackend::default());
        assert!(!transport.is_authenticated());

        transport.core().auth().bytes_received(b"OK\r\n");
        // BEGIN still has to go out
        assert!(!transport.is_authenticated());

        {
            let mut auth = transport.core().auth();
            let n = auth.bytes_to_send().len();
            auth.bytes_sent(n);
        }
        assert!(transport.is_authenticated());

        transport.disconnect();
        assert!(transport.is_authenticated());
        assert_eq!(
            transport.core().state(),
            LinkState::Disconnected {
                authenticated: true
            }
        );
    }

    #[test]
    fn test_reentrant_disconnect_from_handle_watch() {
        let (transport, calls) = new_transport(MockBackend {
            disconnect_in_handle_watch: true,
            ..Default::default()
        });
        let connection = connect(&transport);

        transport.handle_watch(&watch(), WatchFlags::READABLE);

        assert!(!transport.is_connected());
        assert_eq!(transport.ref_count(), 1);
        {
            let calls = calls.borrow();
            assert_eq!(calls.handle_watch.len(), 1);
            assert_eq!(
                calls.state_after_reentrant_disconnect,
                vec![LinkState::Disconnected {
                    authenticated: false
                }]
            );
            assert!(calls.messages_pending.is_empty());
            // the backend still closes its channel exactly once, afterwards
            assert_eq!(calls.disconnect, 1);
            assert_eq!(calls.connected_during_disconnect, vec![true]);
            assert_eq!(calls.finalize, 0);
        }
        assert_eq!(connection.disconnected.get(), 1);
        assert_eq!(
            *connection.errors.borrow(),
            vec!["transport is disconnected".to_string()]
        );

        drop(transport);
        assert_eq!(calls.borrow().finalize, 1);
        assert_eq!(calls.borrow().disconnect, 1);
    }

    #[test]
    fn test_reentrant_queue_change_is_replayed() {
        let (transport, calls) = new_transport(MockBackend {
            queue_change_in_handle_watch: true,
            ..Default::default()
        });
        let _connection = connect(&transport);

        transport.messages_pending(2);
        transport.handle_watch(&watch(), WatchFlags::READABLE);

        assert_eq!(calls.borrow().messages_pending, vec![(2, true), (0, false)]);
    }

    #[test]
    fn test_connection_drops_transport_during_dispatch() {
        let (transport, calls) = new_transport(MockBackend {
            drop_from_connection: true,
            ..Default::default()
        });
        let connection = connect(&transport);
        *connection.transport.borrow_mut() = Some(transport.clone());
        assert_eq!(transport.ref_count(), 2);

        transport.handle_watch(&watch(), WatchFlags::READABLE);

        assert!(connection.transport.borrow().is_none());
        assert_eq!(calls.borrow().refs_during_dispatch, vec![2, 3]);
        assert_eq!(transport.ref_count(), 1);
        assert_eq!(calls.borrow().finalize, 0);

        drop(transport);
        assert_eq!(calls.borrow().finalize, 1);
    }
}
