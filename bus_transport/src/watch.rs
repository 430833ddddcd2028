//! Readiness registrations on a transport's file descriptor.

use std::cell::Cell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use bitflags::bitflags;

bitflags! {
    /// Readiness conditions a watch listens for, or that the event loop observed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct WatchFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const ERROR = 1 << 2;
        const HANGUP = 1 << 3;
    }
}

impl WatchFlags {
    /// Translate the `revents` of a `pollfd` into watch conditions.
    pub fn from_revents(revents: libc::c_short) -> Self {
        let mut flags = WatchFlags::empty();
        if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
            flags |= WatchFlags::READABLE;
        }
        if revents & libc::POLLOUT != 0 {
            flags |= WatchFlags::WRITABLE;
        }
        if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
            flags |= WatchFlags::ERROR;
        }
        if revents & libc::POLLHUP != 0 {
            flags |= WatchFlags::HANGUP;
        }
        flags
    }

    /// The `pollfd.events` mask matching the read/write interest in `self`.
    pub fn to_poll_events(self) -> libc::c_short {
        let mut events = 0;
        if self.contains(WatchFlags::READABLE) {
            events |= libc::POLLIN;
        }
        if self.contains(WatchFlags::WRITABLE) {
            events |= libc::POLLOUT;
        }
        events
    }
}

struct WatchInner {
    fd: Cell<RawFd>,
    flags: WatchFlags,
    enabled: Cell<bool>,
}

/// A registration of interest in the readiness of one descriptor.
///
/// `Watch` is a shared handle: clones refer to the same registration, so a
/// transport can retract a watch (see [`Watch::invalidate`]) while the event loop
/// still holds it. The event loop must then skip it.
#[derive(Clone)]
pub struct Watch {
    inner: Rc<WatchInner>,
}

impl Watch {
    pub fn new(fd: RawFd, flags: WatchFlags, enabled: bool) -> Self {
        Watch {
            inner: Rc::new(WatchInner {
                fd: Cell::new(fd),
                flags,
                enabled: Cell::new(enabled),
            }),
        }
    }

    /// The watched descriptor, or `None` once the watch was invalidated.
    pub fn fd(&self) -> Option<RawFd> {
        let fd = self.inner.fd.get();
        if fd < 0 {
            None
        } else {
            Some(fd)
        }
    }

    /// The conditions this watch listens for.
    pub fn flags(&self) -> WatchFlags {
        self.inner.flags
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.get()
    }

    /// Returns `true` if the state changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.enabled.replace(enabled) != enabled
    }

    /// Detach the watch from its descriptor. Never reverts.
    pub fn invalidate(&self) {
        self.inner.fd.set(-1);
        self.inner.enabled.set(false);
    }

    /// Drop read/write conditions this watch does not listen for.
    ///
    /// `ERROR` and `HANGUP` are always kept; they are reported by the kernel
    /// whether asked for or not.
    pub fn sanitize_condition(&self, condition: WatchFlags) -> WatchFlags {
        let mut condition = condition;
        if !self.inner.flags.contains(WatchFlags::READABLE) {
            condition.remove(WatchFlags::READABLE);
        }
        if !self.inner.flags.contains(WatchFlags::WRITABLE) {
            condition.remove(WatchFlags::WRITABLE);
        }
        condition
    }

    /// Whether both handles refer to the same registration.
    pub fn ptr_eq(&self, other: &Watch) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Current number of handles to this registration.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// A `pollfd` for this watch, if it is valid and enabled.
    pub fn to_pollfd(&self) -> Option<libc::pollfd> {
        if !self.is_enabled() {
            return None;
        }
        self.fd().map(|fd| libc::pollfd {
            fd,
            events: self.inner.flags.to_poll_events(),
            revents: 0,
        })
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Watch")
            .field("fd", &self.inner.fd.get())
            .field("flags", &self.inner.flags)
            .field("enabled", &self.inner.enabled.get())
            .finish()
    }
}
