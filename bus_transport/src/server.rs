//! Accept incoming transports
use std::env;
use std::fs;
use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::process;

use tracing::debug;

use crate::auth::Role;
use crate::config::TransportConfig;
use crate::error::*;
use crate::transport::Transport;

/// Name a socket-activated descriptor must carry when several are passed
pub const ACTIVATION_FD_NAME: &str = "bus";

#[derive(Debug)]
pub enum Listener {
    TCP(Option<TcpListener>, bool),
    UNIX(Option<UnixListener>, bool),
}

fn activation_listener() -> Option<RawFd> {
    let nfds: usize;

    match env::var("LISTEN_FDS") {
        Ok(ref n) => match n.parse::<usize>() {
            Ok(n) if n >= 1 => nfds = n,
            _ => return None,
        },
        _ => return None,
    }

    match env::var("LISTEN_PID") {
        Ok(ref pid) if pid.parse::<u32>() == Ok(process::id()) => {}
        _ => return None,
    }

    if nfds == 1 {
        return Some(3);
    }

    let fdnames = env::var("LISTEN_FDNAMES").ok()?;

    fdnames
        .split(':')
        .position(|name| name == ACTIVATION_FD_NAME)
        .map(|i| 3 + i as RawFd)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn get_abstract_unixlistener(addr: &str) -> Result<UnixListener> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(addr)?;
    Ok(UnixListener::bind_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn get_abstract_unixlistener(addr: &str) -> Result<UnixListener> {
    Err(Error::InvalidAddress(format!("unix:@{}", addr)))
}

impl Listener {
    #[allow(clippy::new_ret_no_self)]
    pub fn new<S: ?Sized + AsRef<str>>(address: &S) -> Result<Self> {
        let address = address.as_ref();
        if let Some(fd) = activation_listener() {
            debug!(fd, address, "using socket-activated listener");
            if address.starts_with("tcp:") {
                return Ok(Listener::TCP(
                    Some(unsafe { TcpListener::from_raw_fd(fd) }),
                    true,
                ));
            } else if address.starts_with("unix:") {
                return Ok(Listener::UNIX(
                    Some(unsafe { UnixListener::from_raw_fd(fd) }),
                    true,
                ));
            } else {
                return Err(Error::InvalidAddress(address.into()));
            }
        }

        if let Some(addr) = address.strip_prefix("tcp:") {
            Ok(Listener::TCP(Some(TcpListener::bind(addr)?), false))
        } else if let Some(addr) = address.strip_prefix("unix:@") {
            get_abstract_unixlistener(addr.split(';').next().unwrap_or(addr))
                .map(|v| Listener::UNIX(Some(v), false))
        } else if let Some(addr) = address.strip_prefix("unix:") {
            let addr = addr.split(';').next().unwrap_or(addr);
            if addr.is_empty() {
                return Err(Error::InvalidAddress(address.into()));
            }
            // ignore error on non-existent file
            _ = fs::remove_file(addr);
            Ok(Listener::UNIX(Some(UnixListener::bind(addr)?), false))
        } else {
            Err(Error::InvalidAddress(address.into()))
        }
    }

    pub const fn is_already_accepted(&self) -> bool {
        match *self {
            Self::TCP(_, value) => value,
            Self::UNIX(_, value) => value,
        }
    }

    /// Wait for a peer and wrap it in a server transport.
    ///
    /// A `timeout_ms` of zero waits forever; otherwise `Error::Timeout` is
    /// returned when nobody connects in time.
    pub fn accept(&self, timeout_ms: u64, config: &TransportConfig) -> Result<Transport> {
        let fd = self.as_raw_fd().ok_or(Error::Disconnected)?;

        if timeout_ms > 0 {
            let timeout = i32::try_from(timeout_ms).unwrap_or(i32::MAX);
            let mut pfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            loop {
                let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
                if ret > 0 {
                    break;
                }
                if ret == 0 {
                    return Err(Error::Timeout);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(err.into());
                }
            }
        }

        match self {
            &Listener::TCP(Some(ref l), accepted) => {
                let stream = if accepted {
                    unsafe { TcpStream::from_raw_fd(dup_fd(l.as_raw_fd())?) }
                } else {
                    let (s, addr) = l.accept()?;
                    debug!(%addr, "accepted tcp peer");
                    s
                };
                Transport::from_stream(stream, Role::Server, config.clone())
            }
            &Listener::UNIX(Some(ref l), accepted) => {
                let stream = if accepted {
                    unsafe { UnixStream::from_raw_fd(dup_fd(l.as_raw_fd())?) }
                } else {
                    let (s, _addr) = l.accept()?;
                    debug!("accepted unix peer");
                    s
                };
                Transport::from_stream(stream, Role::Server, config.clone())
            }
            _ => Err(Error::Disconnected),
        }
    }

    pub fn set_nonblocking(&self, b: bool) -> Result<()> {
        match *self {
            Listener::TCP(Some(ref l), _) => l.set_nonblocking(b)?,
            Listener::UNIX(Some(ref l), _) => l.set_nonblocking(b)?,
            _ => return Err(Error::Disconnected),
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> Option<RawFd> {
        match *self {
            Listener::TCP(Some(ref l), _) => Some(l.as_raw_fd()),
            Listener::UNIX(Some(ref l), _) => Some(l.as_raw_fd()),
            _ => None,
        }
    }

    /// The address a peer can connect to, in the same notation `new` takes.
    pub fn local_address(&self) -> Option<String> {
        match *self {
            Listener::TCP(Some(ref l), _) => l.local_addr().ok().map(|a| format!("tcp:{}", a)),
            Listener::UNIX(Some(ref l), _) => {
                let addr = l.local_addr().ok()?;
                if let Some(path) = addr.as_pathname() {
                    return Some(format!("unix:{}", path.display()));
                }
                abstract_name(&addr).map(|name| format!("unix:@{}", name))
            }
            _ => None,
        }
    }
}

fn dup_fd(fd: RawFd) -> Result<RawFd> {
    let new = unsafe { libc::dup(fd) };
    if new < 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(new)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn abstract_name(addr: &std::os::unix::net::SocketAddr) -> Option<String> {
    use std::os::linux::net::SocketAddrExt;
    addr.as_abstract_name()
        .map(|name| String::from_utf8_lossy(name).into_owned())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn abstract_name(_addr: &std::os::unix::net::SocketAddr) -> Option<String> {
    None
}

impl Drop for Listener {
    fn drop(&mut self) {
        match *self {
            Listener::UNIX(Some(ref listener), false) => {
                if let Ok(local_addr) = listener.local_addr() {
                    if let Some(path) = local_addr.as_pathname() {
                        let _ = fs::remove_file(path);
                    }
                }
            }
            // activated descriptors belong to the service manager
            Listener::UNIX(ref mut listener, true) => {
                if let Some(l) = listener.take() {
                    let _ = l.into_raw_fd();
                }
            }
            Listener::TCP(ref mut listener, true) => {
                if let Some(l) = listener.take() {
                    let _ = l.into_raw_fd();
                }
            }
            _ => {}
        }
    }
}
