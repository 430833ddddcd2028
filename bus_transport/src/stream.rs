use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;

use crate::error::*;

/// A connected byte channel a socket transport can drive.
pub trait Stream: Read + Write + AsRawFd {
    fn shutdown(&mut self) -> Result<()>;
    fn set_nonblocking(&mut self, b: bool) -> Result<()>;
    /// Uid of the process on the other end, when the OS can tell.
    fn peer_uid(&self) -> Option<u32>;
}

impl Stream for TcpStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        TcpStream::set_nonblocking(self, b)?;
        Ok(())
    }

    #[inline]
    fn peer_uid(&self) -> Option<u32> {
        None
    }
}

impl Stream for UnixStream {
    #[inline]
    fn shutdown(&mut self) -> Result<()> {
        UnixStream::shutdown(self, Shutdown::Both)?;
        Ok(())
    }

    #[inline]
    fn set_nonblocking(&mut self, b: bool) -> Result<()> {
        UnixStream::set_nonblocking(self, b)?;
        Ok(())
    }

    #[inline]
    fn peer_uid(&self) -> Option<u32> {
        unix_peer_uid(self)
    }
}

#[cfg(target_os = "linux")]
fn unix_peer_uid(stream: &UnixStream) -> Option<u32> {
    let cred = unsafe {
        let mut cred: libc::ucred = std::mem::zeroed();
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        let result = libc::getsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        );

        if result < 0 {
            tracing::debug!("failed to get peer credentials");
            return None;
        }
        cred
    };

    tracing::trace!(peer_uid = cred.uid, peer_pid = cred.pid, "peer credentials");
    Some(cred.uid)
}

#[cfg(not(target_os = "linux"))]
fn unix_peer_uid(_stream: &UnixStream) -> Option<u32> {
    None
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name)?;
    Ok(UnixStream::connect_addr(&addr)?)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(name: &str) -> Result<UnixStream> {
    Err(Error::InvalidAddress(format!("unix:@{}", name)))
}

/// Connect to `address`.
///
/// Accepted forms are `unix:<path>`, `unix:@<abstract name>` and
/// `tcp:<host>:<port>`. Anything after a `;` in a unix address is ignored.
pub fn connect(address: &str) -> Result<Box<dyn Stream>> {
    if let Some(addr) = address.strip_prefix("tcp:") {
        Ok(Box::new(TcpStream::connect(addr)?))
    } else if let Some(addr) = address.strip_prefix("unix:") {
        let addr = addr.split(';').next().unwrap_or(addr);
        if addr.is_empty() {
            return Err(Error::InvalidAddress(address.into()));
        }
        match addr.strip_prefix('@') {
            Some(name) => Ok(Box::new(connect_abstract(name)?)),
            None => Ok(Box::new(UnixStream::connect(addr)?)),
        }
    } else {
        Err(Error::InvalidAddress(address.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_unknown_scheme() {
        assert!(matches!(
            connect("exec:/bin/true"),
            Err(Error::InvalidAddress(_))
        ));
        assert!(matches!(connect("unix:"), Err(Error::InvalidAddress(_))));
    }

    #[test]
    fn test_connect_missing_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobody-home");
        let r = connect(&format!("unix:{}", path.display()));
        assert!(matches!(r, Err(Error::Io(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_peer_uid_of_socketpair() {
        let (a, _b) = UnixStream::pair().unwrap();
        let uid = unsafe { libc::getuid() };
        assert_eq!(Stream::peer_uid(&a), Some(uid));
    }
}
