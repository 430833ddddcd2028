use std::io;

/// Errors produced by the transport layer.
///
/// Construction and address resolution return these directly. Failures detected
/// while driving an already constructed transport are reported to the owning
/// connection through [`ConnectionHandler::transport_error`] instead.
///
/// [`ConnectionHandler::transport_error`]: crate::ConnectionHandler::transport_error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("transport is disconnected")]
    Disconnected,
    #[error("watch was invalidated before it was handled")]
    InvalidWatch,
    #[error("authentication rejected: {0}")]
    AuthRejected(String),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("message of {size} bytes exceeds the limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("invalid transport address '{0}'")]
    InvalidAddress(String),
    #[error("timed out")]
    Timeout,
    #[error("transport already has a connection")]
    ConnectionAlreadySet,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns `true` if the error means the peer is gone and the link cannot be used again.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Disconnected => true,
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_disconnect() {
        assert!(Error::Disconnected.is_disconnect());
        assert!(Error::from(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(Error::from(io::Error::from(io::ErrorKind::ConnectionReset)).is_disconnect());
        assert!(!Error::from(io::Error::from(io::ErrorKind::WouldBlock)).is_disconnect());
        assert!(!Error::InvalidWatch.is_disconnect());
        assert!(!Error::Timeout.is_disconnect());
    }

    #[test]
    fn test_display() {
        let e = Error::MessageTooLarge { size: 10, max: 4 };
        assert_eq!(
            e.to_string(),
            "message of 10 bytes exceeds the limit of 4 bytes"
        );
        assert_eq!(
            Error::InvalidWatch.to_string(),
            "watch was invalidated before it was handled"
        );
        assert_eq!(
            Error::InvalidAddress("foo".into()).to_string(),
            "invalid transport address 'foo'"
        );
    }
}
