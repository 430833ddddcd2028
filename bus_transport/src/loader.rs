//! Message framing.
//!
//! Messages travel as NUL-terminated byte strings. The [`MessageLoader`] owns the
//! receive buffer of a transport: the transport appends whatever it read from the
//! socket and pulls complete messages out. It never looks inside a message.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Compact the buffer once at least this much has been consumed
const MIN_COMPACT: usize = 4096;

/// A single message body, without its terminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    body: Vec<u8>,
}

impl Message {
    /// Wrap `body` as a message. The body must be non-empty and free of NUL bytes.
    pub fn new<B: Into<Vec<u8>>>(body: B) -> Result<Self> {
        let body = body.into();
        if body.is_empty() {
            return Err(Error::InvalidFrame("empty message".into()));
        }
        if body.contains(&0) {
            return Err(Error::InvalidFrame("message contains a NUL byte".into()));
        }
        Ok(Message { body })
    }

    /// Serialize `value` as the JSON body of a new message.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Message::new(serde_json::to_vec(value)?)
    }

    /// Deserialize the body as JSON.
    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// The bytes to put on the wire, terminator included.
    pub fn to_frame(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.body.len() + 1);
        bytes.extend_from_slice(&self.body);
        bytes.push(0);
        bytes
    }
}

/// Result of scanning a buffer for one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    /// A complete frame was found
    Complete {
        /// The frame bytes (without the terminator)
        message: Vec<u8>,
        /// Number of bytes consumed, terminator included
        consumed: usize,
    },
    /// No terminator yet
    Incomplete,
    /// The buffer can never yield a valid frame
    Invalid {
        /// Description of the problem
        error: String,
    },
}

/// Scan `buf` for one NUL-terminated frame of at most `max_size` bytes.
///
/// ```
/// use bus_transport::loader::{parse_frame, ParseResult};
///
/// let buf = b"hello\0world";
/// match parse_frame(buf, 1024) {
///     ParseResult::Complete { message, consumed } => {
///         assert_eq!(message, b"hello");
///         assert_eq!(consumed, 6);
///     }
///     _ => panic!("Expected complete frame"),
/// }
/// ```
pub fn parse_frame(buf: &[u8], max_size: usize) -> ParseResult {
    match buf.iter().position(|&b| b == 0) {
        Some(0) => ParseResult::Invalid {
            error: "empty message".to_string(),
        },
        Some(pos) if pos > max_size => ParseResult::Invalid {
            error: format!("message of {} bytes exceeds limit of {}", pos, max_size),
        },
        Some(pos) => ParseResult::Complete {
            message: buf[..pos].to_vec(),
            consumed: pos + 1,
        },
        None if buf.len() > max_size => ParseResult::Invalid {
            error: format!(
                "unterminated message of more than {} bytes",
                max_size
            ),
        },
        None => ParseResult::Incomplete,
    }
}

/// Accumulates raw bytes and yields complete messages.
#[derive(Debug)]
pub struct MessageLoader {
    buffer: Vec<u8>,
    read_pos: usize,
    /// Bytes past `read_pos` already known to hold no terminator
    scan_pos: usize,
    max_message_size: usize,
    corrupted: Option<String>,
}

impl MessageLoader {
    pub fn new(max_message_size: usize) -> Self {
        MessageLoader {
            buffer: Vec::new(),
            read_pos: 0,
            scan_pos: 0,
            max_message_size,
            corrupted: None,
        }
    }

    /// Append bytes read from the stream. Ignored once the loader is corrupted.
    pub fn append(&mut self, data: &[u8]) {
        if self.corrupted.is_some() {
            return;
        }
        if self.read_pos >= MIN_COMPACT && self.read_pos > self.buffer.len() / 2 {
            self.buffer.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.buffer.extend_from_slice(data);
    }

    /// Take the next complete message, if any.
    ///
    /// Returns `None` when more bytes are needed or the stream turned out to
    /// be corrupt; check [`MessageLoader::is_corrupted`] to tell them apart.
    pub fn pop_message(&mut self) -> Option<Message> {
        if self.corrupted.is_some() {
            return None;
        }

        let pending = &self.buffer[self.read_pos..];
        let start = self.scan_pos.min(pending.len());
        let result = match pending[start..].iter().position(|&b| b == 0) {
            Some(offset) => parse_frame(&pending[..=start + offset], self.max_message_size),
            None if pending.len() > self.max_message_size => {
                parse_frame(pending, self.max_message_size)
            }
            None => {
                self.scan_pos = pending.len();
                return None;
            }
        };

        match result {
            ParseResult::Complete { message, consumed } => {
                self.read_pos += consumed;
                self.scan_pos = 0;
                if self.read_pos == self.buffer.len() {
                    self.buffer.clear();
                    self.read_pos = 0;
                }
                Some(Message { body: message })
            }
            ParseResult::Incomplete => None,
            ParseResult::Invalid { error } => {
                tracing::debug!(%error, "message stream corrupted");
                self.corrupted = Some(error);
                None
            }
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.is_some()
    }

    /// Why the loader gave up, if it did.
    pub fn corruption(&self) -> Option<&str> {
        self.corrupted.as_deref()
    }

    /// Bytes buffered but not yet returned as messages.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() - self.read_pos
    }
}
