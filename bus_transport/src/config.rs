/// `TransportConfig` holds the tunables shared by every transport instance.
///
/// Examples:
///
/// ```rust
/// let c = bus_transport::TransportConfig::default();
/// assert_eq!(c.read_chunk_size, 2048);
/// assert_eq!(c.max_message_size, 32 * 1024 * 1024);
/// assert_eq!(c.max_auth_line, 16 * 1024);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Bytes requested from the socket per read
    pub read_chunk_size: usize,
    /// Largest frame the loader accepts before declaring the stream corrupt
    pub max_message_size: usize,
    /// Longest authentication line accepted from the peer
    pub max_auth_line: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            read_chunk_size: 2048,
            max_message_size: 32 * 1024 * 1024,
            max_auth_line: 16 * 1024,
        }
    }
}
