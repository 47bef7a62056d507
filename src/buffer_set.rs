//! Buffer set for state machine operations.

/// Buffers shared between a connection and the state machine it is driving.
#[derive(Debug)]
pub struct BufferSet {
    /// Read buffer for the payload of the last message
    pub read_buffer: Vec<u8>,
    /// Write buffer for outgoing messages
    pub write_buffer: Vec<u8>,
    /// Type byte of the last message read
    pub type_byte: u8,
    /// Bytes of a message not yet fully received
    pub(crate) partial: Vec<u8>,
}

impl BufferSet {
    /// Create a new buffer set.
    pub fn new() -> Self {
        Self {
            read_buffer: Vec::with_capacity(8192),
            write_buffer: Vec::with_capacity(8192),
            type_byte: 0,
            partial: Vec::new(),
        }
    }
}

impl Default for BufferSet {
    fn default() -> Self {
        Self::new()
    }
}
