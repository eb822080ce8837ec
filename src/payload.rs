//! Payload type carried through the channel
//!
//! A payload is an opaque, reference-counted buffer of bytes tagged with the
//! stream it belongs to. `bytes::Bytes` makes clones cheap: every output
//! connection a payload fans out to holds a reference to the same allocation.
//! A payload is immutable once published by a connection.

use bytes::Bytes;

/// An opaque media payload tagged with its stream identifier
///
/// `sequence` increases monotonically per stream on the wire and is
/// informational only; the router never inspects or reorders on it.
#[derive(Debug, Clone)]
pub struct Payload {
    /// Identifier of the stream this payload belongs to
    pub stream_identifier: u16,
    /// Wire sequence number (informational)
    pub sequence: u64,
    /// Payload bytes (zero-copy via reference counting)
    pub data: Bytes,
}

impl Payload {
    /// Create a new payload
    pub fn new(stream_identifier: u16, sequence: u64, data: Bytes) -> Self {
        Self {
            stream_identifier,
            sequence,
            data,
        }
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_size() {
        let payload = Payload::new(7, 42, Bytes::from_static(b"abcd"));
        assert_eq!(payload.stream_identifier, 7);
        assert_eq!(payload.sequence, 42);
        assert_eq!(payload.size(), 4);
    }

    #[test]
    fn test_clone_shares_data() {
        let payload = Payload::new(1, 0, Bytes::from(vec![0u8; 1024]));
        let copy = payload.clone();

        // Bytes is reference-counted: both handles see the same allocation
        assert_eq!(copy.data.as_ptr(), payload.data.as_ptr());
    }
}
