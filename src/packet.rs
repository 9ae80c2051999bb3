//! Packet records shared by the encoder and decoder windows

use crate::buffer::GrowingBuffer;
use crate::error::{Result, SiameseError};
use crate::params::MAX_PACKET_BYTES;
use crate::serializers::{read_length, write_length};

pub use crate::serializers::RecoveryMetadata;

/// One stored original packet: `[length field][payload]`
///
/// The buffer is empty while the packet is unknown (decoder-side loss).
/// While a solve is staged, a lost slot's `column` field is repurposed to
/// hold its recovery matrix column index; it is restored when the column is
/// recovered or the window shifts.
#[derive(Debug, Default, Clone)]
pub struct OriginalPacket {
    pub buffer: GrowingBuffer,
    /// Cached size of the length field at the front of `buffer`
    pub header_bytes: usize,
    pub column: u32,
}

impl OriginalPacket {
    /// Fill this slot from application payload; returns the header size
    pub fn initialize(&mut self, column: u32, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() || payload.len() > MAX_PACKET_BYTES {
            return Err(SiameseError::InvalidInput);
        }

        let mut data = Vec::with_capacity(payload.len() + 3);
        let header_bytes = write_length(payload.len() as u32, &mut data);
        data.extend_from_slice(payload);

        self.buffer = GrowingBuffer::from_vec(data);
        self.header_bytes = header_bytes;
        self.column = column;
        Ok(header_bytes)
    }

    /// Adopt an already length-prefixed buffer, validating the length field
    pub fn initialize_prefixed(&mut self, column: u32, data: Vec<u8>) -> Result<usize> {
        let (length, header_bytes) = read_length(&data)?;
        if header_bytes + length as usize != data.len() {
            return Err(SiameseError::InvalidInput);
        }

        self.buffer = GrowingBuffer::from_vec(data);
        self.header_bytes = header_bytes;
        self.column = column;
        Ok(header_bytes)
    }

    /// Whether this slot holds data
    #[inline]
    pub fn is_present(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Payload view (without the length field)
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buffer.as_slice()[self.header_bytes..]
    }

    /// Release the slot back to the unknown state
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.header_bytes = 0;
        self.column = 0;
    }
}

/// An original recovered by the decoder, handed back to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPacket {
    pub column: u32,
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_prefixes_length() {
        let mut packet = OriginalPacket::default();
        let header = packet.initialize(5, &[9, 8, 7]).unwrap();
        assert_eq!(header, 1);
        assert_eq!(packet.buffer.as_slice(), &[3, 9, 8, 7]);
        assert_eq!(packet.payload(), &[9, 8, 7]);
        assert_eq!(packet.column, 5);
    }

    #[test]
    fn test_initialize_rejects_empty_and_oversized() {
        let mut packet = OriginalPacket::default();
        assert!(packet.initialize(0, &[]).is_err());
        let big = vec![0u8; MAX_PACKET_BYTES + 1];
        assert!(packet.initialize(0, &big).is_err());
    }

    #[test]
    fn test_initialize_prefixed_validates_length() {
        let mut packet = OriginalPacket::default();
        // length says 3 but only 2 payload bytes follow
        assert!(packet.initialize_prefixed(0, vec![3, 1, 2]).is_err());
        assert!(packet.initialize_prefixed(0, vec![2, 1, 2]).is_ok());
        assert_eq!(packet.payload(), &[1, 2]);
    }
}
