//! Stream packet format
//!
//! ```text
//! ┌──────────┬──────────┬──────────────┬─────────────┐
//! │ track id │ sequence │ timestamp us │ payload ... │
//! │  u32 BE  │  u32 BE  │    u64 BE    │             │
//! └──────────┴──────────┴──────────────┴─────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::protocol::TrackId;

/// Header length in bytes
pub const HEADER_SIZE: usize = 16;

/// One datagram of a track's stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPacket {
    pub track_id: TrackId,
    pub sequence: u32,
    /// Offset from stream start
    pub timestamp_us: u64,
    pub payload: Bytes,
}

impl StreamPacket {
    pub fn new(track_id: TrackId, sequence: u32, timestamp_us: u64, payload: Bytes) -> Self {
        Self {
            track_id,
            sequence,
            timestamp_us,
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, NetworkError> {
        let len = self.encoded_len();
        if len > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        buf.put_u32(self.track_id);
        buf.put_u32(self.sequence);
        buf.put_u64(self.timestamp_us);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::InvalidPacket);
        }

        let mut buf = data;
        let track_id = buf.get_u32();
        let sequence = buf.get_u32();
        let timestamp_us = buf.get_u64();
        Ok(Self {
            track_id,
            sequence,
            timestamp_us,
            payload: Bytes::copy_from_slice(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let packet = StreamPacket::new(7, 2, 0x0102, Bytes::from_static(b"abc"));
        let encoded = packet.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE + 3);
        assert_eq!(&encoded[..4], &[0, 0, 0, 7]);
        assert_eq!(&encoded[4..8], &[0, 0, 0, 2]);
        assert_eq!(&encoded[14..16], &[0x01, 0x02]);
        assert_eq!(StreamPacket::decode(&encoded).unwrap(), packet);
    }

    #[test]
    fn test_rejects_short_and_oversized() {
        assert!(matches!(
            StreamPacket::decode(&[0u8; HEADER_SIZE - 1]),
            Err(NetworkError::InvalidPacket)
        ));

        let big = StreamPacket::new(1, 0, 0, Bytes::from(vec![0u8; MAX_PACKET_SIZE]));
        assert!(matches!(big.encode(), Err(NetworkError::PacketTooLarge(_))));
    }

    #[test]
    fn test_empty_payload() {
        let decoded = StreamPacket::decode(&[0u8; HEADER_SIZE]).unwrap();
        assert!(decoded.payload.is_empty());
    }
}
