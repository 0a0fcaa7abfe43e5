//! Jitter buffer for packet reordering
//!
//! Receivers join streams mid-flight, so the first packet seen fixes the
//! expected sequence. Sequence numbers are compared with wrapping
//! arithmetic.

use crate::network::packet::StreamPacket;

/// Reorders stream packets by sequence number
pub struct JitterBuffer {
    /// Buffer slots indexed by sequence modulo capacity
    slots: Vec<Option<StreamPacket>>,
    /// Mask for fast modulo (capacity is a power of 2)
    mask: usize,
    /// Next expected sequence number, `None` until the first packet
    next_sequence: Option<u32>,
    /// Minimum buffered packets before release
    min_delay: usize,
    level: usize,
    received: usize,
    lost: usize,
    late: usize,
}

impl JitterBuffer {
    /// Create a new jitter buffer. A capacity that is not a power of two is
    /// rounded up to one.
    pub fn new(capacity: usize, min_delay: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            slots,
            mask: capacity - 1,
            next_sequence: None,
            min_delay: min_delay.min(capacity),
            level: 0,
            received: 0,
            lost: 0,
            late: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert a packet; returns false if it arrived too late
    pub fn insert(&mut self, packet: StreamPacket) -> bool {
        let seq = packet.sequence;
        let next = *self.next_sequence.get_or_insert(seq);

        let ahead = seq.wrapping_sub(next) as i32;
        if ahead < 0 {
            self.late += 1;
            return false;
        }

        // Too far ahead: give up on the gap and jump forward
        if ahead as usize >= self.capacity() {
            let skip_to = seq.wrapping_sub(self.mask as u32);
            self.lost += skip_to.wrapping_sub(next) as usize;
            self.drain_before(skip_to);
            self.next_sequence = Some(skip_to);
        }

        let index = (seq as usize) & self.mask;
        if self.slots[index].replace(packet).is_none() {
            self.level += 1;
        }
        self.received += 1;
        true
    }

    /// Drop buffered packets older than `seq`
    fn drain_before(&mut self, seq: u32) {
        for slot in &mut self.slots {
            let stale = slot
                .as_ref()
                .map_or(false, |p| (p.sequence.wrapping_sub(seq) as i32) < 0);
            if stale {
                *slot = None;
                self.level -= 1;
            }
        }
    }

    /// Get the next packet once enough is buffered. A missing packet counts
    /// as lost and yields `None` for that slot.
    pub fn get_next(&mut self) -> Option<StreamPacket> {
        if self.level < self.min_delay.max(1) {
            return None;
        }
        self.force_get_next()
    }

    /// Get the next packet regardless of the buffer level
    pub fn force_get_next(&mut self) -> Option<StreamPacket> {
        let next = self.next_sequence?;
        let index = (next as usize) & self.mask;
        let packet = self.slots[index].take();

        if packet.is_some() {
            self.level -= 1;
        } else {
            self.lost += 1;
        }

        self.next_sequence = Some(next.wrapping_add(1));
        packet
    }

    /// Release everything still buffered, in order, skipping gaps
    pub fn drain(&mut self) -> Vec<StreamPacket> {
        let mut out = Vec::with_capacity(self.level);
        while self.level > 0 {
            if let Some(packet) = self.force_get_next() {
                out.push(packet);
            }
        }
        out
    }

    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.next_sequence = None;
        self.level = 0;
    }

    pub fn stats(&self) -> JitterBufferStats {
        JitterBufferStats {
            level: self.level,
            capacity: self.capacity(),
            received: self.received,
            lost: self.lost,
            late: self.late,
        }
    }
}

/// Jitter buffer statistics
#[derive(Debug, Clone)]
pub struct JitterBufferStats {
    pub level: usize,
    pub capacity: usize,
    pub received: usize,
    pub lost: usize,
    pub late: usize,
}

impl JitterBufferStats {
    pub fn loss_rate(&self) -> f32 {
        if self.received == 0 {
            0.0
        } else {
            self.lost as f32 / (self.received + self.lost) as f32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn packet(seq: u32) -> StreamPacket {
        StreamPacket::new(1, seq, seq as u64 * 10_000, Bytes::new())
    }

    #[test]
    fn test_jitter_buffer_reorders() {
        let mut jitter = JitterBuffer::new(16, 2);

        // First packet fixes the start
        jitter.insert(packet(100));
        jitter.insert(packet(102));
        jitter.insert(packet(101));

        assert_eq!(jitter.get_next().unwrap().sequence, 100);
        assert_eq!(jitter.get_next().unwrap().sequence, 101);

        // Not enough buffered for min_delay now
        assert!(jitter.get_next().is_none());
        assert_eq!(jitter.force_get_next().unwrap().sequence, 102);
    }

    #[test]
    fn test_late_packet_rejected() {
        let mut jitter = JitterBuffer::new(8, 1);
        jitter.insert(packet(5));
        jitter.get_next();
        assert!(!jitter.insert(packet(4)));
        assert_eq!(jitter.stats().late, 1);
    }

    #[test]
    fn test_gap_counts_as_lost() {
        let mut jitter = JitterBuffer::new(8, 1);
        jitter.insert(packet(0));
        jitter.insert(packet(2));

        let drained: Vec<u32> = jitter.drain().into_iter().map(|p| p.sequence).collect();
        assert_eq!(drained, vec![0, 2]);
        assert_eq!(jitter.stats().lost, 1);
    }

    #[test]
    fn test_wraparound() {
        let mut jitter = JitterBuffer::new(8, 1);
        jitter.insert(packet(u32::MAX));
        jitter.insert(packet(0));
        assert_eq!(jitter.get_next().unwrap().sequence, u32::MAX);
        assert_eq!(jitter.get_next().unwrap().sequence, 0);
    }

    #[test]
    fn test_far_ahead_packet_skips_gap() {
        let mut jitter = JitterBuffer::new(8, 1);
        jitter.insert(packet(0));
        jitter.insert(packet(20));

        let drained: Vec<u32> = jitter.drain().into_iter().map(|p| p.sequence).collect();
        assert_eq!(drained, vec![20]);
        assert!(jitter.stats().lost >= 13);
    }
}
