//! Inbound segment reassembly.
//!
//! [`ReceiveBuffer`] holds everything a stream connection has received but
//! not yet handed to the application:
//!
//! ```text
//!     base               ack_number()
//!      │                      │
//!  ────┼──────────────────────┼────────┬──────┬────────▶ seq space
//!      │ <── available ──────▶│  gap   │ ooo  │
//! ```
//!
//! - Bytes below the contiguous end were already accepted; a segment that
//!   overlaps it is trimmed to its new part, one entirely below is dropped.
//! - Segments beyond the contiguous end are held by start sequence until
//!   the gap before them fills.
//! - A segment whose range would run past `u64::MAX` is dropped.
//! - Reads always start at `base`, so callers never see gaps or reordering.
//!
//! This module only manages state; ACKs are built by [`crate::stream`].

use std::collections::{BTreeMap, VecDeque};

/// Receive-side reassembly state for one connection.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    /// Reassembly boundary: first byte not yet delivered.
    base: u64,
    /// Bytes contiguous from `base`.
    ready: VecDeque<u8>,
    /// Out-of-order payloads keyed by start sequence.
    pending: BTreeMap<u64, Vec<u8>>,
}

impl ReceiveBuffer {
    /// Expect the first payload byte at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            ready: VecDeque::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes ready to read without a gap.
    pub fn available(&self) -> usize {
        self.ready.len()
    }

    /// Next sequence number expected from the peer.
    pub fn ack_number(&self) -> u64 {
        self.base.saturating_add(self.ready.len() as u64)
    }

    /// Out-of-order segments waiting for a gap to fill.
    #[cfg(test)]
    pub fn pending_segments(&self) -> usize {
        self.pending.len()
    }

    /// Store one segment and return how many bytes became newly available.
    ///
    /// Bytes already accepted are ignored.  Of two buffered copies starting
    /// at the same sequence the longer one is kept.
    pub fn on_segment(&mut self, seq: u64, payload: &[u8]) -> usize {
        let Some(end) = seq.checked_add(payload.len() as u64) else {
            return 0;
        };
        let ack = self.ack_number();
        if payload.is_empty() || end <= ack {
            return 0;
        }
        let (seq, payload) = if seq < ack {
            (ack, &payload[(ack - seq) as usize..])
        } else {
            (seq, payload)
        };
        match self.pending.get_mut(&seq) {
            Some(held) if held.len() >= payload.len() => {}
            Some(held) => *held = payload.to_vec(),
            None => {
                self.pending.insert(seq, payload.to_vec());
            }
        }

        let before = self.ready.len();
        while let Some(entry) = self.pending.first_entry() {
            let start = *entry.key();
            let ack = self.base.saturating_add(self.ready.len() as u64);
            if start > ack {
                break;
            }
            let data = entry.remove();
            let skip = (ack - start) as usize;
            if skip < data.len() {
                self.ready.extend(&data[skip..]);
            }
        }
        self.ready.len() - before
    }

    /// Copy up to `buf.len()` contiguous bytes starting at the boundary.
    ///
    /// With `peek` the bytes stay buffered; otherwise the boundary advances.
    pub fn read(&mut self, buf: &mut [u8], peek: bool) -> usize {
        let n = buf.len().min(self.ready.len());
        for (dst, src) in buf[..n].iter_mut().zip(self.ready.iter()) {
            *dst = *src;
        }
        if !peek {
            self.ready.drain(..n);
            self.base += n as u64;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_segment_becomes_available() {
        let mut r = ReceiveBuffer::new(100);
        assert_eq!(r.on_segment(100, b"hello"), 5);
        assert_eq!(r.ack_number(), 105);
        assert_eq!(r.available(), 5);
    }

    #[test]
    fn out_of_order_waits_for_gap() {
        // seq 0, seq 20, seq 10, ten bytes each.
        let mut r = ReceiveBuffer::new(0);
        assert_eq!(r.on_segment(0, &[b'a'; 10]), 10);
        assert_eq!(r.on_segment(20, &[b'c'; 10]), 0);
        assert_eq!(r.ack_number(), 10);
        assert_eq!(r.pending_segments(), 1);

        assert_eq!(r.on_segment(10, &[b'b'; 10]), 20);
        assert_eq!(r.ack_number(), 30);

        let mut buf = [0u8; 64];
        let n = r.read(&mut buf, false);
        assert_eq!(n, 30);
        assert_eq!(&buf[..10], &[b'a'; 10]);
        assert_eq!(&buf[10..20], &[b'b'; 10]);
        assert_eq!(&buf[20..30], &[b'c'; 10]);
    }

    #[test]
    fn replay_after_delivery_is_ignored() {
        let mut r = ReceiveBuffer::new(0);
        r.on_segment(0, b"abc");
        let mut buf = [0u8; 3];
        r.read(&mut buf, false);
        assert_eq!(r.base(), 3);

        assert_eq!(r.on_segment(0, b"abc"), 0);
        assert_eq!(r.base(), 3);
        assert_eq!(r.ack_number(), 3);
        assert_eq!(r.available(), 0);
    }

    #[test]
    fn duplicate_out_of_order_copy_ignored() {
        let mut r = ReceiveBuffer::new(0);
        r.on_segment(5, b"world");
        r.on_segment(5, b"world");
        assert_eq!(r.pending_segments(), 1);
        assert_eq!(r.on_segment(0, b"hello"), 10);
    }

    #[test]
    fn partial_read_keeps_remainder_at_boundary() {
        let mut r = ReceiveBuffer::new(0);
        r.on_segment(0, b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(r.read(&mut buf, false), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(r.base(), 5);
        assert_eq!(r.available(), 6);

        let mut rest = [0u8; 16];
        assert_eq!(r.read(&mut rest, false), 6);
        assert_eq!(&rest[..6], b" world");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut r = ReceiveBuffer::new(7);
        r.on_segment(7, b"ab");
        r.on_segment(9, b"cd");

        let mut buf = [0u8; 3];
        assert_eq!(r.read(&mut buf, true), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(r.available(), 4);

        let mut all = [0u8; 4];
        assert_eq!(r.read(&mut all, false), 4);
        assert_eq!(&all, b"abcd");
    }

    #[test]
    fn read_never_crosses_gap() {
        let mut r = ReceiveBuffer::new(0);
        r.on_segment(0, b"ab");
        r.on_segment(4, b"ef");
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf, false), 2);
        assert_eq!(r.read(&mut buf, false), 0);
        assert_eq!(r.on_segment(2, b"cd"), 4);
        assert_eq!(r.read(&mut buf, false), 4);
        assert_eq!(&buf[..4], b"cdef");
    }

    #[test]
    fn overlapping_segments_deliver_each_byte_once() {
        let mut r = ReceiveBuffer::new(0);
        assert_eq!(r.on_segment(5, b"xxxxx"), 0);
        assert_eq!(r.on_segment(0, b"aaaaaaaaaa"), 10);
        assert_eq!(r.pending_segments(), 0);
        assert_eq!(r.on_segment(10, b"bbbbb"), 5);

        let mut buf = [0u8; 32];
        let n = r.read(&mut buf, false);
        assert_eq!(&buf[..n], b"aaaaaaaaaabbbbb");

        assert_eq!(r.on_segment(15, b"ccccc"), 5);
        let n = r.read(&mut buf, false);
        assert_eq!(&buf[..n], b"ccccc");
        assert_eq!(r.base(), 20);
    }

    #[test]
    fn segment_straddling_boundary_is_trimmed() {
        let mut r = ReceiveBuffer::new(0);
        r.on_segment(0, b"abcd");
        assert_eq!(r.on_segment(2, b"cdef"), 2);
        assert_eq!(r.ack_number(), 6);

        let mut buf = [0u8; 8];
        let n = r.read(&mut buf, false);
        assert_eq!(&buf[..n], b"abcdef");
    }

    #[test]
    fn range_past_sequence_space_is_dropped() {
        let mut r = ReceiveBuffer::new(u64::MAX - 2);
        assert_eq!(r.on_segment(u64::MAX - 2, b"abcd"), 0);
        assert_eq!(r.on_segment(u64::MAX, b"z"), 0);
        assert_eq!(r.pending_segments(), 0);
        assert_eq!(r.on_segment(u64::MAX - 2, b"ab"), 2);
        assert_eq!(r.ack_number(), u64::MAX);
    }
}
