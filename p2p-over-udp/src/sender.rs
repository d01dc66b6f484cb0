//! Outbound sequence numbering.
//!
//! [`Sender`] assigns sequence numbers to outgoing segments.  It does **not**
//! touch the socket or keep copies for retransmission; the retransmission
//! monitor owns the in-flight bytes.
//!
//! # Contract
//! - The SYN carries the initial sequence number (ISN) and consumes one
//!   sequence number, so the first data byte is `ISN + 1`.
//! - Data is sliced into segments of at most `max_payload` bytes, each
//!   stamped with the current `next_seq`, which then advances by its length.
//! - Sequence numbers are 64-bit and start below `u32::MAX`, so they never
//!   wrap during the life of a connection.

use rand::Rng;

use crate::packet::{flags, Segment};

/// Send-side sequence state for one connection.
#[derive(Debug, Clone)]
pub struct Sender {
    isn: u64,
    /// Sequence number of the next data byte.
    next_seq: u64,
    /// Our vport and the peer's, copied into every segment header.
    src_port: u16,
    dst_port: u16,
}

impl Sender {
    /// Create a [`Sender`] with a random initial sequence number.
    pub fn new(src_port: u16, dst_port: u16) -> Self {
        let isn = u64::from(rand::thread_rng().gen::<u32>());
        Self::with_isn(isn, src_port, dst_port)
    }

    pub fn with_isn(isn: u64, src_port: u16, dst_port: u16) -> Self {
        Self {
            isn,
            next_seq: isn + 1,
            src_port,
            dst_port,
        }
    }

    pub fn isn(&self) -> u64 {
        self.isn
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Handshake-open segment.
    pub fn syn(&self) -> Segment {
        Segment::new(self.isn, 0, self.src_port, self.dst_port, flags::SYN, Vec::new())
    }

    /// Handshake-open-acknowledgement answering a peer whose next expected
    /// sequence is `ack`.
    pub fn syn_ack(&self, ack: u64) -> Segment {
        Segment::new(
            self.isn,
            ack,
            self.src_port,
            self.dst_port,
            flags::SYN | flags::ACK,
            Vec::new(),
        )
    }

    /// Pure acknowledgement.
    pub fn ack(&self, ack: u64) -> Segment {
        Segment::new(self.next_seq, ack, self.src_port, self.dst_port, flags::ACK, Vec::new())
    }

    /// Reset aimed at the peer.
    pub fn rst(&self, ack: u64) -> Segment {
        Segment::new(
            self.next_seq,
            ack,
            self.src_port,
            self.dst_port,
            flags::RST | flags::ACK,
            Vec::new(),
        )
    }

    /// Slice `data` into sequenced data segments and advance `next_seq`.
    pub fn data_segments(&mut self, data: &[u8], ack: u64, max_payload: usize) -> Vec<Segment> {
        data.chunks(max_payload.max(1))
            .map(|chunk| {
                let seg = Segment::new(
                    self.next_seq,
                    ack,
                    self.src_port,
                    self.dst_port,
                    flags::PSH | flags::ACK,
                    chunk.to_vec(),
                );
                self.next_seq += chunk.len() as u64;
                seg
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syn_consumes_isn() {
        let s = Sender::with_isn(100, 1, 2);
        assert_eq!(s.syn().header.seq, 100);
        assert_eq!(s.next_seq(), 101);
    }

    #[test]
    fn random_isn_fits_u32() {
        let s = Sender::new(1, 2);
        assert!(s.isn() <= u64::from(u32::MAX));
    }

    #[test]
    fn data_is_sliced_and_sequenced() {
        let mut s = Sender::with_isn(0, 10, 20);
        let segs = s.data_segments(&[7u8; 25], 55, 10);
        let seqs: Vec<u64> = segs.iter().map(|seg| seg.header.seq).collect();
        let lens: Vec<usize> = segs.iter().map(|seg| seg.payload.len()).collect();
        assert_eq!(seqs, vec![1, 11, 21]);
        assert_eq!(lens, vec![10, 10, 5]);
        assert_eq!(s.next_seq(), 26);
        assert!(segs.iter().all(|seg| seg.header.ack == 55));
        assert!(segs.iter().all(|seg| seg.header.src_port == 10 && seg.header.dst_port == 20));
    }

    #[test]
    fn ack_carries_next_seq() {
        let mut s = Sender::with_isn(0, 1, 2);
        s.data_segments(b"abc", 0, 100);
        let ack = s.ack(9);
        assert_eq!(ack.header.seq, 4);
        assert_eq!(ack.header.ack, 9);
        assert!(ack.payload.is_empty());
        assert!(ack.has(flags::ACK));
    }
}
