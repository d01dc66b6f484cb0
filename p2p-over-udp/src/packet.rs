//! Wire-format definitions for multiplexed datagrams and stream segments.
//!
//! Every datagram exchanged over a shared real UDP socket starts with a
//! [`MuxHeader`].  When the [`mux_flags::STREAM`] bit is set the rest of the
//! datagram is an encapsulated [`Segment`]; otherwise it is the raw payload of
//! a virtual datagram socket.
//!
//! No I/O happens here.
//!
//! # Multiplexing header
//!
//! Little-endian, [`MUX_HEADER_LEN`] = 6 bytes.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |       Destination vport       |         Source vport          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          Type flags           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! # Stream segment header
//!
//! Big-endian, [`SEGMENT_HEADER_LEN`] = 31 bytes.
//!
//! ```text
//! magic(4) | length(4) | seq(8) | ack(8) | src_port(2) | dst_port(2)
//!          | checksum(2) | flags(1) | payload ...
//! ```

/// Bits of the multiplexing header's `type_flags` field.
pub mod mux_flags {
    /// Plain virtual datagram.
    pub const DATAGRAM: u16 = 1 << 0;
    /// Encapsulated stream segment follows.
    pub const STREAM: u16 = 1 << 1;
}

/// Bit-flag constants for the segment `flags` field.
pub mod flags {
    /// Sender has no more data (reserved; the protocol only resets).
    pub const FIN: u8 = 1 << 0;
    /// Handshake open.
    pub const SYN: u8 = 1 << 1;
    /// Abort the connection.
    pub const RST: u8 = 1 << 2;
    /// Segment carries data to push to the application.
    pub const PSH: u8 = 1 << 3;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 1 << 4;
    pub const URG: u8 = 1 << 5;
    pub const ECE: u8 = 1 << 6;
    pub const CWR: u8 = 1 << 7;
}

/// Byte length of the multiplexing header.
pub const MUX_HEADER_LEN: usize = 6;

/// Byte length of the fixed-size stream segment header.
pub const SEGMENT_HEADER_LEN: usize = 31;

/// Signature identifying a stream segment ("U2S0").
pub const SEGMENT_MAGIC: u32 = 0x5532_5330;

/// Largest UDP payload we are willing to put on the wire.
pub const SAFE_UDP_PAYLOAD: usize = 1400;

/// Largest payload a virtual datagram socket may send in one call.
pub const MAX_DATAGRAM_PAYLOAD: usize = SAFE_UDP_PAYLOAD - MUX_HEADER_LEN;

/// Largest payload carried by a single stream segment.
pub const MAX_SEGMENT_PAYLOAD: usize = MAX_DATAGRAM_PAYLOAD - SEGMENT_HEADER_LEN;

// Byte offsets of each field within the serialised segment header.
const OFF_MAGIC: usize = 0;
const OFF_LENGTH: usize = 4;
const OFF_SEQ: usize = 8;
const OFF_ACK: usize = 16;
const OFF_SRC_PORT: usize = 24;
const OFF_DST_PORT: usize = 26;
const OFF_CHECKSUM: usize = 28;
const OFF_FLAGS: usize = 30;

// ---------------------------------------------------------------------------
// Multiplexing header
// ---------------------------------------------------------------------------

/// Header prefixed to every datagram on a shared real socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxHeader {
    pub dst_vport: u16,
    pub src_vport: u16,
    /// Bitmask of [`mux_flags`] constants.
    pub flags: u16,
}

impl MuxHeader {
    /// Header for a plain virtual datagram.
    pub fn datagram(dst_vport: u16, src_vport: u16) -> Self {
        Self {
            dst_vport,
            src_vport,
            flags: mux_flags::DATAGRAM,
        }
    }

    /// Header for an encapsulated stream segment.
    pub fn stream(dst_vport: u16, src_vport: u16) -> Self {
        Self {
            dst_vport,
            src_vport,
            flags: mux_flags::STREAM,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.flags & mux_flags::STREAM != 0
    }

    /// Prefix `payload` with this header.
    pub fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MUX_HEADER_LEN + payload.len());
        buf.extend_from_slice(&self.dst_vport.to_le_bytes());
        buf.extend_from_slice(&self.src_vport.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    /// Split a raw datagram into its header and the bytes that follow.
    pub fn decode(buf: &[u8]) -> Result<(Self, &[u8]), PacketError> {
        if buf.len() < MUX_HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }
        let header = Self {
            dst_vport: u16::from_le_bytes([buf[0], buf[1]]),
            src_vport: u16::from_le_bytes([buf[2], buf[3]]),
            flags: u16::from_le_bytes([buf[4], buf[5]]),
        };
        Ok((header, &buf[MUX_HEADER_LEN..]))
    }
}

// ---------------------------------------------------------------------------
// Stream segment
// ---------------------------------------------------------------------------

/// Fixed-size stream segment header, in host byte order.
///
/// `length` and `checksum` are not stored: [`Segment::encode`] computes them
/// from the payload and [`Segment::decode`] validates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Sequence number of the first payload byte (or of the SYN).
    pub seq: u64,
    /// Next sequence number expected from the peer.
    pub ack: u64,
    pub src_port: u16,
    pub dst_port: u16,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

/// A complete stream segment: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: SegmentHeader,
    pub payload: Vec<u8>,
}

impl Segment {
    /// Build a segment with the given header fields.
    pub fn new(seq: u64, ack: u64, src_port: u16, dst_port: u16, flags: u8, payload: Vec<u8>) -> Self {
        Self {
            header: SegmentHeader {
                seq,
                ack,
                src_port,
                dst_port,
                flags,
            },
            payload,
        }
    }

    pub fn has(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }

    /// Sequence space consumed by this segment (payload plus one for SYN).
    pub fn seq_len(&self) -> u64 {
        let syn = u64::from(self.has(flags::SYN));
        self.payload.len() as u64 + syn
    }

    /// Serialise this segment into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let payload_len = self.payload.len();
        let mut buf = vec![0u8; SEGMENT_HEADER_LEN + payload_len];

        buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&SEGMENT_MAGIC.to_be_bytes());
        buf[OFF_LENGTH..OFF_LENGTH + 4].copy_from_slice(&(payload_len as u32).to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 8].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 8].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_SRC_PORT..OFF_SRC_PORT + 2].copy_from_slice(&self.header.src_port.to_be_bytes());
        buf[OFF_DST_PORT..OFF_DST_PORT + 2].copy_from_slice(&self.header.dst_port.to_be_bytes());
        buf[OFF_FLAGS] = self.header.flags;
        buf[SEGMENT_HEADER_LEN..].copy_from_slice(&self.payload);

        // Checksum field is still zero here.
        let csum = internet_checksum(&buf);
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 2].copy_from_slice(&csum.to_be_bytes());

        buf
    }

    /// Parse a [`Segment`] from the bytes following a multiplexing header.
    ///
    /// Magic and checksum are verified before any other field is trusted.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < SEGMENT_HEADER_LEN {
            return Err(PacketError::BufferTooShort);
        }

        let magic = u32::from_be_bytes(read_array(buf, OFF_MAGIC));
        if magic != SEGMENT_MAGIC {
            return Err(PacketError::BadMagic);
        }

        let checksum = u16::from_be_bytes(read_array(buf, OFF_CHECKSUM));
        let mut scratch = buf.to_vec();
        scratch[OFF_CHECKSUM..OFF_CHECKSUM + 2].fill(0);
        if internet_checksum(&scratch) != checksum {
            return Err(PacketError::ChecksumFailed);
        }

        let length = u32::from_be_bytes(read_array(buf, OFF_LENGTH)) as usize;
        if buf.len() != SEGMENT_HEADER_LEN + length {
            return Err(PacketError::LengthMismatch);
        }

        Ok(Segment {
            header: SegmentHeader {
                seq: u64::from_be_bytes(read_array(buf, OFF_SEQ)),
                ack: u64::from_be_bytes(read_array(buf, OFF_ACK)),
                src_port: u16::from_be_bytes(read_array(buf, OFF_SRC_PORT)),
                dst_port: u16::from_be_bytes(read_array(buf, OFF_DST_PORT)),
                flags: buf[OFF_FLAGS],
            },
            payload: buf[SEGMENT_HEADER_LEN..].to_vec(),
        })
    }

    /// Encode and prefix with a stream multiplexing header.
    pub fn encapsulate(&self, dst_vport: u16, src_vport: u16) -> Vec<u8> {
        MuxHeader::stream(dst_vport, src_vport).frame(&self.encode())
    }
}

/// Copy `N` bytes starting at `off`.  Callers have checked the length.
fn read_array<const N: usize>(buf: &[u8], off: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[off..off + N]);
    out
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("buffer too short to contain a header")]
    BufferTooShort,
    #[error("length field does not match remaining bytes")]
    LengthMismatch,
    #[error("segment signature mismatch")]
    BadMagic,
    #[error("checksum verification failed")]
    ChecksumFailed,
}

/// Compute the Internet checksum (RFC 1071) over `data`.
///
/// The caller must zero any checksum field within `data` first.
fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    // Odd trailing byte: pad with a zero byte on the right.
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }

    !(sum as u16)
}
