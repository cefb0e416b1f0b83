//! # Wire Format
//!
//! One UDP datagram carries one packet: a small header followed by the raw
//! payload (little-endian `f32` samples for source packets, codec output for
//! repair packets).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=1|R|reserved |          Payload Length (16)          | ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |              Sequence Number (VarInt, 1-8 bytes)              |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                Block Number (VarInt, 1-8 bytes)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Block Index (16)       |        N Source (16)          |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        N Repair (16)          |          Payload ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `R` is the role bit (0 = source, 1 = repair). Multi-byte fixed fields are
//! big-endian.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;

use crate::error::{Error, Result};
use crate::packet::{Packet, Role};

// ─── Constants ───────────────────────────────────────────────────────────────

pub const PROTOCOL_VERSION: u8 = 1;

/// 1 (flags) + 2 (payload len) + 1 + 1 (min varints) + 6 (block geometry).
pub const MIN_HEADER_SIZE: usize = 11;

/// 1 + 2 + 8 + 8 + 6.
pub const MAX_HEADER_SIZE: usize = 25;

pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

// ─── VarInt (QUIC-style, RFC 9000 §16) ──────────────────────────────────────

/// A 62-bit variable-length integer encoded in 1, 2, 4, or 8 bytes.
///
/// - `0x00..0x3F` → 1 byte, prefix `00`
/// - `0x40..0x3FFF` → 2 bytes, prefix `01`
/// - `0x4000..0x3FFF_FFFF` → 4 bytes, prefix `10`
/// - above → 8 bytes, prefix `11`
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VarInt(u64);

impl VarInt {
    pub const MAX: u64 = (1 << 62) - 1;

    #[inline]
    pub fn new(val: u64) -> Option<Self> {
        (val <= Self::MAX).then_some(VarInt(val))
    }

    #[inline]
    pub fn value(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn encoded_len(self) -> usize {
        if self.0 < 0x40 {
            1
        } else if self.0 < 0x4000 {
            2
        } else if self.0 < 0x4000_0000 {
            4
        } else {
            8
        }
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        match self.encoded_len() {
            1 => buf.put_u8(self.0 as u8),
            2 => buf.put_u16(0x4000 | self.0 as u16),
            4 => buf.put_u32(0x8000_0000 | self.0 as u32),
            _ => buf.put_u64(0xC000_0000_0000_0000 | self.0),
        }
    }

    /// `None` if the buffer ends mid-value.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if !buf.has_remaining() {
            return None;
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return None;
        }
        let val = match len {
            1 => {
                buf.advance(1);
                (first & 0x3F) as u64
            }
            2 => (buf.get_u16() & 0x3FFF) as u64,
            4 => (buf.get_u32() & 0x3FFF_FFFF) as u64,
            _ => buf.get_u64() & 0x3FFF_FFFF_FFFF_FFFF,
        };
        Some(VarInt(val))
    }
}

impl fmt::Debug for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarInt({})", self.0)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ─── Packet Header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub role: Role,
    pub payload_len: u16,
    pub seq: VarInt,
    pub block: VarInt,
    pub index: u16,
    pub n_source: u16,
    pub n_repair: u16,
}

impl PacketHeader {
    /// Header describing `packet`. Fails if a field does not fit the wire.
    pub fn of(packet: &Packet) -> Result<Self> {
        let out_of_range = |what| Error::ConfigInvalid(format!("{what} exceeds wire range"));
        let payload_len = u16::try_from(packet.payload().len())
            .map_err(|_| out_of_range("payload length"))?;
        Ok(PacketHeader {
            version: PROTOCOL_VERSION,
            role: packet.role,
            payload_len,
            seq: VarInt::new(packet.seq).ok_or_else(|| out_of_range("sequence number"))?,
            block: VarInt::new(packet.block).ok_or_else(|| out_of_range("block number"))?,
            index: packet.index,
            n_source: packet.n_source,
            n_repair: packet.n_repair,
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        // Flags byte: VV R 00000
        let role_bit = matches!(self.role, Role::Repair) as u8;
        buf.put_u8(((self.version & 0x03) << 6) | (role_bit << 5));
        buf.put_u16(self.payload_len);
        self.seq.encode(buf);
        self.block.encode(buf);
        buf.put_u16(self.index);
        buf.put_u16(self.n_source);
        buf.put_u16(self.n_repair);
    }

    /// Decode and sanity-check a header. `None` on truncation, a foreign
    /// version, or block coordinates that cannot be valid.
    pub fn decode(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < MIN_HEADER_SIZE {
            return None;
        }
        let flags = buf.get_u8();
        let version = (flags >> 6) & 0x03;
        if version != PROTOCOL_VERSION {
            return None;
        }
        let role = if (flags >> 5) & 1 == 1 {
            Role::Repair
        } else {
            Role::Source
        };
        let payload_len = buf.get_u16();
        let seq = VarInt::decode(buf)?;
        let block = VarInt::decode(buf)?;
        if buf.remaining() < 6 {
            return None;
        }
        let header = PacketHeader {
            version,
            role,
            payload_len,
            seq,
            block,
            index: buf.get_u16(),
            n_source: buf.get_u16(),
            n_repair: buf.get_u16(),
        };
        header.is_consistent().then_some(header)
    }

    pub fn encoded_len(&self) -> usize {
        1 + 2 + self.seq.encoded_len() + self.block.encoded_len() + 6
    }

    fn is_consistent(&self) -> bool {
        let index = self.index as u32;
        let n_source = self.n_source as u32;
        let n_repair = self.n_repair as u32;
        if n_source == 0 {
            return false;
        }
        match self.role {
            Role::Source => index < n_source,
            Role::Repair => index >= n_source && index < n_source + n_repair,
        }
    }
}

// ─── Datagram helpers ───────────────────────────────────────────────────────

/// Append header and payload of `packet` to `out`.
pub fn encode_packet(packet: &Packet, out: &mut BytesMut) -> Result<()> {
    let header = PacketHeader::of(packet)?;
    out.reserve(header.encoded_len() + packet.payload().len());
    header.encode(out);
    out.extend_from_slice(packet.payload());
    Ok(())
}

/// Split a datagram into its header and payload. The datagram must carry
/// exactly `payload_len` bytes after the header.
pub fn decode_datagram(datagram: &[u8]) -> Option<(PacketHeader, &[u8])> {
    let mut cursor = datagram;
    let header = PacketHeader::decode(&mut cursor)?;
    (cursor.len() == header.payload_len as usize).then_some((header, cursor))
}
