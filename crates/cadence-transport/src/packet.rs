//! # Packets
//!
//! A [`Packet`] is the unit that crosses the network: role, per-role sequence
//! number, FEC block coordinates, the address pair and a pooled payload.
//!
//! Packets are owned exclusively while being built or handed to a sink, then
//! frozen into a [`PacketPtr`] when several stages (FEC encoder, outbound
//! queue) need to read them. The pool slot and buffer are released when the
//! last reference goes away.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::address::Address;
use crate::error::Result;
use crate::pool::{PacketLease, PooledBuffer};

/// Bytes per encoded sample (`f32`, little-endian).
pub const SAMPLE_BYTES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    /// Original audio.
    Source,
    /// Redundancy for one FEC block.
    Repair,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Source => f.write_str("source"),
            Role::Repair => f.write_str("repair"),
        }
    }
}

pub type PacketPtr = Arc<Packet>;

pub struct Packet {
    pub role: Role,
    /// Strictly increasing within the role's stream.
    pub seq: u64,
    /// FEC block; `seq / n_source` for source packets.
    pub block: u64,
    /// Slot within the block. Source packets use `0..n_source`, repair
    /// packets `n_source..n_source + n_repair`.
    pub index: u16,
    pub n_source: u16,
    pub n_repair: u16,
    pub src: Option<Address>,
    pub dst: Option<Address>,
    payload: PooledBuffer,
    _lease: PacketLease,
}

impl Packet {
    pub(crate) fn new(role: Role, payload: PooledBuffer, lease: PacketLease) -> Self {
        Packet {
            role,
            seq: 0,
            block: 0,
            index: 0,
            n_source: 0,
            n_repair: 0,
            src: None,
            dst: None,
            payload,
            _lease: lease,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut PooledBuffer {
        &mut self.payload
    }

    /// Replace the payload with `data`.
    pub fn set_payload(&mut self, data: &[u8]) -> Result<()> {
        self.payload.clear();
        self.payload.extend_from_slice(data)
    }

    /// Append samples to the payload as little-endian `f32`.
    pub fn push_samples(&mut self, samples: &[f32]) -> Result<()> {
        let start = self.payload.len();
        self.payload.resize(start + samples.len() * SAMPLE_BYTES)?;
        encode_samples(samples, &mut self.payload.as_mut_slice()[start..]);
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.payload.len() / SAMPLE_BYTES
    }

    /// Decode the payload into `out`, returning how many samples were written.
    pub fn read_samples(&self, out: &mut [f32]) -> usize {
        decode_samples(&self.payload, out)
    }

    pub fn is_source(&self) -> bool {
        self.role == Role::Source
    }

    pub fn into_ptr(self) -> PacketPtr {
        Arc::new(self)
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("role", &self.role)
            .field("seq", &self.seq)
            .field("block", &self.block)
            .field("index", &self.index)
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ─── Sample conversion ──────────────────────────────────────────────────────

/// Write `samples` into `out` as little-endian `f32`. `out` must hold
/// `samples.len() * SAMPLE_BYTES` bytes.
pub fn encode_samples(samples: &[f32], out: &mut [u8]) {
    for (chunk, sample) in out.chunks_exact_mut(SAMPLE_BYTES).zip(samples) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
}

/// Decode little-endian `f32` samples from `bytes` into `out`.
pub fn decode_samples(bytes: &[u8], out: &mut [f32]) -> usize {
    let mut written = 0;
    for (sample, chunk) in out.iter_mut().zip(bytes.chunks_exact(SAMPLE_BYTES)) {
        *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        written += 1;
    }
    written
}
