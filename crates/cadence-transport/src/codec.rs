//! # FEC Block Codec
//!
//! Block erasure coding over groups of `n_source` source packets and
//! `n_repair` repair packets.
//!
//! - [`ErasureCodec`] is the pluggable arithmetic. It sees one block at a time
//!   and keeps no state between blocks. [`ReedSolomonCodec`] is the default.
//! - [`FecEncoder`] is the sender half: it collects a block's source packets
//!   and produces the repair payloads once the block is complete.
//! - [`BlockTable`] is the receiver half: it regroups arriving packets by
//!   block, resolves the head block directly or through the codec, and writes
//!   off blocks that cannot be completed before their deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketPtr};

// ─── ErasureCodec ────────────────────────────────────────────────────────────

/// Erasure code over equally sized shards.
pub trait ErasureCodec: Send + Sync {
    /// Compute `n_repair` repair shards from the block's source shards.
    fn encode(&self, sources: &[&[u8]], n_repair: usize) -> Result<Vec<Vec<u8>>>;

    /// Rebuild the missing source shards.
    ///
    /// `sources` and `repairs` carry `(slot, shard)` pairs; repair slots count
    /// from zero. Returns the restored `(source slot, shard)` pairs, or
    /// `Unrecoverable` if fewer than `n_source` shards are available.
    fn decode(
        &self,
        n_source: usize,
        n_repair: usize,
        sources: &[(usize, &[u8])],
        repairs: &[(usize, &[u8])],
    ) -> Result<Vec<(usize, Vec<u8>)>>;
}

/// Reed-Solomon over GF(2^16) via `reed-solomon-simd`.
///
/// Shards of odd length are padded by one zero byte internally.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReedSolomonCodec;

impl ReedSolomonCodec {
    fn padded(shard: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(shard);
        out.resize(len, 0);
        out
    }
}

impl ErasureCodec for ReedSolomonCodec {
    fn encode(&self, sources: &[&[u8]], n_repair: usize) -> Result<Vec<Vec<u8>>> {
        if n_repair == 0 || sources.is_empty() {
            return Ok(Vec::new());
        }
        let len = sources.iter().map(|s| s.len()).max().unwrap_or(0);
        if len == 0 {
            return Ok(vec![Vec::new(); n_repair]);
        }
        let shard_len = len + (len & 1);
        let shards: Vec<Vec<u8>> = sources
            .iter()
            .map(|s| Self::padded(s, shard_len))
            .collect();
        let mut repairs = reed_solomon_simd::encode(sources.len(), n_repair, &shards)
            .map_err(|e| Error::Unrecoverable(format!("encode failed: {e}")))?;
        for repair in &mut repairs {
            repair.truncate(len);
        }
        Ok(repairs)
    }

    fn decode(
        &self,
        n_source: usize,
        n_repair: usize,
        sources: &[(usize, &[u8])],
        repairs: &[(usize, &[u8])],
    ) -> Result<Vec<(usize, Vec<u8>)>> {
        let available = sources.len() + repairs.len();
        if available < n_source {
            return Err(Error::Unrecoverable(format!(
                "{available} of {n_source} shards available"
            )));
        }
        if sources.len() == n_source {
            return Ok(Vec::new());
        }
        let len = sources
            .iter()
            .chain(repairs)
            .map(|(_, s)| s.len())
            .max()
            .unwrap_or(0);
        let shard_len = len + (len & 1);
        let restored = reed_solomon_simd::decode(
            n_source,
            n_repair,
            sources
                .iter()
                .map(|(i, s)| (*i, Self::padded(s, shard_len))),
            repairs
                .iter()
                .map(|(i, s)| (*i, Self::padded(s, shard_len))),
        )
        .map_err(|e| Error::Unrecoverable(format!("decode failed: {e}")))?;

        let mut out: Vec<(usize, Vec<u8>)> = restored
            .into_iter()
            .map(|(i, mut shard)| {
                shard.truncate(len);
                (i, shard)
            })
            .collect();
        out.sort_unstable_by_key(|(i, _)| *i);
        Ok(out)
    }
}

// ─── FEC Encoder ─────────────────────────────────────────────────────────────

/// Repair payloads produced for one completed block.
#[derive(Debug)]
pub struct RepairBlock {
    pub block: u64,
    pub payloads: Vec<Vec<u8>>,
}

/// Sender-side block accumulator.
pub struct FecEncoder {
    codec: Arc<dyn ErasureCodec>,
    n_source: usize,
    n_repair: usize,
    block: u64,
    sources: Vec<Option<PacketPtr>>,
    filled: usize,
}

impl FecEncoder {
    pub fn new(codec: Arc<dyn ErasureCodec>, n_source: usize, n_repair: usize) -> Self {
        FecEncoder {
            codec,
            n_source,
            n_repair,
            block: 0,
            sources: vec![None; n_source],
            filled: 0,
        }
    }

    /// Feed one source packet. Returns the block's repair payloads once the
    /// last source packet of the block has been fed.
    pub fn push(&mut self, packet: PacketPtr) -> Result<Option<RepairBlock>> {
        if self.n_repair == 0 {
            return Ok(None);
        }
        if packet.block != self.block {
            if self.filled > 0 {
                warn!(
                    block = self.block,
                    filled = self.filled,
                    "abandoning partial FEC block"
                );
            }
            self.reset(packet.block);
        }
        let index = packet.index as usize;
        if index >= self.n_source {
            return Err(Error::ConfigInvalid(format!(
                "source index {index} outside block of {}",
                self.n_source
            )));
        }
        if self.sources[index].replace(packet).is_none() {
            self.filled += 1;
        }
        if self.filled < self.n_source {
            return Ok(None);
        }

        let shards: Vec<&[u8]> = self
            .sources
            .iter()
            .flatten()
            .map(|p| p.payload())
            .collect();
        let payloads = self.codec.encode(&shards, self.n_repair)?;
        let block = self.block;
        self.reset(block + 1);
        Ok(Some(RepairBlock { block, payloads }))
    }

    /// Source packets buffered for the current block.
    pub fn buffered(&self) -> usize {
        self.filled
    }

    fn reset(&mut self, block: u64) {
        self.block = block;
        self.sources.iter_mut().for_each(|s| *s = None);
        self.filled = 0;
    }
}

// ─── Block Table ─────────────────────────────────────────────────────────────

/// What [`BlockTable::insert`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insert {
    Accepted,
    /// Same slot already filled.
    Duplicate,
    /// Block already emitted or written off.
    Late,
    /// Geometry or payload size disagrees with the session.
    Mismatch,
}

/// A source payload of a resolved block.
pub enum SourceShard {
    Received(Packet),
    Restored(Vec<u8>),
}

impl SourceShard {
    pub fn bytes(&self) -> &[u8] {
        match self {
            SourceShard::Received(packet) => packet.payload(),
            SourceShard::Restored(bytes) => bytes,
        }
    }
}

/// The next block in stream order, resolved one way or the other.
pub enum BlockOutcome {
    /// All source payloads, in slot order. `restored` counts those rebuilt
    /// by the codec.
    Decoded {
        block: u64,
        shards: Vec<SourceShard>,
        restored: usize,
    },
    /// `count` consecutive blocks starting at `block` will never resolve.
    Lost { block: u64, count: u64 },
}

struct BlockState {
    sources: Vec<Option<Packet>>,
    repairs: Vec<Option<Packet>>,
    received: usize,
    first_arrival: Instant,
}

impl BlockState {
    fn new(n_source: usize, n_repair: usize, now: Instant) -> Self {
        BlockState {
            sources: (0..n_source).map(|_| None).collect(),
            repairs: (0..n_repair).map(|_| None).collect(),
            received: 0,
            first_arrival: now,
        }
    }

    fn sources_present(&self) -> usize {
        self.sources.iter().filter(|s| s.is_some()).count()
    }
}

/// Receiver-side regrouping of packets into FEC blocks.
///
/// Blocks leave the table strictly in order. The table anchors on the first
/// block it sees and rewinds to an earlier one if it arrives before anything
/// has been emitted.
pub struct BlockTable {
    codec: Arc<dyn ErasureCodec>,
    n_source: usize,
    n_repair: usize,
    payload_len: usize,
    timeout: Duration,
    /// Blocks the head may fall behind the newest block before it is
    /// written off regardless of wall time.
    max_lag: u64,
    blocks: BTreeMap<u64, BlockState>,
    head: Option<u64>,
    head_since: Option<Instant>,
    emitted: bool,
}

impl BlockTable {
    pub fn new(codec: Arc<dyn ErasureCodec>, config: &SessionConfig) -> Self {
        BlockTable {
            codec,
            n_source: config.n_source_packets,
            n_repair: config.n_repair_packets,
            payload_len: config.payload_len(),
            timeout: config.timeout_duration(),
            max_lag: config.max_block_lag() as u64,
            blocks: BTreeMap::new(),
            head: None,
            head_since: None,
            emitted: false,
        }
    }

    pub fn insert(&mut self, packet: Packet, now: Instant) -> Insert {
        if packet.n_source as usize != self.n_source
            || packet.n_repair as usize != self.n_repair
            || packet.payload().len() != self.payload_len
        {
            debug!(
                seq = packet.seq,
                n_source = packet.n_source,
                n_repair = packet.n_repair,
                len = packet.payload().len(),
                "packet geometry mismatch"
            );
            return Insert::Mismatch;
        }

        let block = packet.block;
        match self.head {
            None => {
                self.head = Some(block);
                self.head_since = Some(now);
            }
            Some(head) if block < head => {
                if self.emitted {
                    return Insert::Late;
                }
                debug!(from = head, to = block, "rewinding stream start");
                self.head = Some(block);
                self.head_since = Some(now);
            }
            Some(_) => {}
        }

        let (n_source, n_repair) = (self.n_source, self.n_repair);
        let state = self
            .blocks
            .entry(block)
            .or_insert_with(|| BlockState::new(n_source, n_repair, now));
        let index = packet.index as usize;
        let slot = if packet.is_source() {
            &mut state.sources[index]
        } else {
            &mut state.repairs[index - n_source]
        };
        if slot.is_some() {
            return Insert::Duplicate;
        }
        *slot = Some(packet);
        state.received += 1;
        Insert::Accepted
    }

    /// Resolve the head block if possible. Call repeatedly until `None`.
    pub fn poll(&mut self, now: Instant) -> Option<BlockOutcome> {
        let head = self.head?;
        let newest = *self.blocks.keys().next_back()?;

        let Some(state) = self.blocks.get(&head) else {
            // Nothing at all for the head block yet.
            let since = self.head_since.unwrap_or(now);
            let waited = now.saturating_duration_since(since);
            if newest > head && (waited > self.timeout || newest - head > self.max_lag) {
                let oldest = self.blocks.keys().next().copied().unwrap_or(newest);
                let count = oldest - head;
                self.advance_to(oldest, now);
                warn!(block = head, count, "blocks never arrived");
                return Some(BlockOutcome::Lost { block: head, count });
            }
            return None;
        };

        let complete = state.sources_present() == self.n_source;
        let decodable = state.received >= self.n_source && self.n_repair > 0;
        let expired = now.saturating_duration_since(state.first_arrival) > self.timeout
            || newest - head > self.max_lag;
        if !complete && !decodable && !expired {
            return None;
        }

        let state = self.blocks.remove(&head)?;
        self.advance_to(head + 1, now);
        if complete {
            let shards = state
                .sources
                .into_iter()
                .flatten()
                .map(SourceShard::Received)
                .collect();
            return Some(BlockOutcome::Decoded {
                block: head,
                shards,
                restored: 0,
            });
        }
        if decodable {
            match self.restore(state) {
                Ok((shards, restored)) => {
                    return Some(BlockOutcome::Decoded {
                        block: head,
                        shards,
                        restored,
                    })
                }
                Err(e) => warn!(block = head, error = %e, "block decode failed"),
            }
        } else {
            warn!(
                block = head,
                received = state.received,
                needed = self.n_source,
                "block expired"
            );
        }
        Some(BlockOutcome::Lost {
            block: head,
            count: 1,
        })
    }

    /// Next block to be emitted, once anchored.
    pub fn head(&self) -> Option<u64> {
        self.head
    }

    /// Blocks with at least one packet buffered.
    pub fn pending_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Drop everything buffered, releasing the packets to their pool.
    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    fn advance_to(&mut self, block: u64, now: Instant) {
        self.head = Some(block);
        self.head_since = Some(now);
        self.emitted = true;
    }

    fn restore(&self, state: BlockState) -> Result<(Vec<SourceShard>, usize)> {
        let restored = {
            let sources: Vec<(usize, &[u8])> = state
                .sources
                .iter()
                .enumerate()
                .filter_map(|(i, p)| p.as_ref().map(|p| (i, p.payload())))
                .collect();
            let repairs: Vec<(usize, &[u8])> = state
                .repairs
                .iter()
                .enumerate()
                .filter_map(|(i, p)| p.as_ref().map(|p| (i, p.payload())))
                .collect();
            self.codec
                .decode(self.n_source, self.n_repair, &sources, &repairs)?
        };

        let count = restored.len();
        let mut restored = restored.into_iter().peekable();
        let mut shards = Vec::with_capacity(self.n_source);
        for (i, slot) in state.sources.into_iter().enumerate() {
            match slot {
                Some(packet) => shards.push(SourceShard::Received(packet)),
                None => match restored.next_if(|(j, _)| *j == i) {
                    Some((_, bytes)) => shards.push(SourceShard::Restored(bytes)),
                    None => {
                        return Err(Error::Unrecoverable(format!("source slot {i} missing")))
                    }
                },
            }
        }
        Ok((shards, count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Role;
    use crate::pool::{BufferPool, PacketPool};

    fn session(n_source: usize, n_repair: usize) -> SessionConfig {
        SessionConfig {
            samples_per_packet: 2,
            channels: 1,
            sample_rate: 1000,
            n_source_packets: n_source,
            n_repair_packets: n_repair,
            latency: 0,
            timeout: 100,
            ..SessionConfig::default()
        }
    }

    fn pool() -> PacketPool {
        PacketPool::new(256, BufferPool::new(256, 64))
    }

    fn payload(seq: u64) -> [u8; 8] {
        (seq * 0x0101_0101 + 7).to_le_bytes()
    }

    fn source(pool: &PacketPool, cfg: &SessionConfig, seq: u64) -> Packet {
        let n = cfg.n_source_packets as u64;
        let mut p = pool.acquire(Role::Source).unwrap();
        p.seq = seq;
        p.block = seq / n;
        p.index = (seq % n) as u16;
        p.n_source = cfg.n_source_packets as u16;
        p.n_repair = cfg.n_repair_packets as u16;
        p.set_payload(&payload(seq)).unwrap();
        p
    }

    /// Encode `block` and return its source and repair packets.
    fn block_packets(pool: &PacketPool, cfg: &SessionConfig, block: u64) -> Vec<Packet> {
        let n = cfg.n_source_packets as u64;
        let sources: Vec<Packet> = (block * n..(block + 1) * n)
            .map(|seq| source(pool, cfg, seq))
            .collect();
        let shards: Vec<&[u8]> = sources.iter().map(|p| p.payload()).collect();
        let repairs = ReedSolomonCodec
            .encode(&shards, cfg.n_repair_packets)
            .unwrap();
        let mut out = sources;
        for (r, bytes) in repairs.iter().enumerate() {
            let mut p = pool.acquire(Role::Repair).unwrap();
            p.seq = block * cfg.n_repair_packets as u64 + r as u64;
            p.block = block;
            p.index = (cfg.n_source_packets + r) as u16;
            p.n_source = cfg.n_source_packets as u16;
            p.n_repair = cfg.n_repair_packets as u16;
            p.set_payload(bytes).unwrap();
            out.push(p);
        }
        out
    }

    fn decoded(outcome: Option<BlockOutcome>) -> (u64, Vec<Vec<u8>>, usize) {
        match outcome {
            Some(BlockOutcome::Decoded {
                block,
                shards,
                restored,
            }) => (
                block,
                shards.iter().map(|s| s.bytes().to_vec()).collect(),
                restored,
            ),
            Some(BlockOutcome::Lost { block, .. }) => panic!("block {block} lost"),
            None => panic!("nothing resolved"),
        }
    }

    #[test]
    fn reed_solomon_recovers_up_to_n_repair() {
        let sources: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 6]).collect();
        let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
        let repairs = ReedSolomonCodec.encode(&refs, 2).unwrap();
        assert_eq!(repairs.len(), 2);

        let kept = [(1usize, refs[1]), (3, refs[3])];
        let rep = [(0usize, repairs[0].as_slice()), (1, repairs[1].as_slice())];
        let restored = ReedSolomonCodec.decode(4, 2, &kept, &rep).unwrap();
        assert_eq!(restored, vec![(0, sources[0].clone()), (2, sources[2].clone())]);
    }

    #[test]
    fn reed_solomon_fails_cleanly_below_n_source() {
        let sources: Vec<Vec<u8>> = (0..4u8).map(|i| vec![i; 4]).collect();
        let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
        let repairs = ReedSolomonCodec.encode(&refs, 2).unwrap();
        let kept = [(0usize, refs[0])];
        let rep = [(0usize, repairs[0].as_slice()), (1, repairs[1].as_slice())];
        assert!(matches!(
            ReedSolomonCodec.decode(4, 2, &kept, &rep),
            Err(Error::Unrecoverable(_))
        ));
    }

    #[test]
    fn odd_shards_are_padded_transparently() {
        let sources: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i + 1; 5]).collect();
        let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
        let repairs = ReedSolomonCodec.encode(&refs, 1).unwrap();
        assert_eq!(repairs[0].len(), 5);
        let kept = [(0usize, refs[0]), (2, refs[2])];
        let restored = ReedSolomonCodec
            .decode(3, 1, &kept, &[(0, repairs[0].as_slice())])
            .unwrap();
        assert_eq!(restored, vec![(1, sources[1].clone())]);
    }

    #[test]
    fn encoder_emits_repairs_once_block_is_full() {
        let cfg = session(3, 2);
        let pool = pool();
        let mut encoder = FecEncoder::new(Arc::new(ReedSolomonCodec), 3, 2);
        assert!(encoder.push(source(&pool, &cfg, 0).into_ptr()).unwrap().is_none());
        assert!(encoder.push(source(&pool, &cfg, 1).into_ptr()).unwrap().is_none());
        assert_eq!(encoder.buffered(), 2);
        let repair = encoder
            .push(source(&pool, &cfg, 2).into_ptr())
            .unwrap()
            .unwrap();
        assert_eq!(repair.block, 0);
        assert_eq!(repair.payloads.len(), 2);
        assert_eq!(encoder.buffered(), 0);
        assert_eq!(pool.in_flight(), 0, "encoder must not retain packets");
    }

    #[test]
    fn encoder_without_repair_is_passthrough() {
        let cfg = session(2, 0);
        let pool = pool();
        let mut encoder = FecEncoder::new(Arc::new(ReedSolomonCodec), 2, 0);
        for seq in 0..4 {
            assert!(encoder
                .push(source(&pool, &cfg, seq).into_ptr())
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn complete_block_resolves_directly() {
        let cfg = session(3, 2);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();
        for p in block_packets(&pool, &cfg, 0).into_iter().take(3) {
            assert_eq!(table.insert(p, now), Insert::Accepted);
        }
        let (block, shards, restored) = decoded(table.poll(now));
        assert_eq!(block, 0);
        assert_eq!(restored, 0);
        assert_eq!(shards[2], payload(2));
        assert!(table.poll(now).is_none());
    }

    #[test]
    fn missing_sources_restored_from_repairs() {
        let cfg = session(3, 2);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();
        let packets = block_packets(&pool, &cfg, 0);
        // Drop sources 0 and 2, keep source 1 and both repairs.
        for (i, p) in packets.into_iter().enumerate() {
            if i != 0 && i != 2 {
                table.insert(p, now);
            }
        }
        let (_, shards, restored) = decoded(table.poll(now));
        assert_eq!(restored, 2);
        assert_eq!(shards, vec![payload(0).to_vec(), payload(1).to_vec(), payload(2).to_vec()]);
    }

    #[test]
    fn out_of_order_and_duplicates() {
        let cfg = session(2, 1);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();

        assert_eq!(table.insert(source(&pool, &cfg, 3), now), Insert::Accepted);
        assert_eq!(table.insert(source(&pool, &cfg, 3), now), Insert::Duplicate);
        assert_eq!(table.insert(source(&pool, &cfg, 2), now), Insert::Accepted);
        // Block 0 shows up before anything was emitted: rewind to it.
        assert_eq!(table.insert(source(&pool, &cfg, 1), now), Insert::Accepted);
        assert_eq!(table.head(), Some(0));
        assert!(table.poll(now).is_none());
        assert_eq!(table.insert(source(&pool, &cfg, 0), now), Insert::Accepted);

        assert_eq!(decoded(table.poll(now)).0, 0);
        assert_eq!(decoded(table.poll(now)).0, 1);
        assert!(table.poll(now).is_none());

        assert_eq!(table.insert(source(&pool, &cfg, 1), now), Insert::Late);
    }

    #[test]
    fn incomplete_block_expires_after_timeout() {
        let cfg = session(3, 0);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();
        table.insert(source(&pool, &cfg, 0), now);
        table.insert(source(&pool, &cfg, 2), now);
        for seq in 3..6 {
            table.insert(source(&pool, &cfg, seq), now);
        }
        assert!(table.poll(now).is_none(), "block 0 still within deadline");

        let later = now + cfg.timeout_duration() + Duration::from_millis(1);
        match table.poll(later) {
            Some(BlockOutcome::Lost { block: 0, count: 1 }) => {}
            _ => panic!("block 0 should be written off"),
        }
        assert_eq!(decoded(table.poll(later)).0, 1);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn vanished_block_is_skipped() {
        let cfg = session(2, 1);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();
        for p in block_packets(&pool, &cfg, 0) {
            table.insert(p, now);
        }
        assert_eq!(decoded(table.poll(now)).0, 0);
        // Block 1 never arrives, block 2 does.
        for p in block_packets(&pool, &cfg, 2) {
            table.insert(p, now);
        }
        assert!(table.poll(now).is_none());
        let later = now + cfg.timeout_duration() + Duration::from_millis(1);
        match table.poll(later) {
            Some(BlockOutcome::Lost { block: 1, count: 1 }) => {}
            _ => panic!("block 1 should be written off"),
        }
        assert_eq!(decoded(table.poll(later)).0, 2);
    }

    #[test]
    fn far_ahead_traffic_forces_head_out() {
        // timeout 100 samples, 2-sample blocks: head may lag 50 blocks.
        let cfg = session(1, 0);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let now = Instant::now();
        table.insert(source(&pool, &cfg, 0), now);
        assert_eq!(decoded(table.poll(now)).0, 0);
        table.insert(source(&pool, &cfg, 60), now);
        match table.poll(now) {
            Some(BlockOutcome::Lost { block: 1, count: 59 }) => {}
            _ => panic!("gap should be written off at once"),
        }
        assert_eq!(decoded(table.poll(now)).0, 60);
    }

    #[test]
    fn mismatched_geometry_rejected() {
        let cfg = session(3, 2);
        let pool = pool();
        let mut table = BlockTable::new(Arc::new(ReedSolomonCodec), &cfg);
        let mut p = source(&pool, &cfg, 0);
        p.n_repair = 1;
        assert_eq!(table.insert(p, Instant::now()), Insert::Mismatch);
        assert_eq!(table.pending_blocks(), 0);
    }
}
