//! # Packet Interleaver
//!
//! Holds one block of source packets and releases them in a stride
//! permutation, so a burst of consecutive losses on the wire lands on packets
//! spread across the block. The receiver needs no inverse step: every packet
//! carries its own block slot.
//!
//! With stride `s = ceil(sqrt(n))` the send order for `n = 10` is
//! `0 4 8 1 5 9 2 6 3 7`.

use crate::packet::PacketPtr;

pub struct Interleaver {
    order: Vec<usize>,
    slots: Vec<Option<PacketPtr>>,
    block: Option<u64>,
    filled: usize,
}

impl Interleaver {
    pub fn new(block_len: usize) -> Self {
        Interleaver {
            order: stride_order(block_len),
            slots: vec![None; block_len],
            block: None,
            filled: 0,
        }
    }

    /// Buffer `packet`; when its block is complete, return the whole block in
    /// interleaved order. A packet from a new block flushes the previous,
    /// incomplete one first, in slot order.
    pub fn push(&mut self, packet: PacketPtr) -> Vec<PacketPtr> {
        let mut out = Vec::new();
        if self.block.is_some_and(|b| b != packet.block) {
            out = self.flush();
        }
        self.block = Some(packet.block);
        let index = packet.index as usize;
        if index >= self.slots.len() {
            out.push(packet);
            return out;
        }
        if self.slots[index].replace(packet).is_none() {
            self.filled += 1;
        }
        if self.filled == self.slots.len() {
            out.extend(self.order.iter().filter_map(|&i| self.slots[i].take()));
            self.reset();
        }
        out
    }

    /// Release whatever is buffered, in slot order.
    pub fn flush(&mut self) -> Vec<PacketPtr> {
        let out = self.slots.iter_mut().filter_map(Option::take).collect();
        self.reset();
        out
    }

    pub fn buffered(&self) -> usize {
        self.filled
    }

    fn reset(&mut self) {
        self.block = None;
        self.filled = 0;
    }
}

fn stride_order(n: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    let stride = (1..=n).find(|s| s * s >= n).unwrap_or(n);
    (0..stride)
        .flat_map(|start| (start..n).step_by(stride))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Role;
    use crate::pool::{BufferPool, PacketPool};

    fn packet(pool: &PacketPool, block: u64, index: u16) -> PacketPtr {
        let mut p = pool.acquire(Role::Source).unwrap();
        p.block = block;
        p.index = index;
        p.seq = block * 10 + index as u64;
        p.into_ptr()
    }

    #[test]
    fn stride_order_is_a_permutation() {
        assert_eq!(stride_order(10), vec![0, 4, 8, 1, 5, 9, 2, 6, 3, 7]);
        assert_eq!(stride_order(1), vec![0]);
        assert!(stride_order(0).is_empty());
        for n in 1..64 {
            let mut order = stride_order(n);
            order.sort_unstable();
            assert_eq!(order, (0..n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn releases_full_block_interleaved() {
        let pool = PacketPool::new(16, BufferPool::new(16, 8));
        let mut il = Interleaver::new(4);
        for i in 0..3 {
            assert!(il.push(packet(&pool, 0, i)).is_empty());
        }
        let out: Vec<u16> = il.push(packet(&pool, 0, 3)).iter().map(|p| p.index).collect();
        assert_eq!(out, vec![0, 2, 1, 3]);
        assert_eq!(il.buffered(), 0);
    }

    #[test]
    fn new_block_flushes_partial_block() {
        let pool = PacketPool::new(16, BufferPool::new(16, 8));
        let mut il = Interleaver::new(4);
        il.push(packet(&pool, 0, 1));
        il.push(packet(&pool, 0, 0));
        let out: Vec<(u64, u16)> = il
            .push(packet(&pool, 1, 0))
            .iter()
            .map(|p| (p.block, p.index))
            .collect();
        assert_eq!(out, vec![(0, 0), (0, 1)]);
        assert_eq!(il.buffered(), 1);
        assert_eq!(il.flush().len(), 1);
    }
}
