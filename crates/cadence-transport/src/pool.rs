//! # Buffer and Packet Pools
//!
//! Fixed-capacity pools that keep allocation off the real-time path.
//!
//! - [`BufferPool`] pre-allocates `capacity` byte buffers of `buffer_size`
//!   bytes. A [`PooledBuffer`] hands its storage back when dropped.
//! - [`PacketPool`] bounds the number of live packets with a slab of leases
//!   and draws each packet's payload from a `BufferPool`.
//!
//! Exhaustion is reported as [`Error::ResourceExhausted`]; no call here ever
//! blocks. Both pools are cheap to clone and safe to share across threads.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::BytesMut;
use quanta::Instant;
use slab::Slab;

use crate::error::{Error, Result};
use crate::packet::{Packet, Role};
use crate::wire::VarInt;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ─── BufferPool ──────────────────────────────────────────────────────────────

struct BufferPoolInner {
    buffer_size: usize,
    capacity: usize,
    free: Mutex<Vec<BytesMut>>,
}

/// Pre-allocated pool of fixed-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        let free = (0..capacity)
            .map(|_| BytesMut::with_capacity(buffer_size))
            .collect();
        BufferPool {
            inner: Arc::new(BufferPoolInner {
                buffer_size,
                capacity,
                free: Mutex::new(free),
            }),
        }
    }

    /// Take an empty buffer, or `ResourceExhausted` when all are in use.
    pub fn acquire(&self) -> Result<PooledBuffer> {
        let buf = lock(&self.inner.free)
            .pop()
            .ok_or(Error::ResourceExhausted("buffer pool"))?;
        Ok(PooledBuffer {
            buf,
            pool: Arc::clone(&self.inner),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn available(&self) -> usize {
        lock(&self.inner.free).len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`].
///
/// Writes are bounded by the pool's `buffer_size`, so the underlying storage
/// never reallocates while on loan.
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPoolInner>,
}

impl PooledBuffer {
    /// Bytes still writable before the buffer is full.
    pub fn remaining(&self) -> usize {
        self.pool.buffer_size - self.buf.len()
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.remaining() {
            return Err(Error::ResourceExhausted("buffer capacity"));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Grow (zero-filled) or shrink to exactly `len` bytes.
    pub fn resize(&mut self, len: usize) -> Result<()> {
        if len > self.pool.buffer_size {
            return Err(Error::ResourceExhausted("buffer capacity"));
        }
        self.buf.resize(len, 0);
        Ok(())
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut free = lock(&self.pool.free);
        if free.len() < self.pool.capacity {
            free.push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledBuffer({} bytes)", self.buf.len())
    }
}

// ─── PacketPool ──────────────────────────────────────────────────────────────

struct PacketPoolInner {
    /// One entry per live packet, holding its acquisition time.
    leases: Mutex<Slab<Instant>>,
    capacity: usize,
    buffers: BufferPool,
}

/// Bounded source of [`Packet`]s.
#[derive(Clone)]
pub struct PacketPool {
    inner: Arc<PacketPoolInner>,
}

impl PacketPool {
    pub fn new(capacity: usize, buffers: BufferPool) -> Self {
        PacketPool {
            inner: Arc::new(PacketPoolInner {
                leases: Mutex::new(Slab::with_capacity(capacity)),
                capacity,
                buffers,
            }),
        }
    }

    /// Take a blank packet of the given role with an empty payload buffer.
    ///
    /// Fails with `ResourceExhausted` if either the packet slab or the buffer
    /// pool is full; a half-acquired packet is released before returning.
    pub fn acquire(&self, role: Role) -> Result<Packet> {
        let lease = {
            let mut leases = lock(&self.inner.leases);
            if leases.len() >= self.inner.capacity {
                return Err(Error::ResourceExhausted("packet pool"));
            }
            PacketLease {
                key: leases.insert(Instant::now()),
                pool: Arc::clone(&self.inner),
            }
        };
        let payload = self.inner.buffers.acquire()?;
        Ok(Packet::new(role, payload, lease))
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.leases).len()
    }

    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.in_flight())
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.inner.buffers
    }

    /// Age of the longest-lived packet still on loan.
    pub fn oldest_in_flight(&self) -> Option<Duration> {
        let now = Instant::now();
        lock(&self.inner.leases)
            .iter()
            .map(|(_, acquired)| now.saturating_duration_since(*acquired))
            .max()
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("capacity", &self.inner.capacity)
            .field("in_flight", &self.in_flight())
            .field("buffers", &self.inner.buffers)
            .finish()
    }
}

/// A packet's claim on a [`PacketPool`] slot, released on drop.
pub(crate) struct PacketLease {
    key: usize,
    pool: Arc<PacketPoolInner>,
}

impl Drop for PacketLease {
    fn drop(&mut self) {
        let mut leases = lock(&self.pool.leases);
        if leases.contains(self.key) {
            leases.remove(self.key);
        }
    }
}

// ─── Sequence Generator ─────────────────────────────────────────────────────

/// Monotonic per-role sequence numbers, bounded by the wire VarInt range.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: u64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        SequenceGenerator { next: 0 }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u64 {
        let seq = self.next;
        self.next += 1;
        if self.next > VarInt::MAX {
            self.next = 0;
        }
        seq
    }

    pub fn current(&self) -> u64 {
        self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_pool_exhausts_and_recovers() {
        let pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let _b = pool.acquire().unwrap();
        assert!(matches!(
            pool.acquire(),
            Err(Error::ResourceExhausted("buffer pool"))
        ));
        assert_eq!(pool.in_use(), 2);

        drop(a);
        assert_eq!(pool.available(), 1);
        let c = pool.acquire().unwrap();
        assert!(c.is_empty(), "recycled buffers come back cleared");
    }

    #[test]
    fn pooled_buffer_is_bounded() {
        let pool = BufferPool::new(1, 8);
        let mut buf = pool.acquire().unwrap();
        buf.extend_from_slice(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(buf.remaining(), 3);
        assert!(buf.extend_from_slice(&[0; 4]).is_err());
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5]);

        buf.resize(8).unwrap();
        assert_eq!(buf.len(), 8);
        assert!(buf.resize(9).is_err());
    }

    #[test]
    fn packet_pool_exhaustion_does_not_touch_live_packets() {
        let pool = PacketPool::new(2, BufferPool::new(4, 32));
        let mut p1 = pool.acquire(Role::Source).unwrap();
        p1.payload_mut().extend_from_slice(b"live").unwrap();
        let _p2 = pool.acquire(Role::Repair).unwrap();

        assert!(matches!(
            pool.acquire(Role::Source),
            Err(Error::ResourceExhausted("packet pool"))
        ));
        assert_eq!(p1.payload(), b"live");
        assert_eq!(pool.in_flight(), 2);

        drop(p1);
        assert_eq!(pool.in_flight(), 1);
        assert!(pool.acquire(Role::Source).is_ok());
    }

    #[test]
    fn packet_pool_releases_lease_when_buffers_run_out() {
        let pool = PacketPool::new(4, BufferPool::new(1, 32));
        let _held = pool.acquire(Role::Source).unwrap();
        assert!(matches!(
            pool.acquire(Role::Source),
            Err(Error::ResourceExhausted("buffer pool"))
        ));
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = PacketPool::new(8, BufferPool::new(8, 16));
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(packet) = pool.acquire(Role::Source) {
                            drop(packet);
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.buffers().available(), 8);
    }

    #[test]
    fn oldest_in_flight_tracks_leases() {
        let pool = PacketPool::new(2, BufferPool::new(2, 16));
        assert!(pool.oldest_in_flight().is_none());
        let _p = pool.acquire(Role::Source).unwrap();
        assert!(pool.oldest_in_flight().is_some());
    }

    #[test]
    fn sequence_generator() {
        let mut seq = SequenceGenerator::new();
        assert_eq!(seq.next(), 0);
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.current(), 3);
    }
}
