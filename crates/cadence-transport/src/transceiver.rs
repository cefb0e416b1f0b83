//! # Network Transceiver
//!
//! Owns the UDP sockets of a [`Context`](crate::session::Context) and runs a
//! single I/O thread that:
//!
//! 1. drains the bounded outbound queue fed by [`PacketWriter`]s, encoding
//!    each packet into a datagram for its destination;
//! 2. polls every bound socket, decodes arriving datagrams into pooled
//!    [`Packet`]s and routes each to the [`PacketSink`] registered for the
//!    socket's local address.
//!
//! The route table is copy-on-write behind an `ArcSwap`: registration takes a
//! mutex and publishes a new table, the I/O thread only loads. Traffic for an
//! address without a sink is logged and dropped.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketPtr};
use crate::pool::PacketPool;
use crate::session::LifecycleState;
use crate::stats::TransceiverStats;
use crate::wire::{decode_datagram, encode_packet};

/// Datagrams handled per socket or queue before moving on.
const IO_BATCH: usize = 64;

/// How long the I/O thread parks on the outbound queue when idle. The
/// sockets are non-blocking and only polled between waits, so an inbound
/// datagram on an idle transceiver is picked up at most this late.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Anything that can take ownership of an inbound packet.
///
/// Called on the transceiver's I/O thread, so implementations must return
/// promptly and never wait on the network.
pub trait PacketSink: Send + Sync {
    fn write(&self, packet: Packet) -> Result<()>;
}

struct Outbound {
    socket: Arc<UdpSocket>,
    packet: PacketPtr,
}

#[derive(Clone, Default)]
struct Routes {
    sockets: HashMap<Address, Arc<UdpSocket>>,
    sinks: HashMap<Address, Arc<dyn PacketSink>>,
}

struct Shared {
    packets: PacketPool,
    buffer_size: usize,
    routes: ArcSwap<Routes>,
    /// Serializes route-table updates.
    registry: Mutex<()>,
    outbound_tx: Sender<Outbound>,
    outbound_rx: Receiver<Outbound>,
    running: AtomicBool,
    stopped: AtomicBool,
    stats: Mutex<TransceiverStats>,
}

impl Shared {
    fn stats(&self) -> MutexGuard<'_, TransceiverStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct Transceiver {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Transceiver {
    /// `buffer_size` bounds a single datagram; `queue` is the outbound depth.
    pub fn new(packets: PacketPool, buffer_size: usize, queue: usize) -> Self {
        let (outbound_tx, outbound_rx) = bounded(queue);
        Transceiver {
            shared: Arc::new(Shared {
                packets,
                buffer_size,
                routes: ArcSwap::from_pointee(Routes::default()),
                registry: Mutex::new(()),
                outbound_tx,
                outbound_rx,
                running: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stats: Mutex::new(TransceiverStats::new()),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Bind (or reuse) a socket at `address` and return a handle that queues
    /// packets for transmission from it.
    pub fn add_endpoint(&self, address: Address) -> Result<PacketWriter> {
        self.ensure_open("add_endpoint")?;
        let _guard = self.registry();
        let (local, socket) = self.bind_locked(address)?;
        debug!(addr = %local, "endpoint added");
        Ok(PacketWriter {
            local,
            socket,
            tx: self.shared.outbound_tx.clone(),
            shared: Arc::clone(&self.shared),
        })
    }

    /// Route every packet arriving at `address` to `sink`. Returns the bound
    /// address, which differs from `address` when port 0 was requested.
    pub fn add_inbound(&self, address: Address, sink: Arc<dyn PacketSink>) -> Result<Address> {
        self.ensure_open("add_inbound")?;
        let _guard = self.registry();
        if self.shared.routes.load().sinks.contains_key(&address) {
            return Err(Error::ConfigInvalid(format!(
                "{address} already has a packet sink"
            )));
        }
        let (local, _) = self.bind_locked(address)?;
        let mut routes = Routes::clone(&self.shared.routes.load());
        routes.sinks.insert(local, sink);
        self.shared.routes.store(Arc::new(routes));
        info!(addr = %local, "inbound route added");
        Ok(local)
    }

    /// Stop routing traffic for `address`. The socket stays bound, so late
    /// datagrams are counted as unroutable instead of bouncing.
    pub fn remove_inbound(&self, address: Address) -> bool {
        let _guard = self.registry();
        let mut routes = Routes::clone(&self.shared.routes.load());
        let removed = routes.sinks.remove(&address).is_some();
        if removed {
            self.shared.routes.store(Arc::new(routes));
            info!(addr = %address, "inbound route removed");
        }
        removed
    }

    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::InvalidState {
                op: "start",
                state: LifecycleState::Stopped,
            });
        }
        if handle.is_some() {
            return Err(Error::InvalidState {
                op: "start",
                state: LifecycleState::Started,
            });
        }
        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        *handle = Some(
            thread::Builder::new()
                .name("cadence-io".into())
                .spawn(move || io_loop(shared))?,
        );
        info!("transceiver started");
        Ok(())
    }

    /// Ask the I/O thread to exit. Idempotent; queued packets are discarded.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        info!("transceiver stopping");
    }

    /// Wait for the I/O thread to exit.
    pub fn join(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("transceiver I/O thread panicked");
            }
        }
        while self.shared.outbound_rx.try_recv().is_ok() {}
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> TransceiverStats {
        self.shared.stats().clone()
    }

    pub fn packet_pool(&self) -> &PacketPool {
        &self.shared.packets
    }

    fn ensure_open(&self, op: &'static str) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            Err(Error::InvalidState {
                op,
                state: LifecycleState::Stopped,
            })
        } else {
            Ok(())
        }
    }

    fn registry(&self) -> MutexGuard<'_, ()> {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Must hold the registry lock.
    fn bind_locked(&self, address: Address) -> Result<(Address, Arc<UdpSocket>)> {
        let current = self.shared.routes.load();
        if address.port() != 0 {
            if let Some(socket) = current.sockets.get(&address) {
                return Ok((address, Arc::clone(socket)));
            }
        }
        let socket = UdpSocket::bind(address.socket_addr()).map_err(|e| {
            Error::ConfigInvalid(format!("cannot bind {address}: {e}"))
        })?;
        socket.set_nonblocking(true)?;
        let local = Address::from(socket.local_addr()?);
        let socket = Arc::new(socket);

        let mut routes = Routes::clone(&current);
        routes.sockets.insert(local, Arc::clone(&socket));
        self.shared.routes.store(Arc::new(routes));
        Ok((local, socket))
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

// ─── PacketWriter ────────────────────────────────────────────────────────────

/// Handle for queueing packets out of one local endpoint.
#[derive(Clone)]
pub struct PacketWriter {
    local: Address,
    socket: Arc<UdpSocket>,
    tx: Sender<Outbound>,
    shared: Arc<Shared>,
}

impl PacketWriter {
    /// Queue `packet` for its `dst`. Never blocks: a full queue is reported
    /// as `ResourceExhausted`, a stopped transceiver as `Closed`.
    pub fn write(&self, packet: PacketPtr) -> Result<()> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if packet.dst.is_none() {
            return Err(Error::ConfigInvalid("packet has no destination".into()));
        }
        self.tx
            .try_send(Outbound {
                socket: Arc::clone(&self.socket),
                packet,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => Error::ResourceExhausted("outbound queue"),
                TrySendError::Disconnected(_) => Error::Closed,
            })
    }

    /// Address packets from this writer are sent from.
    pub fn local_addr(&self) -> Address {
        self.local
    }
}

impl PacketSink for PacketWriter {
    fn write(&self, packet: Packet) -> Result<()> {
        PacketWriter::write(self, packet.into_ptr())
    }
}

impl std::fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketWriter")
            .field("local", &self.local)
            .finish()
    }
}

// ─── I/O loop ────────────────────────────────────────────────────────────────

fn io_loop(shared: Arc<Shared>) {
    let mut datagram = BytesMut::with_capacity(shared.buffer_size);
    let mut scratch = vec![0u8; shared.buffer_size + 1];

    while shared.running.load(Ordering::Acquire) {
        let mut busy = false;

        for _ in 0..IO_BATCH {
            match shared.outbound_rx.try_recv() {
                Ok(out) => {
                    send_one(&shared, out, &mut datagram);
                    busy = true;
                }
                Err(_) => break,
            }
        }

        let routes = shared.routes.load();
        for (local, socket) in &routes.sockets {
            for _ in 0..IO_BATCH {
                match socket.recv_from(&mut scratch) {
                    Ok((len, peer)) => {
                        busy = true;
                        receive_one(&shared, &routes, *local, peer, &scratch[..len]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    // ICMP port-unreachable from an earlier send surfaces here.
                    Err(e) if e.kind() == ErrorKind::ConnectionReset => continue,
                    Err(e) => {
                        debug!(addr = %local, error = %e, "recv failed");
                        break;
                    }
                }
            }
        }

        if !busy {
            match shared.outbound_rx.recv_timeout(IDLE_WAIT) {
                Ok(out) => send_one(&shared, out, &mut datagram),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }
    debug!("transceiver I/O thread exiting");
}

fn send_one(shared: &Shared, out: Outbound, datagram: &mut BytesMut) {
    let Some(dst) = out.packet.dst else {
        return;
    };
    datagram.clear();
    if let Err(e) = encode_packet(&out.packet, datagram) {
        warn!(error = %e, "cannot encode outbound packet");
        shared.stats().send_errors += 1;
        return;
    }
    match out.socket.send_to(&datagram[..], SocketAddr::from(dst)) {
        Ok(sent) => {
            let mut stats = shared.stats();
            stats.datagrams_sent += 1;
            stats.bytes_sent += sent as u64;
        }
        Err(e) => {
            debug!(dst = %dst, error = %e, "send failed");
            shared.stats().send_errors += 1;
        }
    }
}

fn receive_one(shared: &Shared, routes: &Routes, local: Address, peer: SocketAddr, bytes: &[u8]) {
    {
        let mut stats = shared.stats();
        stats.datagrams_received += 1;
        stats.bytes_received += bytes.len() as u64;
    }
    if bytes.len() > shared.buffer_size {
        debug!(addr = %local, len = bytes.len(), "oversized datagram");
        shared.stats().decode_errors += 1;
        return;
    }
    let Some((header, payload)) = decode_datagram(bytes) else {
        debug!(addr = %local, from = %peer, "undecodable datagram");
        shared.stats().decode_errors += 1;
        return;
    };
    let Some(sink) = routes.sinks.get(&local) else {
        warn!(addr = %local, from = %peer, "no sink for inbound packet, dropping");
        shared.stats().unroutable += 1;
        return;
    };

    let mut packet = match shared.packets.acquire(header.role) {
        Ok(packet) => packet,
        Err(e) => {
            warn!(addr = %local, error = %e, "dropping inbound packet");
            shared.stats().pool_drops += 1;
            return;
        }
    };
    if packet.set_payload(payload).is_err() {
        shared.stats().decode_errors += 1;
        return;
    }
    packet.seq = header.seq.value();
    packet.block = header.block.value();
    packet.index = header.index;
    packet.n_source = header.n_source;
    packet.n_repair = header.n_repair;
    packet.src = Some(Address::from(peer));
    packet.dst = Some(local);

    if let Err(e) = sink.write(packet) {
        debug!(addr = %local, error = %e, "sink rejected packet");
        shared.stats().sink_rejects += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Role;
    use crate::pool::BufferPool;
    use crossbeam_channel::Receiver as ChannelReceiver;
    use std::time::Instant;

    struct ChannelSink(Sender<Packet>);

    impl PacketSink for ChannelSink {
        fn write(&self, packet: Packet) -> Result<()> {
            self.0.try_send(packet).map_err(|_| Error::ResourceExhausted("test sink"))
        }
    }

    fn transceiver() -> (Transceiver, PacketPool) {
        let pool = PacketPool::new(64, BufferPool::new(64, 512));
        (Transceiver::new(pool.clone(), 512, 64), pool)
    }

    fn sink() -> (Arc<dyn PacketSink>, ChannelReceiver<Packet>) {
        let (tx, rx) = bounded(64);
        (Arc::new(ChannelSink(tx)), rx)
    }

    fn loopback() -> Address {
        Address::parse("127.0.0.1:0").unwrap()
    }

    fn packet(pool: &PacketPool, seq: u64, dst: Address) -> PacketPtr {
        let mut p = pool.acquire(Role::Source).unwrap();
        p.seq = seq;
        p.block = seq / 4;
        p.index = (seq % 4) as u16;
        p.n_source = 4;
        p.n_repair = 2;
        p.dst = Some(dst);
        p.push_samples(&[seq as f32, -1.0]).unwrap();
        p.into_ptr()
    }

    #[test]
    fn routes_by_destination_address() {
        let (trx, pool) = transceiver();
        let (sink_a, rx_a) = sink();
        let (sink_b, rx_b) = sink();
        let addr_a = trx.add_inbound(loopback(), sink_a).unwrap();
        let addr_b = trx.add_inbound(loopback(), sink_b).unwrap();
        let writer = trx.add_endpoint(loopback()).unwrap();
        trx.start().unwrap();

        writer.write(packet(&pool, 1, addr_a)).unwrap();
        writer.write(packet(&pool, 2, addr_b)).unwrap();

        let a = rx_a.recv_timeout(Duration::from_secs(2)).unwrap();
        let b = rx_b.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(a.dst, Some(addr_a));
        assert_eq!(a.src, Some(writer.local_addr()));
        assert_eq!(b.seq, 2);
        let mut samples = [0.0f32; 2];
        b.read_samples(&mut samples);
        assert_eq!(samples, [2.0, -1.0]);

        trx.stop();
        trx.join();
    }

    #[test]
    fn unroutable_traffic_is_counted_not_fatal() {
        let (trx, pool) = transceiver();
        let (sink_a, rx_a) = sink();
        let addr_a = trx.add_inbound(loopback(), sink_a).unwrap();
        let writer = trx.add_endpoint(loopback()).unwrap();
        trx.start().unwrap();

        assert!(trx.remove_inbound(addr_a));
        assert!(!trx.remove_inbound(addr_a));
        writer.write(packet(&pool, 7, addr_a)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while trx.stats().unroutable == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(trx.stats().unroutable, 1);
        assert!(rx_a.try_recv().is_err());
        assert!(trx.is_running());
    }

    #[test]
    fn garbage_datagrams_are_dropped() {
        let (trx, _pool) = transceiver();
        let (sink_a, rx_a) = sink();
        let addr_a = trx.add_inbound(loopback(), sink_a).unwrap();
        trx.start().unwrap();

        let raw = UdpSocket::bind("127.0.0.1:0").unwrap();
        raw.send_to(b"not a packet", SocketAddr::from(addr_a)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while trx.stats().decode_errors == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(trx.stats().decode_errors, 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn duplicate_sink_registration_rejected() {
        let (trx, _pool) = transceiver();
        let (first, _rx1) = sink();
        let (second, _rx2) = sink();
        let addr = trx.add_inbound(loopback(), first).unwrap();
        assert!(matches!(
            trx.add_inbound(addr, second),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn full_queue_is_backpressure() {
        let pool = PacketPool::new(8, BufferPool::new(8, 512));
        let trx = Transceiver::new(pool.clone(), 512, 2);
        let writer = trx.add_endpoint(loopback()).unwrap();
        let dst = Address::parse("127.0.0.1:9").unwrap();
        // Not started: nothing drains the queue.
        writer.write(packet(&pool, 0, dst)).unwrap();
        writer.write(packet(&pool, 1, dst)).unwrap();
        assert!(matches!(
            writer.write(packet(&pool, 2, dst)),
            Err(Error::ResourceExhausted("outbound queue"))
        ));
    }

    #[test]
    fn stop_is_idempotent_and_closes_writers() {
        let (trx, pool) = transceiver();
        let writer = trx.add_endpoint(loopback()).unwrap();
        trx.start().unwrap();
        trx.stop();
        trx.stop();
        trx.join();
        trx.join();
        assert!(!trx.is_running());
        let dst = Address::parse("127.0.0.1:9").unwrap();
        assert!(matches!(
            writer.write(packet(&pool, 0, dst)),
            Err(Error::Closed)
        ));
        assert!(matches!(trx.start(), Err(Error::InvalidState { .. })));
        assert!(trx.add_endpoint(loopback()).is_err());
    }

    #[test]
    fn stopping_releases_queued_packets() {
        let pool = PacketPool::new(8, BufferPool::new(8, 512));
        let trx = Transceiver::new(pool.clone(), 512, 8);
        let writer = trx.add_endpoint(loopback()).unwrap();
        let dst = Address::parse("127.0.0.1:9").unwrap();
        writer.write(packet(&pool, 0, dst)).unwrap();
        assert_eq!(pool.in_flight(), 1);
        trx.stop();
        trx.join();
        assert_eq!(pool.in_flight(), 0);
    }
}
