//! # Sender Pipeline
//!
//! ```text
//!   write(&[f32]) ─▶ packetizer ─▶ queue ─▶ dispatch thread ─▶ transceiver
//!                                           ├─ FecEncoder (repairs per block)
//!                                           ├─ Interleaver (source order)
//!                                           └─ pacing timer
//! ```
//!
//! `write` runs on the caller's thread. It cuts the interleaved samples into
//! packets of `samples_per_packet * channels` samples, numbers them, and hands
//! each finished packet to the dispatch thread over a bounded queue, blocking
//! while the queue or the packet pool is full.
//!
//! The dispatch thread feeds every source packet to the FEC encoder, releases
//! source packets (interleaved per block unless disabled), and sends the
//! block's repair packets once its last source packet has been produced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, SendTimeoutError};
use quanta::Instant;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::codec::{ErasureCodec, FecEncoder, RepairBlock};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::interleaver::Interleaver;
use crate::packet::{Packet, PacketPtr, Role};
use crate::pool::{PacketPool, SequenceGenerator};
use crate::session::{Context, LifecycleState};
use crate::stats::SenderStats;
use crate::transceiver::{PacketWriter, Transceiver};

/// Wait between retries when a pool or queue is full.
const BACKOFF: Duration = Duration::from_micros(500);

/// How often a blocked call re-checks for `stop`.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on the time `stop` spends flushing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Setup {
    state: LifecycleState,
    endpoint: Option<PacketWriter>,
    source_dst: Option<Address>,
    repair_dst: Option<Address>,
}

struct Packetizer {
    pending: Option<Packet>,
    seq: SequenceGenerator,
    destination: Option<Address>,
    queue: Option<crossbeam_channel::Sender<Packet>>,
}

struct Shared {
    stopping: AtomicBool,
    stats: Mutex<SenderStats>,
}

pub struct Sender {
    config: SessionConfig,
    packets: PacketPool,
    codec: Arc<dyn ErasureCodec>,
    transceiver: Arc<Transceiver>,
    setup: Mutex<Setup>,
    packetizer: Mutex<Packetizer>,
    shared: Arc<Shared>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Sender {
    pub fn new(context: &Context, config: SessionConfig) -> Result<Self> {
        config.validate_for(context.config())?;
        Ok(Sender {
            config,
            packets: context.packet_pool().clone(),
            codec: Arc::clone(context.codec()),
            transceiver: Arc::clone(context.transceiver()),
            setup: Mutex::new(Setup {
                state: LifecycleState::Created,
                endpoint: None,
                source_dst: None,
                repair_dst: None,
            }),
            packetizer: Mutex::new(Packetizer {
                pending: None,
                seq: SequenceGenerator::new(),
                destination: None,
                queue: None,
            }),
            shared: Arc::new(Shared {
                stopping: AtomicBool::new(false),
                stats: Mutex::new(SenderStats::new()),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Send from `local`. Returns the bound address. Without an explicit
    /// bind, `start` picks an ephemeral port.
    pub fn bind(&self, local: Address) -> Result<Address> {
        let mut setup = lock(&self.setup);
        require_created(&setup, "bind")?;
        let endpoint = self.transceiver.add_endpoint(local)?;
        let bound = endpoint.local_addr();
        setup.endpoint = Some(endpoint);
        Ok(bound)
    }

    /// Point the `role` sub-stream at `destination`.
    pub fn connect(&self, role: Role, destination: Address) -> Result<()> {
        let mut setup = lock(&self.setup);
        require_created(&setup, "connect")?;
        match role {
            Role::Source => setup.source_dst = Some(destination),
            Role::Repair => setup.repair_dst = Some(destination),
        }
        debug!(%role, dst = %destination, "sender connected");
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mut setup = lock(&self.setup);
        require_created(&setup, "start")?;
        let Some(source_dst) = setup.source_dst else {
            return Err(Error::InvalidState {
                op: "start",
                state: setup.state,
            });
        };
        if self.config.fec_enabled() && setup.repair_dst.is_none() {
            return Err(Error::InvalidState {
                op: "start",
                state: setup.state,
            });
        }
        let writer = match &setup.endpoint {
            Some(writer) => writer.clone(),
            None => {
                let any = if source_dst.socket_addr().is_ipv4() {
                    "0.0.0.0:0"
                } else {
                    "[::]:0"
                };
                let writer = self.transceiver.add_endpoint(Address::parse(any)?)?;
                setup.endpoint = Some(writer.clone());
                writer
            }
        };

        let queue_depth = self.config.n_source_packets.max(16);
        let (tx, rx) = bounded(queue_depth);
        let worker = Worker {
            config: self.config.clone(),
            packets: self.packets.clone(),
            writer,
            repair_dst: setup.repair_dst,
            encoder: FecEncoder::new(
                Arc::clone(&self.codec),
                self.config.n_source_packets,
                self.config.n_repair_packets,
            ),
            interleaver: (!self.config.flags.disable_interleaver)
                .then(|| Interleaver::new(self.config.n_source_packets)),
            repair_seq: SequenceGenerator::new(),
            epoch: None,
            shared: Arc::clone(&self.shared),
        };
        let handle = thread::Builder::new()
            .name("cadence-sender".into())
            .spawn(move || worker.run(rx))?;

        {
            let mut pz = lock(&self.packetizer);
            pz.destination = Some(source_dst);
            pz.queue = Some(tx);
        }
        *lock(&self.worker) = Some(handle);
        setup.state = LifecycleState::Started;
        info!(
            dst = %source_dst,
            samples_per_packet = self.config.samples_per_packet,
            n_source = self.config.n_source_packets,
            n_repair = self.config.n_repair_packets,
            "sender started"
        );
        Ok(())
    }

    /// Queue interleaved samples for transmission.
    ///
    /// Blocks under backpressure and returns `samples.len()` once every sample
    /// has been packetized. Fails with `Closed` if the sender is or becomes
    /// stopped.
    pub fn write(&self, samples: &[f32]) -> Result<usize> {
        match self.state() {
            LifecycleState::Started => {}
            LifecycleState::Stopped => return Err(Error::Closed),
            state => return Err(Error::InvalidState { op: "write", state }),
        }
        let packet_samples = self.config.packet_samples();
        let mut pz = lock(&self.packetizer);
        let mut written = 0;
        while written < samples.len() {
            if self.shared.stopping.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let packet = match pz.pending.take() {
                Some(packet) => packet,
                None => self.acquire(Role::Source, None)?,
            };
            let packet = pz.pending.insert(packet);
            let take = (packet_samples - packet.sample_count()).min(samples.len() - written);
            packet.push_samples(&samples[written..written + take])?;
            written += take;
            if packet.sample_count() == packet_samples {
                if let Some(packet) = pz.pending.take() {
                    self.dispatch(&mut pz, packet, None)?;
                }
            }
        }
        lock(&self.shared.stats).samples_written += samples.len() as u64;
        Ok(samples.len())
    }

    /// Flush and shut down. Safe to call repeatedly and concurrently with a
    /// blocked `write`, which then fails with `Closed`.
    pub fn stop(&self) -> Result<()> {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let was = {
            let mut setup = lock(&self.setup);
            std::mem::replace(&mut setup.state, LifecycleState::Stopped)
        };
        if was != LifecycleState::Started {
            return Ok(());
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        {
            let mut pz = lock(&self.packetizer);
            if let Err(e) = self.flush(&mut pz, deadline) {
                warn!(error = %e, "sender flush incomplete");
            }
            pz.pending = None;
            pz.queue = None;
        }
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("sender dispatch thread panicked");
            }
        }
        info!("sender stopped");
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.setup).state
    }

    pub fn local_addr(&self) -> Option<Address> {
        lock(&self.setup).endpoint.as_ref().map(PacketWriter::local_addr)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> SenderStats {
        lock(&self.shared.stats).clone()
    }

    /// Pad the pending packet with silence, then complete the current block
    /// with silent packets so the receiver can resolve it.
    fn flush(&self, pz: &mut Packetizer, deadline: Instant) -> Result<()> {
        if let Some(mut packet) = pz.pending.take() {
            let missing = self.config.packet_samples() - packet.sample_count();
            packet.push_samples(&vec![0.0; missing])?;
            self.dispatch(pz, packet, Some(deadline))?;
        }
        let n_source = self.config.n_source_packets as u64;
        while pz.seq.current() % n_source != 0 {
            let mut packet = self.acquire(Role::Source, Some(deadline))?;
            packet.push_samples(&vec![0.0; self.config.packet_samples()])?;
            self.dispatch(pz, packet, Some(deadline))?;
            lock(&self.shared.stats).padding_packets += 1;
        }
        Ok(())
    }

    /// Take a packet from the pool, waiting out exhaustion. `drain_deadline`
    /// is set while flushing on stop.
    fn acquire(&self, role: Role, drain_deadline: Option<Instant>) -> Result<Packet> {
        loop {
            match self.packets.acquire(role) {
                Ok(packet) => return Ok(packet),
                Err(e) if e.is_transient() => {
                    lock(&self.shared.stats).backpressure_retries += 1;
                    match drain_deadline {
                        Some(deadline) if Instant::now() > deadline => return Err(e),
                        None if self.shared.stopping.load(Ordering::Acquire) => {
                            return Err(Error::Closed)
                        }
                        _ => thread::sleep(BACKOFF),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Number a full source packet and hand it to the dispatch thread.
    fn dispatch(
        &self,
        pz: &mut Packetizer,
        mut packet: Packet,
        drain_deadline: Option<Instant>,
    ) -> Result<()> {
        let n_source = self.config.n_source_packets as u64;
        let seq = pz.seq.next();
        packet.seq = seq;
        packet.block = seq / n_source;
        packet.index = (seq % n_source) as u16;
        packet.n_source = self.config.n_source_packets as u16;
        packet.n_repair = self.config.n_repair_packets as u16;
        packet.dst = pz.destination;

        let queue = pz.queue.as_ref().ok_or(Error::Closed)?;
        loop {
            match queue.send_timeout(packet, POLL_INTERVAL) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => {
                    lock(&self.shared.stats).backpressure_retries += 1;
                    let give_up = match drain_deadline {
                        Some(deadline) => Instant::now() > deadline,
                        None => self.shared.stopping.load(Ordering::Acquire),
                    };
                    if give_up {
                        return Err(Error::Closed);
                    }
                    packet = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Err(Error::Closed),
            }
        }
    }
}

impl Drop for Sender {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn require_created(setup: &Setup, op: &'static str) -> Result<()> {
    match setup.state {
        LifecycleState::Created => Ok(()),
        LifecycleState::Stopped => Err(Error::Closed),
        state => Err(Error::InvalidState { op, state }),
    }
}

// ─── Dispatch thread ─────────────────────────────────────────────────────────

struct Worker {
    config: SessionConfig,
    packets: PacketPool,
    writer: PacketWriter,
    repair_dst: Option<Address>,
    encoder: FecEncoder,
    interleaver: Option<Interleaver>,
    repair_seq: SequenceGenerator,
    /// Wall time of source packet 0, once pacing has begun.
    epoch: Option<Instant>,
    shared: Arc<Shared>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Packet>) {
        debug!(from = %self.writer.local_addr(), "sender dispatch running");
        while let Ok(packet) = rx.recv() {
            if !self.handle(packet) {
                break;
            }
        }
        if let Some(interleaver) = self.interleaver.as_mut() {
            let rest = interleaver.flush();
            for packet in rest {
                if !self.send(packet, Role::Source) {
                    break;
                }
            }
        }
        debug!("sender dispatch exiting");
    }

    /// Returns false once the transceiver refuses packets for good.
    fn handle(&mut self, packet: Packet) -> bool {
        let ptr = packet.into_ptr();
        let repairs = match self.encoder.push(Arc::clone(&ptr)) {
            Ok(repairs) => repairs,
            Err(e) => {
                warn!(block = ptr.block, error = %e, "FEC encode failed");
                None
            }
        };
        let ready = match self.interleaver.as_mut() {
            Some(interleaver) => interleaver.push(ptr),
            None => vec![ptr],
        };
        for packet in ready {
            if !self.send(packet, Role::Source) {
                return false;
            }
        }
        match repairs {
            Some(repairs) => self.send_repairs(repairs),
            None => true,
        }
    }

    fn send_repairs(&mut self, repairs: RepairBlock) -> bool {
        let Some(dst) = self.repair_dst else {
            return true;
        };
        let n_source = self.config.n_source_packets;
        for (r, payload) in repairs.payloads.iter().enumerate() {
            let Some(mut packet) = self.acquire_repair() else {
                warn!(block = repairs.block, "no packet for repair, block sent without it");
                return true;
            };
            if let Err(e) = packet.set_payload(payload) {
                warn!(block = repairs.block, error = %e, "repair payload rejected");
                continue;
            }
            packet.seq = self.repair_seq.next();
            packet.block = repairs.block;
            packet.index = (n_source + r) as u16;
            packet.n_source = n_source as u16;
            packet.n_repair = self.config.n_repair_packets as u16;
            packet.dst = Some(dst);
            if !self.send(packet.into_ptr(), Role::Repair) {
                return false;
            }
        }
        lock(&self.shared.stats).blocks_encoded += 1;
        true
    }

    /// Gives up only if the pool stays exhausted past the drain timeout
    /// while stopping.
    fn acquire_repair(&self) -> Option<Packet> {
        let mut stop_seen: Option<Instant> = None;
        loop {
            match self.packets.acquire(Role::Repair) {
                Ok(packet) => return Some(packet),
                Err(_) => {
                    lock(&self.shared.stats).backpressure_retries += 1;
                    if self.shared.stopping.load(Ordering::Acquire) {
                        let since = *stop_seen.get_or_insert_with(Instant::now);
                        if Instant::now().duration_since(since) > DRAIN_TIMEOUT {
                            return None;
                        }
                    }
                    thread::sleep(BACKOFF);
                }
            }
        }
    }

    /// Pace and queue one packet. Returns false once the transceiver is
    /// closed.
    fn send(&mut self, packet: PacketPtr, role: Role) -> bool {
        if role == Role::Source {
            self.pace(packet.seq);
        }
        loop {
            match self.writer.write(Arc::clone(&packet)) {
                Ok(()) => break,
                Err(Error::ResourceExhausted(_)) => {
                    lock(&self.shared.stats).backpressure_retries += 1;
                    thread::sleep(BACKOFF);
                }
                Err(e) => {
                    debug!(error = %e, "transceiver refused packet");
                    return false;
                }
            }
        }
        let mut stats = lock(&self.shared.stats);
        match role {
            Role::Source => stats.source_packets_sent += 1,
            Role::Repair => stats.repair_packets_sent += 1,
        }
        true
    }

    /// Hold packet `seq` until its nominal play time. Skipped while stopping.
    fn pace(&mut self, seq: u64) {
        if !self.config.flags.enable_timer {
            return;
        }
        let epoch = *self.epoch.get_or_insert_with(Instant::now);
        let due = epoch
            + self
                .config
                .frames_to_duration(seq as usize * self.config.samples_per_packet);
        while !self.shared.stopping.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= due {
                return;
            }
            thread::sleep(due.duration_since(now).min(POLL_INTERVAL));
        }
    }
}
