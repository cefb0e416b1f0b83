//! # Receiver Pipeline
//!
//! ```text
//!   transceiver ─▶ RoleSink(source) ─┐
//!                                    ├─▶ BlockTable ─▶ JitterBuffer ─▶ read(&mut [f32])
//!   transceiver ─▶ RoleSink(repair) ─┘   (FEC, order)  (latency, state)
//! ```
//!
//! Packet intake runs on the transceiver's I/O thread: each packet is filed
//! into its FEC block and every block that becomes resolvable is decoded into
//! the jitter buffer right away. `read` runs on the application thread,
//! waiting on a condvar until the buffer can serve the frame or the timeout
//! passes, in which case the frame is completed with silence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use quanta::Instant;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::codec::{BlockOutcome, BlockTable, Insert};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::jitter::{JitterBuffer, StreamState};
use crate::packet::{decode_samples, Packet, Role};
use crate::session::{Context, LifecycleState};
use crate::stats::ReceiverStats;
use crate::transceiver::{PacketSink, Transceiver};

/// Longest a blocked `read` sleeps before re-checking block deadlines.
const WAIT_SLICE: Duration = Duration::from_millis(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    table: BlockTable,
    jitter: JitterBuffer,
    stats: ReceiverStats,
    /// Decode scratch, one packet long.
    scratch: Vec<f32>,
    /// Pacing origin: wall time and samples read when playback began.
    pace_epoch: Option<(Instant, u64)>,
    closed: bool,
}

struct Core {
    config: SessionConfig,
    inner: Mutex<Inner>,
    ready: Condvar,
    closed: AtomicBool,
}

impl Core {
    fn accept(&self, packet: Packet) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.closed {
            return Err(Error::Closed);
        }
        inner.stats.packets_received += 1;
        let now = Instant::now();
        match inner.table.insert(packet, now) {
            Insert::Accepted => {}
            Insert::Duplicate => inner.stats.duplicates += 1,
            Insert::Late => inner.stats.late_packets += 1,
            Insert::Mismatch => inner.stats.mismatched += 1,
        }
        if self.resolve(&mut inner, now) {
            self.ready.notify_all();
        }
        Ok(())
    }

    /// Move every resolvable block into the jitter buffer. Returns whether
    /// anything was emitted.
    fn resolve(&self, inner: &mut Inner, now: Instant) -> bool {
        let block_samples = self.config.block_samples();
        let mut emitted = false;
        while let Some(outcome) = inner.table.poll(now) {
            emitted = true;
            let dropped = match outcome {
                BlockOutcome::Decoded {
                    block,
                    shards,
                    restored,
                } => {
                    if restored > 0 {
                        debug!(block, restored, "block repaired");
                    }
                    inner.stats.blocks_resolved += 1;
                    inner.stats.fec_restored += restored as u64;
                    let Inner {
                        jitter, scratch, ..
                    } = &mut *inner;
                    let mut dropped = 0;
                    for shard in &shards {
                        let n = decode_samples(shard.bytes(), scratch);
                        dropped += jitter.push(&scratch[..n]);
                    }
                    dropped
                }
                BlockOutcome::Lost { block, count } => {
                    warn!(block, count, "replacing lost blocks with silence");
                    inner.stats.blocks_lost += count;
                    let silence = (count as usize).saturating_mul(block_samples);
                    inner.jitter.push_silence(silence)
                }
            };
            if dropped > 0 {
                debug!(dropped, "jitter buffer overflow");
            }
        }
        inner.stats.overflow_samples = inner.jitter.overflow();
        inner.stats.queue_depth = inner.jitter.len() as u64;
        emitted
    }
}

/// Inbound sink for one role's address.
struct RoleSink {
    role: Role,
    core: Arc<Core>,
}

impl PacketSink for RoleSink {
    fn write(&self, packet: Packet) -> Result<()> {
        if packet.role != self.role {
            debug!(expected = %self.role, got = %packet.role, seq = packet.seq, "misrouted packet");
            lock(&self.core.inner).stats.misrouted += 1;
            return Ok(());
        }
        self.core.accept(packet)
    }
}

struct Setup {
    state: LifecycleState,
    source: Option<Address>,
    repair: Option<Address>,
}

pub struct Receiver {
    config: SessionConfig,
    transceiver: Arc<Transceiver>,
    core: Arc<Core>,
    setup: Mutex<Setup>,
}

impl Receiver {
    pub fn new(context: &Context, config: SessionConfig) -> Result<Self> {
        config.validate_for(context.config())?;
        let inner = Inner {
            table: BlockTable::new(Arc::clone(context.codec()), &config),
            jitter: JitterBuffer::new(config.latency_samples(), config.jitter_capacity()),
            stats: ReceiverStats::new(),
            scratch: vec![0.0; config.packet_samples()],
            pace_epoch: None,
            closed: false,
        };
        Ok(Receiver {
            transceiver: Arc::clone(context.transceiver()),
            core: Arc::new(Core {
                config: config.clone(),
                inner: Mutex::new(inner),
                ready: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
            config,
            setup: Mutex::new(Setup {
                state: LifecycleState::Created,
                source: None,
                repair: None,
            }),
        })
    }

    /// Listen for `role` packets on `local`. Returns the bound address.
    pub fn bind(&self, role: Role, local: Address) -> Result<Address> {
        let mut setup = lock(&self.setup);
        match setup.state {
            LifecycleState::Created => {}
            LifecycleState::Stopped => return Err(Error::Closed),
            state => return Err(Error::InvalidState { op: "bind", state }),
        }
        let slot = match role {
            Role::Source => &mut setup.source,
            Role::Repair => &mut setup.repair,
        };
        if let Some(existing) = slot {
            return Err(Error::ConfigInvalid(format!(
                "{role} stream already bound to {existing}"
            )));
        }
        let sink = Arc::new(RoleSink {
            role,
            core: Arc::clone(&self.core),
        });
        let bound = self.transceiver.add_inbound(local, sink)?;
        *slot = Some(bound);
        debug!(%role, addr = %bound, "receiver bound");
        Ok(bound)
    }

    pub fn start(&self) -> Result<()> {
        let mut setup = lock(&self.setup);
        if setup.state != LifecycleState::Created || setup.source.is_none() {
            return Err(Error::InvalidState {
                op: "start",
                state: setup.state,
            });
        }
        if self.config.fec_enabled() && setup.repair.is_none() {
            warn!("FEC configured but no repair stream bound; losses will not be repaired");
        }
        if !self.config.flags.disable_resampler {
            info!("no resampler available, emitting at the nominal rate");
        }
        setup.state = LifecycleState::Started;
        info!(
            latency = self.config.latency,
            timeout = self.config.timeout,
            "receiver started"
        );
        Ok(())
    }

    /// Fill `out` with the next interleaved samples.
    ///
    /// Waits until the jitter buffer can serve the whole slice, at most the
    /// configured timeout; past that the slice is completed with silence and
    /// an underrun is recorded. Always returns `out.len()` unless the
    /// receiver is stopped, which fails with `Closed`.
    pub fn read(&self, out: &mut [f32]) -> Result<usize> {
        match self.state() {
            LifecycleState::Started => {}
            LifecycleState::Stopped => return Err(Error::Closed),
            state => return Err(Error::InvalidState { op: "read", state }),
        }
        if out.is_empty() {
            return Ok(0);
        }

        let deadline = Instant::now() + self.config.timeout_duration();
        let mut inner = lock(&self.core.inner);
        let delivery = loop {
            if inner.closed {
                return Err(Error::Closed);
            }
            let now = Instant::now();
            self.core.resolve(&mut inner, now);
            if let Some(delivery) = inner.jitter.read(out, now >= deadline) {
                break delivery;
            }
            let wait = deadline.saturating_duration_since(now).min(WAIT_SLICE);
            inner = self
                .core
                .ready
                .wait_timeout(inner, wait.max(Duration::from_micros(100)))
                .unwrap_or_else(|e| e.into_inner())
                .0;
        };

        inner.stats.samples_read += out.len() as u64;
        inner.stats.queue_depth = inner.jitter.len() as u64;
        if delivery.underrun {
            inner.stats.underruns += 1;
            debug!(
                filled = delivery.from_queue,
                requested = out.len(),
                "read underrun"
            );
        }
        let due = self.pacing_due(&mut inner);
        drop(inner);

        if let Some(due) = due {
            self.sleep_until(due);
        }
        Ok(out.len())
    }

    /// `Ok` with the playback state while data flows, `Err(Stalled)` while
    /// the stream is running dry, `Err(Closed)` after `stop`.
    pub fn check_stream(&self) -> Result<StreamState> {
        match lock(&self.core.inner).jitter.state() {
            StreamState::Stalled => Err(Error::Stalled),
            StreamState::Closed => Err(Error::Closed),
            state => Ok(state),
        }
    }

    /// Unblock any reader and release buffered packets. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let (source, repair) = {
            let mut setup = lock(&self.setup);
            if setup.state == LifecycleState::Stopped {
                return Ok(());
            }
            setup.state = LifecycleState::Stopped;
            (setup.source, setup.repair)
        };
        for addr in [source, repair].into_iter().flatten() {
            self.transceiver.remove_inbound(addr);
        }
        self.core.closed.store(true, Ordering::Release);
        {
            let mut inner = lock(&self.core.inner);
            inner.closed = true;
            inner.jitter.close();
            inner.table.clear();
        }
        self.core.ready.notify_all();
        info!("receiver stopped");
        Ok(())
    }

    pub fn state(&self) -> LifecycleState {
        lock(&self.setup).state
    }

    pub fn stream_state(&self) -> StreamState {
        lock(&self.core.inner).jitter.state()
    }

    pub fn local_addr(&self, role: Role) -> Option<Address> {
        let setup = lock(&self.setup);
        match role {
            Role::Source => setup.source,
            Role::Repair => setup.repair,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn stats(&self) -> ReceiverStats {
        lock(&self.core.inner).stats.clone()
    }

    /// When pacing, the wall time at which the samples read so far are due.
    fn pacing_due(&self, inner: &mut Inner) -> Option<Instant> {
        if !self.config.flags.enable_timer || inner.jitter.state() != StreamState::Streaming {
            inner.pace_epoch = None;
            return None;
        }
        let total = inner.stats.samples_read;
        let (epoch, base) = *inner.pace_epoch.get_or_insert((Instant::now(), total));
        let frames = (total - base) as usize / self.config.channels;
        Some(epoch + self.config.frames_to_duration(frames))
    }

    fn sleep_until(&self, due: Instant) {
        while !self.core.closed.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= due {
                return;
            }
            thread::sleep(due.duration_since(now).min(WAIT_SLICE));
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
