//! # Loss-Simulating Proxy
//!
//! A [`PacketSink`] that sits between a sender and a receiver on the same
//! transceiver, forwarding each packet with its addresses rewritten and
//! discarding some according to a [`LossModel`]:
//!
//! ```text
//!   sender ──▶ proxy.source_addr ─┐             ┌─▶ receiver source
//!                                 ├─ drop? ─▶ ──┤
//!   sender ──▶ proxy.repair_addr ─┘             └─▶ receiver repair
//! ```
//!
//! Used to inject faults in tests. It takes packets through the same sink
//! interface a receiver does.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::stats::ProxyStats;
use crate::transceiver::{PacketSink, PacketWriter, Transceiver};

/// Which packets the proxy discards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossModel {
    /// Forward everything.
    None,
    /// Drop packet `n` (counted across both streams) when
    /// `n % period == phase`.
    EveryNth { period: u64, phase: u64 },
    /// Drop each packet independently with `probability`, reproducibly
    /// for a given `seed`.
    Random { probability: f64, seed: u64 },
}

impl LossModel {
    /// One drop per block of `block_len` packets, at the second slot.
    pub fn one_per_block(block_len: usize) -> Self {
        LossModel::EveryNth {
            period: block_len as u64,
            phase: 1,
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            LossModel::EveryNth { period, phase } if period == 0 || phase >= period => Err(
                Error::ConfigInvalid(format!("loss phase {phase} outside period {period}")),
            ),
            LossModel::Random { probability, .. } if !(0.0..=1.0).contains(&probability) => Err(
                Error::ConfigInvalid(format!("loss probability {probability} outside [0, 1]")),
            ),
            _ => Ok(()),
        }
    }
}

struct Dropper {
    model: LossModel,
    count: u64,
    rng: Option<StdRng>,
}

impl Dropper {
    fn new(model: LossModel) -> Self {
        let rng = match model {
            LossModel::Random { seed, .. } => Some(StdRng::seed_from_u64(seed)),
            _ => None,
        };
        Dropper {
            model,
            count: 0,
            rng,
        }
    }

    fn should_drop(&mut self) -> bool {
        let n = self.count;
        self.count += 1;
        match self.model {
            LossModel::None => false,
            LossModel::EveryNth { period, phase } => n % period == phase,
            LossModel::Random { probability, .. } => match self.rng.as_mut() {
                Some(rng) => rng.random::<f64>() < probability,
                None => false,
            },
        }
    }
}

struct Core {
    writer: PacketWriter,
    dropper: Mutex<Dropper>,
    stats: Mutex<ProxyStats>,
}

impl Core {
    fn stats(&self) -> MutexGuard<'_, ProxyStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Listening side of one stream: everything arriving here is forwarded to
/// `forward_to`.
struct StreamSink {
    forward_to: Address,
    core: Arc<Core>,
}

impl PacketSink for StreamSink {
    fn write(&self, mut packet: Packet) -> Result<()> {
        let core = &self.core;
        let drop_it = core
            .dropper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .should_drop();
        if drop_it {
            debug!(role = %packet.role, seq = packet.seq, block = packet.block, "proxy dropped packet");
            core.stats().dropped += 1;
            return Ok(());
        }

        packet.src = Some(core.writer.local_addr());
        packet.dst = Some(self.forward_to);
        match core.writer.write(packet.into_ptr()) {
            Ok(()) => {
                core.stats().forwarded += 1;
                Ok(())
            }
            Err(e) => {
                core.stats().rejected += 1;
                Err(e)
            }
        }
    }
}

pub struct LossyProxy {
    transceiver: Arc<Transceiver>,
    core: Arc<Core>,
    recv_source: Address,
    recv_repair: Address,
    stopped: Mutex<bool>,
}

impl LossyProxy {
    /// Bind a send endpoint and two listening addresses on `host`, forwarding
    /// what arrives to `dst_source` and `dst_repair` respectively.
    pub fn new(
        transceiver: &Arc<Transceiver>,
        host: IpAddr,
        dst_source: Address,
        dst_repair: Address,
        model: LossModel,
    ) -> Result<Self> {
        model.validate()?;
        let ephemeral = Address::from(SocketAddr::new(host, 0));
        let core = Arc::new(Core {
            writer: transceiver.add_endpoint(ephemeral)?,
            dropper: Mutex::new(Dropper::new(model)),
            stats: Mutex::new(ProxyStats::new()),
        });
        let sink = |forward_to| -> Arc<dyn PacketSink> {
            Arc::new(StreamSink {
                forward_to,
                core: Arc::clone(&core),
            })
        };

        let recv_source = transceiver.add_inbound(ephemeral, sink(dst_source))?;
        let recv_repair = match transceiver.add_inbound(ephemeral, sink(dst_repair)) {
            Ok(addr) => addr,
            Err(e) => {
                transceiver.remove_inbound(recv_source);
                return Err(e);
            }
        };
        info!(
            source = %recv_source,
            repair = %recv_repair,
            ?model,
            "loss proxy listening"
        );
        Ok(LossyProxy {
            transceiver: Arc::clone(transceiver),
            core,
            recv_source,
            recv_repair,
            stopped: Mutex::new(false),
        })
    }

    /// Where senders should direct source packets.
    pub fn source_addr(&self) -> Address {
        self.recv_source
    }

    /// Where senders should direct repair packets.
    pub fn repair_addr(&self) -> Address {
        self.recv_repair
    }

    /// Address forwarded packets leave from.
    pub fn send_addr(&self) -> Address {
        self.core.writer.local_addr()
    }

    pub fn stats(&self) -> ProxyStats {
        self.core.stats().clone()
    }

    /// Stop forwarding. Idempotent.
    pub fn stop(&self) {
        let mut stopped = self.stopped.lock().unwrap_or_else(|e| e.into_inner());
        if *stopped {
            return;
        }
        *stopped = true;
        self.transceiver.remove_inbound(self.recv_source);
        self.transceiver.remove_inbound(self.recv_repair);
        let stats = self.core.stats().clone();
        info!(
            forwarded = stats.forwarded,
            dropped = stats.dropped,
            "loss proxy stopped"
        );
    }
}

impl Drop for LossyProxy {
    fn drop(&mut self) {
        self.stop();
    }
}
