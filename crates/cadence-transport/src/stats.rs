//! # Pipeline Statistics
//!
//! Counters kept by the sender, receiver, transceiver and loss proxy. Each component
//! updates its own struct under the lock it already holds and hands out
//! clones as snapshots. All snapshots serialize to JSON.

use serde::Serialize;

// ─── Sender Stats ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    /// Samples accepted by `write`.
    pub samples_written: u64,
    pub source_packets_sent: u64,
    pub repair_packets_sent: u64,
    pub blocks_encoded: u64,
    /// Times a pool or queue pushed back and the call had to retry.
    pub backpressure_retries: u64,
    /// Silent source packets added to complete the last block on stop.
    pub padding_packets: u64,
}

impl SenderStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Repair overhead actually put on the wire.
    pub fn repair_ratio(&self) -> f64 {
        if self.source_packets_sent == 0 {
            0.0
        } else {
            self.repair_packets_sent as f64 / self.source_packets_sent as f64
        }
    }
}

// ─── Receiver Stats ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub duplicates: u64,
    /// Packets for blocks already emitted or written off.
    pub late_packets: u64,
    /// Packets whose block geometry disagrees with the session.
    pub mismatched: u64,
    /// Packets that arrived on the other role's address.
    pub misrouted: u64,
    /// Source packets rebuilt by the erasure codec.
    pub fec_restored: u64,
    pub blocks_resolved: u64,
    /// Blocks replaced by silence.
    pub blocks_lost: u64,
    /// Reads that had to be completed with silence.
    pub underruns: u64,
    /// Samples dropped because the queue was full.
    pub overflow_samples: u64,
    /// Samples handed to the application, silence included.
    pub samples_read: u64,
    /// Samples currently queued.
    pub queue_depth: u64,
}

impl ReceiverStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of emitted blocks that had to be written off.
    pub fn block_loss_rate(&self) -> f64 {
        let total = self.blocks_resolved + self.blocks_lost;
        if total == 0 {
            0.0
        } else {
            self.blocks_lost as f64 / total as f64
        }
    }
}

// ─── Transceiver Stats ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransceiverStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub send_errors: u64,
    /// Datagrams that did not parse as packets.
    pub decode_errors: u64,
    /// Packets for an address with no registered sink.
    pub unroutable: u64,
    /// Inbound datagrams dropped because the packet pool was exhausted.
    pub pool_drops: u64,
    /// Packets a sink refused.
    pub sink_rejects: u64,
}

impl TransceiverStats {
    pub fn new() -> Self {
        Self::default()
    }
}

// ─── Proxy Stats ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProxyStats {
    pub forwarded: u64,
    /// Packets discarded by the loss model.
    pub dropped: u64,
    /// Packets the outbound queue refused.
    pub rejected: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of offered packets the loss model discarded.
    pub fn drop_rate(&self) -> f64 {
        let total = self.forwarded + self.dropped + self.rejected;
        if total == 0 {
            0.0
        } else {
            self.dropped as f64 / total as f64
        }
    }
}
