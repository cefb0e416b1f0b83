//! # Configuration
//!
//! Two layers, both immutable once a session starts:
//!
//! - [`ContextConfig`] sizes the resources shared by every session on a
//!   [`Context`](crate::session::Context): the packet and buffer pools and the
//!   transceiver's outbound queue.
//! - [`SessionConfig`] is the per-stream contract both ends must agree on:
//!   packet size, FEC geometry, latency, timeout and feature flags.
//!
//! Sample counts (`samples_per_packet`, `latency`, `timeout`) are per channel.
//! Either config can be loaded from TOML; missing keys take the defaults.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::packet::SAMPLE_BYTES;
use crate::wire::{MAX_HEADER_SIZE, MAX_PAYLOAD_LEN};

pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;
pub const DEFAULT_CHANNELS: usize = 2;
pub const DEFAULT_SAMPLES_PER_PACKET: usize = 320;
pub const DEFAULT_SOURCE_PACKETS: usize = 20;
pub const DEFAULT_REPAIR_PACKETS: usize = 10;
/// 200 ms at the default rate.
pub const DEFAULT_LATENCY: usize = 8_820;
/// 2 s at the default rate.
pub const DEFAULT_TIMEOUT: usize = 88_200;

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Reed-Solomon limits of the erasure codec.
pub const MAX_SOURCE_PACKETS: usize = 32_768;
pub const MAX_BLOCK_PACKETS: usize = 65_535;

/// Upper bound on `latency` and `timeout`, in seconds of audio.
pub const MAX_BUFFER_SECONDS: usize = 60;

// ─── Flags ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Flags {
    /// Send source packets in production order instead of spreading each
    /// block with the interleaver.
    pub disable_interleaver: bool,
    /// Do not insert a resampler on the receive path.
    pub disable_resampler: bool,
    /// Pace sends (and steady-state reads) at the nominal sample rate.
    pub enable_timer: bool,
}

// ─── SessionConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub samples_per_packet: usize,
    pub channels: usize,
    pub sample_rate: u32,
    pub n_source_packets: usize,
    /// Zero disables FEC.
    pub n_repair_packets: usize,
    /// Receiver bootstrap depth.
    pub latency: usize,
    /// Longest silence tolerated before a block is written off or a read
    /// gives up waiting.
    pub timeout: usize,
    pub flags: Flags,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            samples_per_packet: DEFAULT_SAMPLES_PER_PACKET,
            channels: DEFAULT_CHANNELS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            n_source_packets: DEFAULT_SOURCE_PACKETS,
            n_repair_packets: DEFAULT_REPAIR_PACKETS,
            latency: DEFAULT_LATENCY,
            timeout: DEFAULT_TIMEOUT,
            flags: Flags::default(),
        }
    }
}

impl SessionConfig {
    /// Check the stream geometry on its own.
    pub fn validate(&self) -> Result<()> {
        if self.samples_per_packet == 0 {
            return Err(invalid("samples_per_packet must be > 0"));
        }
        if self.channels == 0 {
            return Err(invalid("channels must be > 0"));
        }
        if self.sample_rate == 0 {
            return Err(invalid("sample_rate must be > 0"));
        }
        if self.n_source_packets == 0 {
            return Err(invalid("n_source_packets must be > 0"));
        }
        if self.n_source_packets > MAX_SOURCE_PACKETS {
            return Err(invalid(format!(
                "n_source_packets {} exceeds {MAX_SOURCE_PACKETS}",
                self.n_source_packets
            )));
        }
        let block_packets = self.n_source_packets.saturating_add(self.n_repair_packets);
        if block_packets > MAX_BLOCK_PACKETS {
            return Err(invalid(format!(
                "block of {block_packets} packets exceeds {MAX_BLOCK_PACKETS}"
            )));
        }
        if self.timeout == 0 {
            return Err(invalid("timeout must be > 0"));
        }

        let payload = self
            .samples_per_packet
            .checked_mul(self.channels)
            .and_then(|n| n.checked_mul(SAMPLE_BYTES));
        match payload {
            Some(len) if len <= MAX_PAYLOAD_LEN => {}
            _ => {
                return Err(invalid(format!(
                    "{} samples x {} channels exceeds the {MAX_PAYLOAD_LEN}-byte payload limit",
                    self.samples_per_packet, self.channels
                )))
            }
        }
        let max_frames = (self.sample_rate as usize).saturating_mul(MAX_BUFFER_SECONDS);
        if self.latency > max_frames {
            return Err(invalid(format!(
                "latency {} exceeds {MAX_BUFFER_SECONDS} s at {} Hz",
                self.latency, self.sample_rate
            )));
        }
        if self.timeout > max_frames {
            return Err(invalid(format!(
                "timeout {} exceeds {MAX_BUFFER_SECONDS} s at {} Hz",
                self.timeout, self.sample_rate
            )));
        }
        if self.checked_jitter_capacity().is_none() {
            return Err(invalid("latency, timeout and block size overflow"));
        }
        Ok(())
    }

    /// Check the geometry and that one encoded packet fits a pooled buffer.
    pub fn validate_for(&self, context: &ContextConfig) -> Result<()> {
        self.validate()?;
        let needed = MAX_HEADER_SIZE + self.payload_len();
        if needed > context.buffer_size {
            return Err(invalid(format!(
                "packet of {needed} bytes does not fit buffer_size {}",
                context.buffer_size
            )));
        }
        Ok(())
    }

    /// Interleaved samples carried by one packet.
    pub fn packet_samples(&self) -> usize {
        self.samples_per_packet * self.channels
    }

    /// Payload bytes of every source and repair packet.
    pub fn payload_len(&self) -> usize {
        self.packet_samples() * SAMPLE_BYTES
    }

    /// Interleaved samples covered by one FEC block.
    pub fn block_samples(&self) -> usize {
        self.packet_samples() * self.n_source_packets
    }

    pub fn latency_samples(&self) -> usize {
        self.latency * self.channels
    }

    pub fn timeout_samples(&self) -> usize {
        self.timeout * self.channels
    }

    /// Blocks the receiver's head may fall behind the newest block before it
    /// is written off, about one timeout's worth.
    pub fn max_block_lag(&self) -> usize {
        self.timeout_samples()
            .div_ceil(self.block_samples().max(1))
            .max(1)
    }

    /// Interleaved samples the receiver may hold: the latency cushion plus
    /// the longest run of blocks released at once, a written-off head and
    /// every block up to `max_block_lag` past it.
    pub fn jitter_capacity(&self) -> usize {
        self.latency_samples() + (self.max_block_lag() + 2) * self.block_samples()
    }

    fn checked_jitter_capacity(&self) -> Option<usize> {
        let block = self
            .samples_per_packet
            .checked_mul(self.channels)?
            .checked_mul(self.n_source_packets)?;
        let lag = self
            .timeout
            .checked_mul(self.channels)?
            .div_ceil(block.max(1))
            .max(1);
        let run = lag.checked_add(2)?.checked_mul(block)?;
        self.latency.checked_mul(self.channels)?.checked_add(run)
    }

    pub fn fec_enabled(&self) -> bool {
        self.n_repair_packets > 0
    }

    /// Wall-clock length of `frames` per-channel samples at the nominal rate.
    pub fn frames_to_duration(&self, frames: usize) -> Duration {
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    pub fn timeout_duration(&self) -> Duration {
        self.frames_to_duration(self.timeout)
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(SessionConfig::default());
        }
        let parsed: SessionConfigInput = toml::from_str(input)
            .map_err(|e| invalid(format!("invalid session TOML: {e}")))?;
        parsed.resolve()
    }
}

// ─── ContextConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    pub packet_pool_capacity: usize,
    pub buffer_pool_capacity: usize,
    /// Bytes per pooled buffer; bounds the encoded datagram size.
    pub buffer_size: usize,
    /// Depth of the transceiver's outbound queue.
    pub outbound_queue: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            packet_pool_capacity: 1024,
            buffer_pool_capacity: 1024,
            buffer_size: 4096,
            outbound_queue: 1024,
        }
    }
}

impl ContextConfig {
    pub fn validate(&self) -> Result<()> {
        if self.packet_pool_capacity == 0 || self.buffer_pool_capacity == 0 {
            return Err(invalid("pool capacities must be > 0"));
        }
        if self.buffer_size <= MAX_HEADER_SIZE || self.buffer_size > MAX_DATAGRAM_SIZE {
            return Err(invalid(format!(
                "buffer_size must be in {}..={MAX_DATAGRAM_SIZE}",
                MAX_HEADER_SIZE + 1
            )));
        }
        if self.outbound_queue == 0 {
            return Err(invalid("outbound_queue must be > 0"));
        }
        Ok(())
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(ContextConfig::default());
        }
        let parsed: ContextConfigInput = toml::from_str(input)
            .map_err(|e| invalid(format!("invalid context TOML: {e}")))?;
        parsed.resolve()
    }
}

// ─── Combined file ──────────────────────────────────────────────────────────

/// A whole configuration document:
///
/// ```toml
/// [context]
/// packet_pool_capacity = 512
///
/// [session]
/// samples_per_packet = 50
/// n_source_packets = 10
/// n_repair_packets = 5
///
/// [session.flags]
/// enable_timer = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub context: ContextConfig,
    pub session: SessionConfig,
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(Config::default());
        }
        let parsed: ConfigInput =
            toml::from_str(input).map_err(|e| invalid(format!("invalid config TOML: {e}")))?;
        let context = parsed.context.resolve()?;
        let session = parsed.session.resolve()?;
        session.validate_for(&context)?;
        Ok(Config { context, session })
    }
}

// ─── TOML input layer ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigInput {
    context: ContextConfigInput,
    session: SessionConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SessionConfigInput {
    samples_per_packet: Option<usize>,
    channels: Option<usize>,
    sample_rate: Option<u32>,
    n_source_packets: Option<usize>,
    n_repair_packets: Option<usize>,
    latency: Option<usize>,
    timeout: Option<usize>,
    flags: Flags,
}

impl SessionConfigInput {
    fn resolve(self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();
        let config = SessionConfig {
            samples_per_packet: self
                .samples_per_packet
                .unwrap_or(defaults.samples_per_packet),
            channels: self.channels.unwrap_or(defaults.channels),
            sample_rate: self.sample_rate.unwrap_or(defaults.sample_rate),
            n_source_packets: self.n_source_packets.unwrap_or(defaults.n_source_packets),
            n_repair_packets: self.n_repair_packets.unwrap_or(defaults.n_repair_packets),
            latency: self.latency.unwrap_or(defaults.latency),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            flags: self.flags,
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ContextConfigInput {
    packet_pool_capacity: Option<usize>,
    buffer_pool_capacity: Option<usize>,
    buffer_size: Option<usize>,
    outbound_queue: Option<usize>,
}

impl ContextConfigInput {
    fn resolve(self) -> Result<ContextConfig> {
        let defaults = ContextConfig::default();
        let config = ContextConfig {
            packet_pool_capacity: self
                .packet_pool_capacity
                .unwrap_or(defaults.packet_pool_capacity),
            buffer_pool_capacity: self
                .buffer_pool_capacity
                .unwrap_or(defaults.buffer_pool_capacity),
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            outbound_queue: self.outbound_queue.unwrap_or(defaults.outbound_queue),
        };
        config.validate()?;
        Ok(config)
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::ConfigInvalid(msg.into())
}
