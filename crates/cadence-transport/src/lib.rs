//! # cadence-transport
//!
//! Real-time audio streaming over UDP.
//!
//! A sender cuts interleaved `f32` samples into numbered packets, protects
//! them with block Reed-Solomon FEC and sends source and repair packets to
//! separate addresses. A receiver rebuilds each block, smooths arrival
//! jitter with a latency cushion, and hands back a gapless sample stream in
//! which unrecoverable losses become silence.
//!
//! ## Crate structure
//!
//! - [`session`]: `Context` (pools, codec, transceiver) and endpoint lifecycle
//! - [`config`]: Session and context configuration, TOML loading
//! - [`pool`]: Fixed-capacity buffer and packet pools
//! - [`packet`]: Packets, roles, sample payload conversion
//! - [`wire`]: Datagram header serialization, VarInt
//! - [`codec`]: Erasure codec trait, Reed-Solomon, block encoder/resolver
//! - [`interleaver`]: Per-block send-order permutation
//! - [`sender`]: Sender pipeline
//! - [`jitter`]: Jitter buffer and stream state machine
//! - [`receiver`]: Receiver pipeline
//! - [`transceiver`]: UDP I/O thread and address-routed packet sinks
//! - [`proxy`]: Loss-simulating forwarding sink
//! - [`stats`]: Serializable counters

pub mod address;
pub mod codec;
pub mod config;
pub mod error;
pub mod interleaver;
pub mod jitter;
pub mod packet;
pub mod pool;
pub mod proxy;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod stats;
pub mod transceiver;
pub mod wire;

pub use address::Address;
pub use config::{Config, ContextConfig, Flags, SessionConfig};
pub use error::{Error, Result};
pub use jitter::StreamState;
pub use packet::Role;
pub use proxy::{LossModel, LossyProxy};
pub use receiver::Receiver;
pub use sender::Sender;
pub use session::{Context, LifecycleState};
