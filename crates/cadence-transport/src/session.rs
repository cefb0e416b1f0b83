//! # Session Context
//!
//! A [`Context`] bundles the resources shared by the senders and receivers of
//! one process or test: the buffer and packet pools, the erasure codec, and
//! the transceiver with its I/O thread. It is constructed explicitly and
//! passed down; its lifetime brackets every session created from it.
//!
//! Endpoint lifecycle:
//!
//! ```text
//!   Created ──bind/connect──▶ Created ──start──▶ Started ──stop──▶ Stopped
//! ```

use std::sync::Arc;

use tracing::info;

use crate::codec::{ErasureCodec, ReedSolomonCodec};
use crate::config::ContextConfig;
use crate::error::Result;
use crate::pool::{BufferPool, PacketPool};
use crate::transceiver::Transceiver;

/// Lifecycle of a sender, receiver or transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed; addresses may still be bound or connected.
    Created,
    /// Streaming.
    Started,
    /// Terminal.
    Stopped,
}

/// Shared pools, codec and transceiver.
pub struct Context {
    config: ContextConfig,
    packets: PacketPool,
    codec: Arc<dyn ErasureCodec>,
    transceiver: Arc<Transceiver>,
}

impl Context {
    /// Allocate the pools and start the transceiver's I/O thread.
    pub fn new(config: ContextConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(ReedSolomonCodec))
    }

    pub fn with_codec(config: ContextConfig, codec: Arc<dyn ErasureCodec>) -> Result<Self> {
        config.validate()?;
        let buffers = BufferPool::new(config.buffer_pool_capacity, config.buffer_size);
        let packets = PacketPool::new(config.packet_pool_capacity, buffers);
        let transceiver = Arc::new(Transceiver::new(
            packets.clone(),
            config.buffer_size,
            config.outbound_queue,
        ));
        transceiver.start()?;
        info!(
            packets = config.packet_pool_capacity,
            buffers = config.buffer_pool_capacity,
            buffer_size = config.buffer_size,
            "context ready"
        );
        Ok(Context {
            config,
            packets,
            codec,
            transceiver,
        })
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn packet_pool(&self) -> &PacketPool {
        &self.packets
    }

    pub fn codec(&self) -> &Arc<dyn ErasureCodec> {
        &self.codec
    }

    pub fn transceiver(&self) -> &Arc<Transceiver> {
        &self.transceiver
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.transceiver.stop();
        self.transceiver.join();
    }
}
