//! # Jitter Buffer
//!
//! Gapless, ordered queue of interleaved samples between block resolution and
//! the application's `read`, plus the playback state machine:
//!
//! ```text
//!   Filling ──latency reached──▶ Streaming ──underrun──▶ Stalled
//!      │                            ▲                       │
//!      │                            └───latency reached─────┘
//!      └──────────────── stop (any state) ──────────────────▶ Closed
//! ```
//!
//! `Filling` and `Stalled` hold output back until `latency` samples are
//! queued, so arrival jitter is absorbed before playback (re)starts. In
//! `Streaming` a read needs only one frame.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    /// Building the initial latency cushion.
    Filling,
    /// Steady playback.
    Streaming,
    /// Ran dry mid-stream; emitting silence until the cushion is rebuilt.
    Stalled,
    Closed,
}

/// Result of a read that produced output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    /// Samples taken from the queue; the rest of the frame is silence.
    pub from_queue: usize,
    /// The frame had to be padded mid-stream.
    pub underrun: bool,
}

pub struct JitterBuffer {
    queue: VecDeque<f32>,
    capacity: usize,
    latency: usize,
    state: StreamState,
    overflow: u64,
}

impl JitterBuffer {
    /// `latency` and `capacity` are in interleaved samples.
    pub fn new(latency: usize, capacity: usize) -> Self {
        let capacity = capacity.max(latency).max(1);
        JitterBuffer {
            queue: VecDeque::with_capacity(latency.max(1)),
            capacity,
            latency,
            state: StreamState::Filling,
            overflow: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Samples dropped so far because the queue was full.
    pub fn overflow(&self) -> u64 {
        self.overflow
    }

    /// Append decoded samples. Returns how many old samples were dropped to
    /// make room.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let dropped = self.make_room(samples.len());
        let skip = samples.len().saturating_sub(self.capacity);
        self.queue.extend(&samples[skip..]);
        self.overflow += skip as u64;
        dropped + skip
    }

    /// Append `count` samples of silence in place of a lost range.
    pub fn push_silence(&mut self, count: usize) -> usize {
        let dropped = self.make_room(count);
        let kept = count.min(self.capacity);
        self.queue.extend(std::iter::repeat(0.0).take(kept));
        self.overflow += (count - kept) as u64;
        dropped + (count - kept)
    }

    /// Samples that must be queued before a read of `frame` samples can be
    /// served without waiting.
    pub fn target(&self, frame: usize) -> usize {
        match self.state {
            StreamState::Filling | StreamState::Stalled => self.latency.max(frame),
            StreamState::Streaming | StreamState::Closed => frame,
        }
    }

    pub fn is_ready(&self, frame: usize) -> bool {
        self.queue.len() >= self.target(frame)
    }

    /// Fill `out` if the queue allows it. With `timed_out` set the caller has
    /// waited a full timeout, and the frame is completed with silence instead.
    ///
    /// Returns `None` when the caller should keep waiting.
    pub fn read(&mut self, out: &mut [f32], timed_out: bool) -> Option<Delivery> {
        if self.state == StreamState::Closed {
            return None;
        }
        let frame = out.len();
        if self.is_ready(frame) || (timed_out && self.queue.len() >= frame) {
            self.drain_into(out);
            if self.state != StreamState::Streaming {
                info!(from = ?self.state, queued = self.queue.len(), "stream playing");
                self.state = StreamState::Streaming;
            }
            return Some(Delivery {
                from_queue: frame,
                underrun: false,
            });
        }
        if !timed_out {
            return None;
        }
        if self.state == StreamState::Filling && self.queue.is_empty() {
            // Pre-roll: nothing has arrived yet.
            out.fill(0.0);
            return Some(Delivery {
                from_queue: 0,
                underrun: false,
            });
        }

        let available = self.queue.len().min(frame);
        self.drain_into(&mut out[..available]);
        out[available..].fill(0.0);
        if self.state != StreamState::Stalled {
            debug!(from = ?self.state, available, frame, "stream stalled");
            self.state = StreamState::Stalled;
        }
        Some(Delivery {
            from_queue: available,
            underrun: true,
        })
    }

    pub fn close(&mut self) {
        self.state = StreamState::Closed;
        self.queue.clear();
    }

    fn drain_into(&mut self, out: &mut [f32]) {
        let n = out.len();
        for (slot, sample) in out.iter_mut().zip(self.queue.drain(..n)) {
            *slot = sample;
        }
    }

    fn make_room(&mut self, incoming: usize) -> usize {
        let needed = (self.queue.len() + incoming.min(self.capacity)).saturating_sub(self.capacity);
        if needed > 0 {
            self.queue.drain(..needed);
            self.overflow += needed as u64;
        }
        needed
    }
}
