//! # Errors
//!
//! Every failure on the streaming path is an explicit value handed back to the
//! immediate caller. Nothing here is allowed to abort the process.

use thiserror::Error;

use crate::session::LifecycleState;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad address, zero-sized geometry, or a payload that cannot fit a
    /// pooled buffer. Only raised at construction or bind time.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// A fixed-capacity pool or queue is full. Callers treat this as
    /// backpressure and retry or shed load.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Fewer than `n_source` packets of a block are available.
    #[error("unrecoverable block: {0}")]
    Unrecoverable(String),

    /// Operation after `stop()`.
    #[error("closed")]
    Closed,

    /// No data arrived within the configured timeout.
    #[error("stream stalled")]
    Stalled,

    /// Lifecycle call made in the wrong order (e.g. `start` before `connect`).
    #[error("`{op}` not allowed in state {state:?}")]
    InvalidState {
        op: &'static str,
        state: LifecycleState,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ResourceExhausted(_) | Error::Stalled)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backpressure_is_transient() {
        assert!(Error::ResourceExhausted("packet pool").is_transient());
        assert!(Error::Stalled.is_transient());
        assert!(!Error::Closed.is_transient());
        assert!(!Error::ConfigInvalid("x".into()).is_transient());
    }

    #[test]
    fn messages_name_the_cause() {
        let err = Error::InvalidState {
            op: "write",
            state: LifecycleState::Stopped,
        };
        assert_eq!(err.to_string(), "`write` not allowed in state Stopped");
        assert_eq!(
            Error::ResourceExhausted("buffer pool").to_string(),
            "resource exhausted: buffer pool"
        );
    }
}
