//! Cooperative-shutdown and backpressure primitives shared by every
//! long-running worker process in the fleet.
//!
//! Each blocking helper takes an explicit `CancellationToken` and re-checks
//! it at bounded intervals, so shutdown latency is bounded by one poll tick
//! no matter how long the caller's requested timeout is.

pub mod queue;
pub mod recv;

pub use queue::{dequeue, enqueue, wait_for_queue};
pub use recv::receive_with_timeout;

/// Why a blocking helper returned without delivering a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WaitError {
    /// The shared cancellation signal fired. Always propagates to the
    /// top-level worker loop, which performs cleanup and exits.
    #[error("cancelled by shutdown signal")]
    Cancelled,

    /// The caller's timeout window elapsed with nothing received. Distinct
    /// from cancellation; the caller decides whether to retry.
    #[error("timed out waiting for a message")]
    Timeout,

    /// The peer hung up; no further messages will arrive.
    #[error("channel closed by the peer")]
    ChannelClosed,

    /// The payload arrived but could not be decoded.
    #[error("failed to decode message payload: {0}")]
    Decode(String),
}
