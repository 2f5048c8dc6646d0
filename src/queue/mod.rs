//! The transaction-indexed outbound queue.
//!
//! Requests flow through a chain of fixed-size [`Segment`]s indexed by
//! transaction id: producers reserve an id and commit an [`Entry`]
//! concurrently, the connection's I/O task drains committed entries to the
//! transport in strict id order and pairs device replies back to them.
//!
//! [`Entry`]: entry::Entry
//! [`Segment`]: segment::Segment

use std::time::Duration;

pub(crate) mod entry;
pub(crate) mod manager;
pub(crate) mod segment;
pub(crate) mod stacked;

/// Entries per segment. Power of two so offset math stays a mask away.
pub(crate) const SEGMENT_SIZE: usize = 4096;
const _: () = assert!(SEGMENT_SIZE.is_power_of_two());

/// Segments kept around for reuse once fully drained and completed.
pub(crate) const POOL_LIMIT: usize = 4;

/// Whether the queue inserts barrier synchronization points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BarrierMode {
    /// Barriers are committed by the manager's policy and their replies
    /// cascade completion to every preceding request.
    #[default]
    Enabled,
    /// No barriers: fire-and-forget completions resolve at commit time and a
    /// fully drained segment force-completes its remaining entries. Trades
    /// per-request confirmation for throughput.
    Disabled,
}

/// Tuning for a registered queue manager.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Barrier variant selection.
    pub barrier_mode: BarrierMode,
    /// Non-barrier messages written before a barrier is forced.
    pub barrier_max_messages: usize,
    /// Longest the channel may go without a barrier while requests are
    /// outstanding.
    pub barrier_interval: Duration,
    /// Work budget for a single flush iteration; longer flushes reschedule
    /// themselves so the I/O task can interleave reads.
    pub flush_budget: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            barrier_mode: BarrierMode::Enabled,
            barrier_max_messages: 256,
            barrier_interval: Duration::from_millis(500),
            flush_budget: Duration::from_micros(100),
        }
    }
}
