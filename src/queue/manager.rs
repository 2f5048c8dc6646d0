//! Per-connection owner of the stacked queue's consumer half.
//!
//! The manager runs inside the connection's I/O task. It coalesces flush
//! work (the flush gate admits at most one pending wakeup), applies the
//! barrier-insertion policy, and drives the shutdown sequence when the
//! connection dies.
//!
//! Barrier policy: every non-barrier message written counts toward a
//! threshold; reaching it synthesizes and commits a barrier immediately.
//! Independently, a timer synthesizes one if requests were written but no
//! barrier has been due within the configured interval, bounding how stale
//! unacknowledged state can get.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    BarrierMode, QueueConfig,
    entry::reply_is_terminal,
    stacked::{Drain, StackedQueue},
};
use crate::{
    proto::{ChannelCodec, RequestKind, Xid},
    transport::Transport,
};

pub(crate) struct QueueManager<C: ChannelCodec> {
    queue: Arc<StackedQueue<C>>,
    drain: Drain<C>,
    config: QueueConfig,
    /// Encode scratch, owned by this consumer and passed down explicitly.
    scratch: BytesMut,
    /// Non-barrier messages written since the last barrier.
    non_barrier: usize,
    /// When the interval-based barrier is next due.
    barrier_deadline: Instant,
}

impl<C: ChannelCodec> QueueManager<C> {
    pub(crate) fn new(queue: Arc<StackedQueue<C>>, drain: Drain<C>, config: QueueConfig) -> Self {
        let barrier_deadline = Instant::now() + config.barrier_interval;
        Self {
            queue,
            drain,
            config,
            scratch: BytesMut::new(),
            non_barrier: 0,
            barrier_deadline,
        }
    }

    pub(crate) fn barriers_enabled(&self) -> bool {
        self.config.barrier_mode == BarrierMode::Enabled
    }

    pub(crate) fn barrier_deadline(&self) -> Instant {
        self.barrier_deadline
    }

    /// Flushes ready entries and applies the count-based barrier policy.
    ///
    /// Returns the number of entries accounted for; a non-zero return is the
    /// caller's cue to drain the transport.
    pub(crate) fn flush<T: Transport>(&mut self, transport: &mut T, codec: &C) -> usize {
        let flushed = self
            .drain
            .write_entries(transport, codec, &mut self.scratch, self.config.flush_budget);

        self.non_barrier += flushed.non_barrier;
        if flushed.barriers > 0 {
            self.non_barrier = 0;
            self.rearm_barrier_timer();
        }
        if self.barriers_enabled() && self.non_barrier >= self.config.barrier_max_messages {
            self.inject_barrier(codec);
        }
        flushed.entries
    }

    /// Interval-based barrier policy: called when the barrier timer fires.
    pub(crate) fn on_barrier_timer(&mut self, codec: &C) {
        if self.barriers_enabled() && self.non_barrier > 0 && !self.queue.barrier_pending() {
            self.inject_barrier(codec);
        } else {
            self.rearm_barrier_timer();
        }
    }

    fn inject_barrier(&mut self, codec: &C) {
        // Reservation fails only once shutdown began; the queue is being
        // unwound then and needs no more synchronization.
        let Some(xid) = self.queue.reserve() else {
            return;
        };
        let request = codec.barrier_request(xid);
        match self
            .queue
            .commit(xid, request, RequestKind::Barrier, None, reply_is_terminal)
        {
            Ok(()) => {
                debug!(xid, "synthesized barrier");
                self.non_barrier = 0;
                self.rearm_barrier_timer();
            }
            Err(e) => warn!(error = %e, xid, "failed to commit synthesized barrier"),
        }
    }

    fn rearm_barrier_timer(&mut self) {
        self.barrier_deadline = Instant::now() + self.config.barrier_interval;
    }

    /// Offers a device reply for pairing; hands it back when unmatched.
    pub(crate) fn pair_reply(
        &mut self,
        xid: Xid,
        reply: C::Response,
        more_fragments: bool,
        error: Option<String>,
    ) -> Option<C::Response> {
        self.drain.pair_reply(xid, reply, more_fragments, error)
    }

    /// Begins the disconnect unwinding; see [`Drain::start_shutdown`].
    pub(crate) fn start_shutdown(&mut self) -> usize {
        self.drain.start_shutdown()
    }

    /// One shutdown sweep; see [`Drain::finish_shutdown`].
    pub(crate) fn finish_shutdown<T: Transport>(&mut self, transport: &T) -> bool {
        self.drain.finish_shutdown(transport)
    }
}
