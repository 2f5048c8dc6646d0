//! The transaction-indexed segmented outbound queue.
//!
//! Construction follows the producer/consumer split used throughout this
//! crate: [`stacked_queue`] returns the shared [`StackedQueue`] half
//! (reserve/commit, callable from any thread) and the unique [`Drain`] half
//! (flushing, pairing, shutdown), which must live on the connection's I/O
//! task.
//!
//! ```text
//!  producers                       consumer (I/O task)
//! ┌──────────┐ reserve/commit     ┌───────────────────┐
//! │ thread A ├──────────┐         │       Drain       │
//! └──────────┘          ▼         │                   │
//! ┌──────────┐   ┌────────────┐   │ write_entries ──► transport
//! │ thread B ├──►│ [S0][S1].. │◄──┤ pair_reply   ◄── device replies
//! └──────────┘   └────────────┘   └───────────────────┘
//!                 StackedQueue
//! ```
//!
//! The fast paths are lock-free: reservation is a `fetch_add` checked
//! against the allocation high-water mark, and commit range-checks the
//! published first-segment pointer. The structural lock guards only segment
//! list surgery, is held briefly, and never spans a transport write.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bytes::BytesMut;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use super::{
    BarrierMode, POOL_LIMIT, SEGMENT_SIZE,
    segment::{Pairing, Segment},
};
use crate::{
    collections::Completion,
    proto::{ChannelCodec, ChannelError, RequestKind, TerminalCheck, Xid},
    sync::{EPOCH, Notifier, Waiter, event},
    transport::Transport,
};

struct QueueState<C: ChannelCodec> {
    /// Segments not yet fully drained to the transport, in xid order.
    unflushed: VecDeque<Arc<Segment<C>>>,
    /// Segments with at least one not-yet-completed entry, in xid order.
    /// This is the list response pairing walks.
    uncompleted: VecDeque<Arc<Segment<C>>>,
    /// Recycled, pre-reset segments awaiting reuse.
    pool: Vec<Arc<Segment<C>>>,
    /// Set once shutdown begins; reservation at or past it fails.
    shutdown_offset: Option<Xid>,
}

impl<C: ChannelCodec> QueueState<C> {
    /// Produces a segment covering `base`, preferring the pool.
    fn adopt(&mut self, base: Xid) -> Arc<Segment<C>> {
        match self.pool.pop() {
            Some(segment) => {
                segment.arm(base);
                segment
            }
            None => Arc::new(Segment::new(base)),
        }
    }
}

/// Shared producer half of the queue.
pub(crate) struct StackedQueue<C: ChannelCodec> {
    mode: BarrierMode,
    /// Next xid to hand out. Hot: every reservation bumps it.
    next_xid: CachePadded<AtomicU64>,
    /// First xid not yet backed by a segment. Reservation below it is
    /// lock-free; crossing it takes the structural lock.
    allocated: CachePadded<AtomicU64>,
    /// Raised when shutdown begins; commits are rejected up front.
    shutdown: AtomicBool,
    /// One past the highest committed barrier xid (0 = none). Answers "is a
    /// barrier currently pending" for the manager's timer.
    barrier_xid: AtomicU64,
    /// One past the highest completed barrier xid (0 = none).
    completed_barrier: AtomicU64,
    /// Fast-path pointer for commit, republished by the consumer as the
    /// flush cursor advances segments.
    first: ArcSwap<Segment<C>>,
    /// Flush gate: commits post coalesced wakeups for the I/O task.
    can_flush: Notifier,
    state: Mutex<QueueState<C>>,
}

/// Creates a queue and its unique consumer half.
///
/// `base_xid` seeds the xid counter; ids below it are never issued by this
/// queue, which keeps them disjoint from any ids the caller handed out
/// before registering it.
pub(crate) fn stacked_queue<C: ChannelCodec>(
    base_xid: Xid,
    mode: BarrierMode,
) -> (Arc<StackedQueue<C>>, Drain<C>, Waiter) {
    let (notifier, waiter) = event::new();
    let first = Arc::new(Segment::new(base_xid));

    let state = QueueState {
        unflushed: VecDeque::from([first.clone()]),
        uncompleted: VecDeque::from([first.clone()]),
        pool: Vec::new(),
        shutdown_offset: None,
    };
    let queue = Arc::new(StackedQueue {
        mode,
        next_xid: CachePadded::new(AtomicU64::new(base_xid)),
        allocated: CachePadded::new(AtomicU64::new(base_xid + SEGMENT_SIZE as u64)),
        shutdown: AtomicBool::new(false),
        barrier_xid: AtomicU64::new(0),
        completed_barrier: AtomicU64::new(0),
        first: ArcSwap::from(first.clone()),
        can_flush: notifier,
        state: Mutex::new(state),
    });
    let drain = Drain {
        queue: queue.clone(),
        segment: first,
        offset: 0,
    };
    (queue, drain, waiter)
}

impl<C: ChannelCodec> StackedQueue<C> {
    /// Reserves the next transaction id.
    ///
    /// Fast path: one `fetch_add` plus an acquire load. The slow path backs
    /// the id with segments under the structural lock, and returns `None`
    /// once shutdown has begun.
    pub(crate) fn reserve(&self) -> Option<Xid> {
        let xid = self.next_xid.fetch_add(1, Ordering::Relaxed);
        if xid < self.allocated.load(Ordering::Acquire) {
            return Some(xid);
        }
        self.reserve_slow(xid)
    }

    #[cold]
    fn reserve_slow(&self, xid: Xid) -> Option<Xid> {
        let mut state = self.state.lock();
        if state.shutdown_offset.is_some() {
            return None;
        }
        while xid >= self.allocated.load(Ordering::Acquire) {
            let base = self.allocated.load(Ordering::Acquire);
            let segment = state.adopt(base);
            state.unflushed.push_back(segment.clone());
            state.uncompleted.push_back(segment);
            self.allocated.store(base + SEGMENT_SIZE as u64, Ordering::Release);
        }
        Some(xid)
    }

    /// Commits a reserved transaction.
    ///
    /// The completion, if any, is consumed either way: on rejection it is
    /// failed synchronously before the error returns.
    pub(crate) fn commit(
        &self,
        xid: Xid,
        request: C::Request,
        kind: RequestKind,
        completion: Option<Completion<C::Response>>,
        terminal: TerminalCheck<C::Response>,
    ) -> Result<(), ChannelError> {
        if self.shutdown.load(Ordering::Acquire) {
            if let Some(completion) = completion {
                completion.fail(ChannelError::Shutdown);
            }
            return Err(ChannelError::Shutdown);
        }

        // Without barriers nothing will ever vouch for a fire-and-forget
        // request, so its completion resolves at commit time.
        let completion = match (self.mode, kind) {
            (BarrierMode::Disabled, RequestKind::Unacknowledged) => {
                if let Some(completion) = completion {
                    completion.succeed(Vec::new());
                }
                None
            }
            _ => completion,
        };

        // Fast path: the published first segment owns most commits.
        let segment = {
            let first = self.first.load_full();
            if first.contains(xid) {
                first
            } else {
                match self.locate(xid) {
                    Some(segment) => segment,
                    None => {
                        error!(xid, "commit for a transaction not backed by the queue");
                        if let Some(completion) = completion {
                            completion.fail(ChannelError::UnknownXid { xid });
                        }
                        return Err(ChannelError::UnknownXid { xid });
                    }
                }
            }
        };

        let offset = (xid - segment.base()) as usize;
        if !segment.entry(offset).commit(xid, request, kind, completion, terminal) {
            return Err(ChannelError::AlreadyCompleted { xid });
        }
        trace!(xid, ?kind, "committed");

        if self.mode == BarrierMode::Enabled && kind == RequestKind::Barrier {
            self.barrier_xid.fetch_max(xid + 1, Ordering::AcqRel);
        }

        // Wake the flusher. This also covers a commit racing shutdown: the
        // wakeup prompts one more shutdown sweep, which fails the entry.
        let _ = self.can_flush.notify();
        Ok(())
    }

    fn locate(&self, xid: Xid) -> Option<Arc<Segment<C>>> {
        let state = self.state.lock();
        state.unflushed.iter().find(|s| s.contains(xid)).cloned()
    }

    /// Whether a committed barrier has not yet completed.
    pub(crate) fn barrier_pending(&self) -> bool {
        self.barrier_xid.load(Ordering::Acquire) > self.completed_barrier.load(Ordering::Acquire)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Posts a flush wakeup without committing anything.
    pub(crate) fn notify_flush(&self) {
        let _ = self.can_flush.notify();
    }
}

/// Result of one flush iteration.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Flushed {
    /// Entries accounted for (written, self-completed, or already failed).
    pub(crate) entries: usize,
    /// Non-barrier messages written to the transport.
    pub(crate) non_barrier: usize,
    /// Barrier messages written to the transport.
    pub(crate) barriers: usize,
    /// The work budget expired with entries still ready; a follow-up flush
    /// has been scheduled.
    pub(crate) out_of_budget: bool,
}

/// Unique consumer half of the queue.
///
/// All flushing, pairing and shutdown runs through this handle; its
/// uniqueness (it is not `Clone`) is what upholds the entries'
/// single-consumer contract.
pub(crate) struct Drain<C: ChannelCodec> {
    queue: Arc<StackedQueue<C>>,
    /// Current flush segment; kept in lockstep with `queue.first`.
    segment: Arc<Segment<C>>,
    /// Flush offset of the next entry to inspect within `segment`.
    offset: usize,
}

impl<C: ChannelCodec> Drain<C> {
    /// Drains committed, contiguous entries onto the transport in xid order.
    ///
    /// Stops at the first not-yet-committed entry, when the transport stops
    /// accepting frames, or when the work budget expires (rescheduling
    /// itself through the flush gate). Encoding goes through the caller's
    /// scratch buffer; one entry's encode or write failure fails that entry
    /// alone.
    pub(crate) fn write_entries<T: Transport>(
        &mut self,
        transport: &mut T,
        codec: &C,
        scratch: &mut BytesMut,
        budget: Duration,
    ) -> Flushed {
        let deadline = EPOCH.elapsed() + budget;
        let mut flushed = Flushed::default();

        loop {
            // Check the budget every 64 entries; a flush that overstays its
            // welcome starves the read path of the event loop.
            if flushed.entries & 0x3F == 0x3F && EPOCH.elapsed() >= deadline {
                flushed.out_of_budget = true;
                self.queue.notify_flush();
                break;
            }
            if !transport.is_writable() {
                break;
            }
            if self.offset == SEGMENT_SIZE {
                if !self.advance_segment() {
                    break;
                }
            }

            let entry = self.segment.entry(self.offset);
            if !entry.is_published() {
                break;
            }

            let (request, kind) = self.segment.take_at(self.offset);
            if let Some(request) = request {
                scratch.clear();
                match codec.encode(&request, scratch) {
                    Ok(()) => match transport.write(scratch) {
                        Ok(()) => {
                            if kind == RequestKind::Barrier {
                                flushed.barriers += 1;
                            } else {
                                flushed.non_barrier += 1;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "transport write failed");
                            self.segment
                                .fail_at(self.offset, ChannelError::Transport(e.to_string()));
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to encode outbound message");
                        self.segment
                            .fail_at(self.offset, ChannelError::Encode(e.to_string()));
                    }
                }
            }
            // A missing request means the entry already self-completed or
            // failed before reaching the wire; it still advances the cursor.

            self.offset += 1;
            flushed.entries += 1;
        }

        flushed
    }

    /// Moves the flush cursor to the next segment, retiring the drained one.
    fn advance_segment(&mut self) -> bool {
        let queue = &self.queue;
        let mut state = queue.state.lock();

        // Ensure a following segment exists before the drained one leaves
        // the unflushed list; the fast-path pointer must always be valid.
        let end = self.segment.base() + SEGMENT_SIZE as u64;
        if queue.allocated.load(Ordering::Acquire) == end {
            let segment = state.adopt(end);
            state.unflushed.push_back(segment.clone());
            state.uncompleted.push_back(segment);
            queue.allocated.store(end + SEGMENT_SIZE as u64, Ordering::Release);
        }

        // Every entry of the drained segment has been written; without
        // barriers that is all the confirmation there will ever be.
        if queue.mode == BarrierMode::Disabled {
            self.segment.complete_all();
        }

        debug_assert!(
            state.unflushed.front().is_some_and(|s| Arc::ptr_eq(s, &self.segment)),
            "flush cursor diverged from the unflushed list"
        );
        state.unflushed.pop_front();
        self.segment.mark_flushed();

        if self.segment.is_complete() {
            if let Some(pos) = state
                .uncompleted
                .iter()
                .position(|s| Arc::ptr_eq(s, &self.segment))
            {
                state.uncompleted.remove(pos);
            }
            if state.pool.len() < POOL_LIMIT {
                self.segment.recycle();
                state.pool.push(self.segment.clone());
            }
        }

        let Some(next) = state.unflushed.front().cloned() else {
            return false;
        };
        queue.first.store(next.clone());
        self.segment = next;
        self.offset = 0;
        true
    }

    /// Pairs a device reply with its outstanding entry by xid.
    ///
    /// Returns the reply back when no outstanding entry matches, so the
    /// caller can offer it to the pre-registration cache instead.
    pub(crate) fn pair_reply(
        &mut self,
        xid: Xid,
        reply: C::Response,
        more_fragments: bool,
        error: Option<String>,
    ) -> Option<C::Response> {
        let segment = {
            let state = self.queue.state.lock();
            let mut found = None;
            for segment in state.uncompleted.iter() {
                if segment.contains(xid) {
                    found = Some(segment.clone());
                    break;
                }
                if segment.base() > xid {
                    // The list is xid-ordered; this reply predates anything
                    // still outstanding.
                    break;
                }
            }
            match found {
                Some(segment) => segment,
                None => return Some(reply),
            }
        };

        match segment.pair_reply(xid, reply, more_fragments, error) {
            Pairing::Unmatched(reply) => Some(reply),
            Pairing::Stale => None,
            Pairing::Completed { terminal, barrier } => {
                if barrier {
                    self.queue
                        .completed_barrier
                        .fetch_max(xid + 1, Ordering::AcqRel);
                }
                if terminal && segment.is_complete() && segment.is_flushed() {
                    self.retire(&segment);
                }
                None
            }
        }
    }

    fn retire(&mut self, segment: &Arc<Segment<C>>) {
        let mut state = self.queue.state.lock();
        if let Some(pos) = state.uncompleted.iter().position(|s| Arc::ptr_eq(s, segment)) {
            state.uncompleted.remove(pos);
        }
        if state.pool.len() < POOL_LIMIT {
            segment.recycle();
            state.pool.push(segment.clone());
        }
    }

    /// Begins shutdown: blocks further reservation and fails every
    /// committed-but-incomplete entry with a disconnect cause.
    ///
    /// Returns the number of entries failed.
    pub(crate) fn start_shutdown(&mut self) -> usize {
        self.queue.shutdown.store(true, Ordering::Release);
        let mut state = self.queue.state.lock();

        // Burn a full segment's worth of xids beyond the allocation
        // high-water mark; every fast-path reservation after this lands in
        // unbacked territory and falls through to the (refusing) slow path.
        let offset = self.queue.allocated.load(Ordering::Acquire) + SEGMENT_SIZE as u64;
        self.queue.next_xid.fetch_max(offset, Ordering::AcqRel);
        state.shutdown_offset = Some(offset);

        let failed = Self::fail_outstanding(&state);
        debug!(failed, "queue shutdown started");
        failed
    }

    /// One shutdown sweep for entries that slipped in during the drain
    /// window. Returns `true` once a sweep finds nothing left to fail, or
    /// when the transport can no longer make progress anyway.
    pub(crate) fn finish_shutdown<T: Transport>(&mut self, transport: &T) -> bool {
        let state = self.queue.state.lock();
        let slipped = Self::fail_outstanding(&state);
        if slipped > 0 {
            warn!(slipped, "failed entries committed during the shutdown window");
            if transport.is_writable() {
                return false;
            }
        }
        true
    }

    fn fail_outstanding(state: &QueueState<C>) -> usize {
        let mut failed = 0;
        for segment in state.uncompleted.iter() {
            failed += segment.fail_all(&ChannelError::Disconnected);
        }
        failed
    }

    #[cfg(test)]
    pub(crate) fn pool_len(&self) -> usize {
        self.queue.state.lock().pool.len()
    }
}
