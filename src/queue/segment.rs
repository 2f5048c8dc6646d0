//! Fixed-size allocation unit of the transaction-indexed queue.
//!
//! A segment owns [`SEGMENT_SIZE`] entries covering a contiguous xid range
//! starting at `base_xid`. Segments carry no cross-segment links; the queue
//! chains them through its ordered lists. A segment is recycled through the
//! queue's pool only once every entry has completed and the flush cursor has
//! moved past it, with all entries reset before reuse.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::trace;

use super::{SEGMENT_SIZE, entry::{CompleteOutcome, Entry}};
use crate::proto::{ChannelCodec, ChannelError, RequestKind, Xid};

/// Outcome of offering a reply to a segment.
#[derive(Debug)]
pub(crate) enum Pairing<R> {
    /// No committed entry owns the xid; the reply is handed back so the
    /// caller can route it elsewhere.
    Unmatched(R),
    /// The owning entry had already completed; the reply is dropped.
    Stale,
    /// The reply was applied.
    Completed {
        /// Whether the entry reached its terminal outcome.
        terminal: bool,
        /// Whether the completed entry was a barrier (cascade has run).
        barrier: bool,
    },
}

pub(crate) struct Segment<C: ChannelCodec> {
    /// First xid owned by this segment. Atomic because stale fast-path
    /// readers may still range-check a segment that has been re-armed.
    base_xid: AtomicU64,
    /// Entries that reached their terminal outcome.
    complete_count: AtomicUsize,
    /// Offset one past the last completed barrier; the cascade floor.
    /// Everything below it is complete.
    last_barrier: AtomicUsize,
    /// Whether the flush cursor has moved past this segment.
    flushed: AtomicBool,
    entries: Box<[Entry<C>]>,
}

impl<C: ChannelCodec> Segment<C> {
    pub(crate) fn new(base_xid: Xid) -> Self {
        let entries = (0..SEGMENT_SIZE).map(|_| Entry::new()).collect::<Vec<_>>();
        Self {
            base_xid: AtomicU64::new(base_xid),
            complete_count: AtomicUsize::new(0),
            last_barrier: AtomicUsize::new(0),
            flushed: AtomicBool::new(false),
            entries: entries.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn base(&self) -> Xid {
        self.base_xid.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn contains(&self, xid: Xid) -> bool {
        xid.wrapping_sub(self.base()) < SEGMENT_SIZE as u64
    }

    #[inline]
    fn offset_of(&self, xid: Xid) -> usize {
        debug_assert!(self.contains(xid));
        (xid - self.base()) as usize
    }

    #[inline]
    pub(crate) fn entry(&self, offset: usize) -> &Entry<C> {
        &self.entries[offset]
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete_count.load(Ordering::Relaxed) == SEGMENT_SIZE
    }

    pub(crate) fn completed(&self) -> usize {
        self.complete_count.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_flushed(&self) {
        self.flushed.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::Relaxed)
    }

    /// Consumer side: takes the entry's request for transmission, accounting
    /// for entries that self-complete on take.
    pub(crate) fn take_at(&self, offset: usize) -> (Option<C::Request>, RequestKind) {
        let (request, kind, self_completed) = self.entries[offset].take_request();
        if self_completed {
            self.complete_count.fetch_add(1, Ordering::Relaxed);
        }
        (request, kind)
    }

    /// Consumer side: fails one entry, accounting for the completion.
    pub(crate) fn fail_at(&self, offset: usize, cause: ChannelError) -> bool {
        let failed = self.entries[offset].fail(cause);
        if failed {
            self.complete_count.fetch_add(1, Ordering::Relaxed);
        }
        failed
    }

    /// Consumer side: offers a reply to the entry owning `xid`.
    ///
    /// Completing a barrier cascades: every committed, not-yet-completed
    /// entry between the previous barrier and this one is force-completed
    /// with an implied success, and the cascade floor advances past the
    /// barrier.
    pub(crate) fn pair_reply(
        &self,
        xid: Xid,
        reply: C::Response,
        more_fragments: bool,
        error: Option<String>,
    ) -> Pairing<C::Response> {
        let offset = self.offset_of(xid);
        let entry = &self.entries[offset];

        if !entry.is_published() {
            return Pairing::Unmatched(reply);
        }
        if entry.is_completed() {
            trace!(xid, "reply for an already-completed transaction");
            return Pairing::Stale;
        }

        // A device-reported error fails the entry instead of completing it.
        // A failed barrier vouches for nothing, so no cascade runs; it still
        // counts as the barrier's terminal outcome.
        let barrier = entry.is_barrier();
        if let Some(detail) = error {
            if self.entries[offset].fail(ChannelError::Device(detail)) {
                self.complete_count.fetch_add(1, Ordering::Relaxed);
            }
            return Pairing::Completed {
                terminal: true,
                barrier,
            };
        }
        match entry.complete(Some(reply), more_fragments) {
            CompleteOutcome::Terminal => {
                self.complete_count.fetch_add(1, Ordering::Relaxed);
                if barrier {
                    self.cascade(offset);
                }
                Pairing::Completed { terminal: true, barrier }
            }
            CompleteOutcome::Pending => Pairing::Completed {
                terminal: false,
                barrier: false,
            },
            // Unreachable on the single consumer thread given the checks
            // above, but a reply must never complete an entry twice.
            CompleteOutcome::NotCommitted | CompleteOutcome::Stale => Pairing::Stale,
        }
    }

    /// Force-completes every committed entry strictly before the barrier at
    /// `barrier_offset`, then advances the cascade floor past it.
    fn cascade(&self, barrier_offset: usize) {
        let floor = self.last_barrier.load(Ordering::Relaxed);
        let mut implied = 0usize;
        for offset in floor..barrier_offset {
            let entry = &self.entries[offset];
            if entry.is_published() && entry.complete(None, false) == CompleteOutcome::Terminal {
                implied += 1;
            }
        }
        if implied > 0 {
            self.complete_count.fetch_add(implied, Ordering::Relaxed);
        }
        self.last_barrier.store(barrier_offset + 1, Ordering::Relaxed);
        trace!(
            base = self.base(),
            barrier_offset,
            implied,
            "barrier cascade"
        );
    }

    /// Consumer side: force-completes every committed entry in the remaining
    /// range after the last barrier. Used when a drained segment's pending
    /// entries are vouched for wholesale (no-barrier variant).
    pub(crate) fn complete_all(&self) -> usize {
        let floor = self.last_barrier.load(Ordering::Relaxed);
        let mut implied = 0usize;
        for entry in &self.entries[floor..] {
            if entry.is_published() && entry.complete(None, false) == CompleteOutcome::Terminal {
                implied += 1;
            }
        }
        if implied > 0 {
            self.complete_count.fetch_add(implied, Ordering::Relaxed);
        }
        self.last_barrier.store(SEGMENT_SIZE, Ordering::Relaxed);
        implied
    }

    /// Consumer side: fails every committed, not-yet-completed entry in the
    /// remaining range after the last barrier. Used on disconnect.
    pub(crate) fn fail_all(&self, cause: &ChannelError) -> usize {
        let floor = self.last_barrier.load(Ordering::Relaxed);
        let mut failed = 0usize;
        for entry in &self.entries[floor..] {
            if entry.fail(cause.clone()) {
                failed += 1;
            }
        }
        if failed > 0 {
            self.complete_count.fetch_add(failed, Ordering::Relaxed);
        }
        failed
    }

    /// Consumer side: winds every entry back to empty so the segment can sit
    /// pre-reset in the pool.
    pub(crate) fn recycle(&self) {
        for entry in &self.entries {
            entry.reset();
        }
        self.complete_count.store(0, Ordering::Relaxed);
        self.last_barrier.store(0, Ordering::Relaxed);
        self.flushed.store(false, Ordering::Relaxed);
    }

    /// Re-targets a pooled segment at a fresh xid range.
    pub(crate) fn arm(&self, base_xid: Xid) {
        debug_assert_eq!(self.completed(), 0, "armed a segment that was not recycled");
        self.base_xid.store(base_xid, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        collections::Completion,
        proto::testing::{TestCodec, TestReply, TestRequest},
        queue::entry::reply_is_terminal,
    };

    fn segment(base: Xid) -> Segment<TestCodec> {
        Segment::new(base)
    }

    fn commit_single(seg: &Segment<TestCodec>, xid: Xid) -> crate::collections::promise::PendingReply<TestReply> {
        let (completion, pending) = Completion::new();
        assert!(seg.entry(seg.offset_of(xid)).commit(
            xid,
            TestRequest::single(xid),
            crate::proto::RequestKind::Single,
            Some(completion),
            reply_is_terminal,
        ));
        pending
    }

    fn commit_barrier(seg: &Segment<TestCodec>, xid: Xid) {
        assert!(seg.entry(seg.offset_of(xid)).commit(
            xid,
            TestRequest::barrier(xid),
            crate::proto::RequestKind::Barrier,
            None,
            reply_is_terminal,
        ));
    }

    #[test]
    fn test_contains_range() {
        let seg = segment(4096);
        assert!(!seg.contains(4095));
        assert!(seg.contains(4096));
        assert!(seg.contains(4096 + SEGMENT_SIZE as u64 - 1));
        assert!(!seg.contains(4096 + SEGMENT_SIZE as u64));
    }

    #[test]
    fn test_pair_reply_completes_entry() {
        let seg = segment(0);
        let mut pending = commit_single(&seg, 3);

        let pairing = seg.pair_reply(3, TestReply::ok(3), false, None);
        assert!(matches!(pairing, Pairing::Completed { terminal: true, barrier: false }));
        assert_eq!(seg.completed(), 1);
        assert_eq!(pending.try_take(), Some(Ok(vec![TestReply::ok(3)])));

        // A second reply for the same xid is stale
        assert!(matches!(seg.pair_reply(3, TestReply::ok(3), false, None), Pairing::Stale));
    }

    #[test]
    fn test_pair_reply_unmatched_for_empty_entry() {
        let seg = segment(0);
        let pairing = seg.pair_reply(5, TestReply::ok(5), false, None);
        assert!(matches!(pairing, Pairing::Unmatched(reply) if reply.xid == 5));
        assert_eq!(seg.completed(), 0);
    }

    #[test]
    fn test_error_reply_fails_entry() {
        let seg = segment(0);
        let mut pending = commit_single(&seg, 1);

        let pairing = seg.pair_reply(1, TestReply::err(1, "bad match"), false, Some("bad match".into()));
        assert!(matches!(pairing, Pairing::Completed { terminal: true, barrier: false }));
        assert_eq!(
            pending.try_take(),
            Some(Err(ChannelError::Device("bad match".into())))
        );
    }

    #[test]
    fn test_barrier_cascade() {
        // Scenario A: commit 0..=9 as plain requests, replies arrive for all
        // but xid 5, then a barrier at 10 completes - everything must be
        // complete afterwards.
        let seg = segment(0);
        let mut pendings = (0..10).map(|xid| commit_single(&seg, xid)).collect::<Vec<_>>();
        commit_barrier(&seg, 10);

        for xid in (0..10).filter(|xid| *xid != 5) {
            seg.pair_reply(xid, TestReply::ok(xid), false, None);
        }
        assert_eq!(seg.completed(), 9);

        let pairing = seg.pair_reply(10, TestReply::ok(10), false, None);
        assert!(matches!(pairing, Pairing::Completed { terminal: true, barrier: true }));
        assert_eq!(seg.completed(), 11);

        // xid 5 resolved with an implied (empty) success
        assert_eq!(pendings[5].try_take(), Some(Ok(vec![])));
        for (xid, pending) in pendings.iter_mut().enumerate() {
            if xid != 5 {
                assert!(matches!(pending.try_take(), Some(Ok(_))), "xid {xid}");
            }
        }
    }

    #[test]
    fn test_cascade_floor_advances() {
        let seg = segment(0);
        for xid in 0..3 {
            commit_single(&seg, xid);
        }
        commit_barrier(&seg, 3);
        seg.pair_reply(3, TestReply::ok(3), false, None);
        assert_eq!(seg.completed(), 4);

        // Entries beyond the completed barrier are untouched by a second
        // barrier's cascade only up to its own offset
        let mut pending = commit_single(&seg, 4);
        commit_barrier(&seg, 5);
        seg.pair_reply(5, TestReply::ok(5), false, None);
        assert_eq!(seg.completed(), 6);
        assert_eq!(pending.try_take(), Some(Ok(vec![])));
    }

    #[test]
    fn test_complete_all_vouches_for_the_rest() {
        let seg = segment(0);
        let mut pendings = (0..4).map(|xid| commit_single(&seg, xid)).collect::<Vec<_>>();

        assert_eq!(seg.complete_all(), 4);
        for pending in pendings.iter_mut() {
            assert_eq!(pending.try_take(), Some(Ok(vec![])));
        }
        // Idempotent
        assert_eq!(seg.complete_all(), 0);
    }

    #[test]
    fn test_fail_all_is_exhaustive() {
        let seg = segment(0);
        let mut pendings = (0..8).map(|xid| commit_single(&seg, xid)).collect::<Vec<_>>();
        // One entry already completed; it must not be failed again
        seg.pair_reply(2, TestReply::ok(2), false, None);

        assert_eq!(seg.fail_all(&ChannelError::Disconnected), 7);
        for (xid, pending) in pendings.iter_mut().enumerate() {
            let outcome = pending.try_take().unwrap();
            if xid == 2 {
                assert!(outcome.is_ok());
            } else {
                assert_eq!(outcome, Err(ChannelError::Disconnected));
            }
        }
    }

    #[test]
    fn test_recycle_then_arm_yields_empty_entries() {
        let seg = segment(0);
        for xid in 0..SEGMENT_SIZE as u64 {
            seg.entry(xid as usize).commit(
                xid,
                TestRequest::unacked(xid),
                crate::proto::RequestKind::Unacknowledged,
                None,
                reply_is_terminal,
            );
            seg.take_at(xid as usize);
        }
        assert!(seg.is_complete());

        seg.recycle();
        seg.arm(SEGMENT_SIZE as u64);
        assert_eq!(seg.base(), SEGMENT_SIZE as u64);
        assert_eq!(seg.completed(), 0);
        for offset in 0..SEGMENT_SIZE {
            assert!(!seg.entry(offset).is_published());
        }
    }

    #[test]
    fn test_take_accounts_self_completion() {
        let seg = segment(0);
        seg.entry(0).commit(
            0,
            TestRequest::unacked(0),
            crate::proto::RequestKind::Unacknowledged,
            None,
            reply_is_terminal,
        );
        let (request, kind) = seg.take_at(0);
        assert!(request.is_some());
        assert_eq!(kind, crate::proto::RequestKind::Unacknowledged);
        assert_eq!(seg.completed(), 1);
    }
}
