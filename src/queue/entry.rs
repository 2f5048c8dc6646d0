//! A single request slot in the transaction-indexed queue.
//!
//! The entry is the unit of the producer/consumer handoff, and its `state`
//! field carries the memory-visibility contract of the whole queue: a
//! committing producer writes every slot field first and publishes with a
//! release store of `COMMITTED` as its *last* write; the consumer half loads
//! the state with acquire ordering before touching the slot. A consumer that
//! never observes `COMMITTED` never observes a half-written slot.

use std::{
    cell::UnsafeCell,
    mem,
    sync::atomic::{AtomicU8, Ordering},
};

use tracing::{error, trace};

use crate::{
    collections::Completion,
    proto::{ChannelCodec, ChannelError, RequestKind, TerminalCheck, Xid},
};

/// Nothing committed yet (or the slot was recycled).
const EMPTY: u8 = 0;
/// Slot fields are published and the request awaits flushing/pairing.
const COMMITTED: u8 = 1;
/// The request reached its terminal outcome (success or failure).
const COMPLETED: u8 = 2;

/// Default terminal predicate: any reply completes the request unless it is
/// a multi-part reply still flagged "more fragments".
pub(crate) fn reply_is_terminal<R>(_reply: &R, more_fragments: bool) -> bool {
    !more_fragments
}

/// Outcome of applying a reply to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompleteOutcome {
    /// The entry holds no committed request.
    NotCommitted,
    /// The entry already reached its terminal outcome.
    Stale,
    /// The reply was collected but more parts are expected.
    Pending,
    /// The reply was terminal; the completion has been resolved.
    Terminal,
}

struct Slot<C: ChannelCodec> {
    request: Option<C::Request>,
    completion: Option<Completion<C::Response>>,
    replies: Vec<C::Response>,
    kind: RequestKind,
    terminal: TerminalCheck<C::Response>,
}

impl<C: ChannelCodec> Slot<C> {
    fn vacant() -> Self {
        Self {
            request: None,
            completion: None,
            replies: Vec::new(),
            kind: RequestKind::Single,
            terminal: reply_is_terminal::<C::Response>,
        }
    }
}

/// One pending request.
///
/// Producer-side methods ([`commit`](Self::commit)) may run from any thread,
/// once, between reservation and publication. Every other mutating method is
/// consumer-side: it must only be called from the queue's single consumer
/// half (the connection's I/O task), which is what makes the internal
/// `UnsafeCell` accesses sound.
pub(crate) struct Entry<C: ChannelCodec> {
    state: AtomicU8,
    slot: UnsafeCell<Slot<C>>,
}

// SAFETY: the slot is only ever touched by (a) the one producer that owns
// the entry's reserved xid, strictly before its release store of COMMITTED,
// and (b) the queue's unique consumer half, strictly after an acquire load
// observing COMMITTED. The state atomic orders (a) before (b); slot contents
// are Send because the codec's associated types are.
unsafe impl<C: ChannelCodec> Sync for Entry<C> {}

impl<C: ChannelCodec> Entry<C> {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            slot: UnsafeCell::new(Slot::vacant()),
        }
    }

    /// Whether a commit has been published (the entry may since have
    /// completed).
    #[inline]
    pub(crate) fn is_published(&self) -> bool {
        self.state.load(Ordering::Acquire) != EMPTY
    }

    /// Whether the entry reached its terminal outcome.
    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETED
    }

    /// Producer side: stores the request and publishes it to the consumer.
    ///
    /// Returns `false` without mutating the slot if the entry was already
    /// committed or completed; the offered completion is failed synchronously
    /// and the double commit logged, since it is a caller bug.
    pub(crate) fn commit(
        &self,
        xid: Xid,
        request: C::Request,
        kind: RequestKind,
        completion: Option<Completion<C::Response>>,
        terminal: TerminalCheck<C::Response>,
    ) -> bool {
        if self.state.load(Ordering::Acquire) != EMPTY {
            error!(xid, "commit of an already-committed transaction");
            if let Some(completion) = completion {
                completion.fail(ChannelError::AlreadyCompleted { xid });
            }
            return false;
        }

        // SAFETY: the producer owns the slot exclusively between reservation
        // and the release store below; the consumer will not read it until
        // it observes COMMITTED.
        let slot = unsafe { &mut *self.slot.get() };
        slot.request = Some(request);
        slot.kind = kind;
        slot.completion = completion;
        slot.terminal = terminal;

        // Publication must be the last write.
        self.state.store(COMMITTED, Ordering::Release);
        true
    }

    /// Consumer side: takes the request for transmission.
    ///
    /// Fire-and-forget entries with no completion self-complete here: the
    /// device sends no acknowledgement for them, so the moment the message
    /// leaves the queue is the last chance to account for them. Returns the
    /// request (if still present), its kind, and whether the entry
    /// self-completed.
    pub(crate) fn take_request(&self) -> (Option<C::Request>, RequestKind, bool) {
        debug_assert!(self.is_published());
        // SAFETY: consumer side, after publication (see type docs).
        let slot = unsafe { &mut *self.slot.get() };
        let request = slot.request.take();
        let kind = slot.kind;

        let self_completes = request.is_some()
            && kind == RequestKind::Unacknowledged
            && slot.completion.is_none()
            && self.state.load(Ordering::Acquire) == COMMITTED;
        if self_completes {
            self.state.store(COMPLETED, Ordering::Release);
        }
        (request, kind, self_completes)
    }

    /// Consumer side: applies a reply (or, with `None`, an implied success).
    ///
    /// A `None` reply is always terminal: it models completion vouched for
    /// by a barrier rather than acknowledged by the device. The completion
    /// is resolved and cleared on the terminal transition, so it cannot fire
    /// twice.
    pub(crate) fn complete(&self, reply: Option<C::Response>, more_fragments: bool) -> CompleteOutcome {
        match self.state.load(Ordering::Acquire) {
            EMPTY => return CompleteOutcome::NotCommitted,
            COMPLETED => return CompleteOutcome::Stale,
            _ => {}
        }

        // SAFETY: consumer side, after publication (see type docs).
        let slot = unsafe { &mut *self.slot.get() };
        let terminal = match reply {
            Some(reply) => {
                let terminal = (slot.terminal)(&reply, more_fragments);
                slot.replies.push(reply);
                terminal
            }
            None => true,
        };
        if !terminal {
            return CompleteOutcome::Pending;
        }

        self.state.store(COMPLETED, Ordering::Release);
        slot.request = None;
        let replies = mem::take(&mut slot.replies);
        if let Some(completion) = slot.completion.take() {
            completion.succeed(replies);
        }
        CompleteOutcome::Terminal
    }

    /// Consumer side: fails the entry, once.
    ///
    /// Already-completed entries cannot be failed; the attempt is logged and
    /// dropped. Returns whether the entry transitioned.
    pub(crate) fn fail(&self, cause: ChannelError) -> bool {
        if self.state.load(Ordering::Acquire) != COMMITTED {
            trace!(?cause, "ignoring failure of a non-pending entry");
            return false;
        }

        self.state.store(COMPLETED, Ordering::Release);
        // SAFETY: consumer side, after publication (see type docs).
        let slot = unsafe { &mut *self.slot.get() };
        slot.request = None;
        slot.replies.clear();
        if let Some(completion) = slot.completion.take() {
            completion.fail(cause);
        }
        true
    }

    /// Consumer side: whether the committed request is a barrier.
    pub(crate) fn is_barrier(&self) -> bool {
        if !self.is_published() {
            return false;
        }
        // SAFETY: consumer side, after publication (see type docs).
        let slot = unsafe { &*self.slot.get() };
        slot.kind == RequestKind::Barrier
    }

    /// Consumer side: winds the entry back to empty for segment recycling.
    pub(crate) fn reset(&self) {
        // SAFETY: recycling runs on the consumer half, and only for segments
        // whose entries have all completed; no producer can still own a
        // reservation in this slot.
        let slot = unsafe { &mut *self.slot.get() };
        *slot = Slot::vacant();
        self.state.store(EMPTY, Ordering::Release);
    }
}
