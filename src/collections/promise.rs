//! One-shot completion delivery for outstanding requests.
//!
//! Every request resolves through exactly one [`Completion`]/[`PendingReply`]
//! pair: success carries the collected reply parts, failure carries a
//! [`ChannelError`]. "Resolve exactly once" is enforced by the container
//! (consuming `self`, backed by a oneshot channel), not by the discipline of
//! whoever holds it.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::oneshot;

use crate::proto::ChannelError;

type Outcome<R> = Result<Vec<R>, ChannelError>;

/// Resolving half, held by the queue entry that owns the request.
pub(crate) struct Completion<R>(oneshot::Sender<Outcome<R>>);

impl<R> Completion<R> {
    /// Creates a connected completion/pending pair.
    pub(crate) fn new() -> (Self, PendingReply<R>) {
        let (tx, rx) = oneshot::channel();
        (Self(tx), PendingReply(rx))
    }

    /// Resolves with the collected reply parts.
    ///
    /// An empty vec means completion was implied rather than acknowledged
    /// (barrier cascade, or a send the device never replies to).
    pub(crate) fn succeed(self, replies: Vec<R>) {
        let _ = self.0.send(Ok(replies));
    }

    /// Resolves with a failure.
    pub(crate) fn fail(self, cause: ChannelError) {
        let _ = self.0.send(Err(cause));
    }
}

/// Caller-facing half: a future resolving to the request's outcome.
///
/// Dropping it is allowed; the reply is then discarded when it arrives.
pub struct PendingReply<R>(oneshot::Receiver<Outcome<R>>);

impl<R> PendingReply<R> {
    /// Non-blocking poll used by synchronous unit tests.
    #[cfg(test)]
    pub(crate) fn try_take(&mut self) -> Option<Outcome<R>> {
        self.0.try_recv().ok()
    }
}

impl<R> Future for PendingReply<R> {
    type Output = Outcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.0).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // The resolving half was dropped without resolving: the channel
            // died before this request was accounted for.
            Poll::Ready(Err(_)) => Poll::Ready(Err(ChannelError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
