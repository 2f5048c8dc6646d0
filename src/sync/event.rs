//! Coalescing wakeup gate between producers and a connection's I/O task.
//!
//! Any number of notifications posted while the consumer is busy collapse
//! into a single pending wakeup: the gate is a test-and-set flag paired with
//! an [`event_listener::Event`] for parking. This is what bounds the flush
//! machinery to at most one scheduled flush at a time.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use event_listener::{Event, IntoNotification};
use thiserror::Error;

/// A wakeup is pending.
const SET: u8 = 1 << 0;
/// The gate was closed; no further wakeups will be delivered.
const CLOSED: u8 = 1 << 1;

/// Error returned when the other half of the gate has been dropped.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("gate closed")]
pub(crate) struct GateClosed;

struct Gate {
    flag: AtomicU8,
    event: Event,
}

impl Gate {
    fn close(&self) {
        self.flag.fetch_or(CLOSED, Ordering::AcqRel);
        self.event.notify(usize::MAX);
    }
}

/// Creates a connected notifier/waiter pair.
pub(crate) fn new() -> (Notifier, Waiter) {
    let gate = Arc::new(Gate {
        flag: AtomicU8::new(0),
        event: Event::new(),
    });
    (Notifier(gate.clone()), Waiter(gate))
}

/// Producer half: posts coalesced wakeups.
#[repr(transparent)]
pub(crate) struct Notifier(Arc<Gate>);

impl Notifier {
    /// Posts a wakeup. Wakeups posted while one is already pending coalesce.
    #[inline]
    pub(crate) fn notify(&self) -> Result<(), GateClosed> {
        let prev = self.0.flag.fetch_or(SET, Ordering::AcqRel);
        if prev & CLOSED != 0 {
            return Err(GateClosed);
        }
        if prev & SET == 0 {
            // First to set the flag wakes the waiter; followers coalesce.
            self.0.event.notify(1.additional().relaxed());
        }
        Ok(())
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Consumer half: waits for and consumes wakeups.
#[repr(transparent)]
pub(crate) struct Waiter(Arc<Gate>);

impl Waiter {
    /// Consumes a pending wakeup without waiting.
    #[inline]
    pub(crate) fn try_consume(&self) -> bool {
        self.0.flag.fetch_and(!SET, Ordering::AcqRel) & SET != 0
    }

    /// Waits until a wakeup is pending, then consumes it.
    pub(crate) async fn wait(&self) -> Result<(), GateClosed> {
        loop {
            if self.try_consume() {
                return Ok(());
            }
            if self.0.flag.load(Ordering::Acquire) & CLOSED != 0 {
                return Err(GateClosed);
            }

            let listener = self.0.event.listen();

            // Re-check after registering the listener: a notify that landed
            // in between would otherwise be lost.
            if self.try_consume() {
                return Ok(());
            }
            if self.0.flag.load(Ordering::Acquire) & CLOSED != 0 {
                return Err(GateClosed);
            }

            listener.await;
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.0.close();
    }
}
