use std::sync::LazyLock;

pub(crate) mod event;
pub(crate) mod time;

pub(crate) use event::{Notifier, Waiter};
pub(crate) use time::AtomicDuration;

/// Monotonic epoch for cheap relative timestamps (barrier aging, cache
/// stamps, flush budgets).
pub(crate) static EPOCH: LazyLock<quanta::Instant> = LazyLock::new(quanta::Instant::now);
