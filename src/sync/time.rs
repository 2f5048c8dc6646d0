use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

/// A `Duration` behind an atomic, for knobs tuned while the I/O task runs.
///
/// Stored as saturating nanoseconds; durations beyond ~584 years clamp.
pub(crate) struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub(crate) fn new(duration: Duration) -> Self {
        Self(AtomicU64::new(Self::to_nanos(duration)))
    }

    pub(crate) fn store(&self, duration: Duration) {
        self.0.store(Self::to_nanos(duration), Ordering::Relaxed);
    }

    pub(crate) fn load(&self) -> Duration {
        Duration::from_nanos(self.0.load(Ordering::Relaxed))
    }

    fn to_nanos(duration: Duration) -> u64 {
        u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_load() {
        // 1. Construction
        let knob = AtomicDuration::new(Duration::from_secs(10));
        assert_eq!(knob.load(), Duration::from_secs(10));

        // 2. Update
        knob.store(Duration::from_micros(250));
        assert_eq!(knob.load(), Duration::from_micros(250));

        // 3. Sub-second precision survives the round trip
        let precise = Duration::new(3, 123_456_789);
        knob.store(precise);
        assert_eq!(knob.load(), precise);

        // 4. Zero
        knob.store(Duration::ZERO);
        assert_eq!(knob.load(), Duration::ZERO);
    }

    #[test]
    fn test_saturates_instead_of_panicking() {
        let knob = AtomicDuration::new(Duration::MAX);
        assert_eq!(knob.load(), Duration::from_nanos(u64::MAX));
    }
}
