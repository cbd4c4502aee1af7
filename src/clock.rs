//! Virtual time sources.
//!
//! A [`VirtualClock`] only moves when a scheduler moves it, and only forward.
//! The [`Clock`] trait lets the alarm layer read that same timeline either as
//! elapsed-realtime or, through [`RtcClock`], as wall-clock time.

use std::cell::Cell;
use std::rc::Rc;

/// A monotonic millisecond clock.
pub trait Clock {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

impl<C: Clock + ?Sized> Clock for Rc<C> {
    fn now_ms(&self) -> u64 {
        self.as_ref().now_ms()
    }
}

impl<C: Clock + ?Sized> Clock for &C {
    fn now_ms(&self) -> u64 {
        (**self).now_ms()
    }
}

/// Deterministic clock owned by a scheduler.
#[derive(Debug)]
pub struct VirtualClock {
    current_ms: Cell<u64>,
}

impl VirtualClock {
    /// Create a clock starting at the given time.
    #[must_use]
    pub const fn new(start_ms: u64) -> Self {
        Self {
            current_ms: Cell::new(start_ms),
        }
    }

    /// Move the clock forward to `target_ms`.
    ///
    /// Returns false (and leaves the clock untouched) when `target_ms` is in
    /// the past.
    pub fn advance_to(&self, target_ms: u64) -> bool {
        if target_ms < self.current_ms.get() {
            return false;
        }
        self.current_ms.set(target_ms);
        true
    }

    /// Move the clock forward by `ms`, saturating at `u64::MAX`.
    pub fn advance_by(&self, ms: u64) {
        self.current_ms
            .set(self.current_ms.get().saturating_add(ms));
    }

    /// Rewind to a start time. Only scheduler resets may do this.
    pub(crate) fn rewind(&self, start_ms: u64) {
        self.current_ms.set(start_ms);
    }
}

impl Clock for VirtualClock {
    fn now_ms(&self) -> u64 {
        self.current_ms.get()
    }
}

/// Wall-clock view of an elapsed-time clock: a fixed offset added to it.
#[derive(Debug, Clone)]
pub struct RtcClock<C: Clock> {
    elapsed: C,
    epoch_offset_ms: u64,
}

impl<C: Clock> RtcClock<C> {
    #[must_use]
    pub const fn new(elapsed: C, epoch_offset_ms: u64) -> Self {
        Self {
            elapsed,
            epoch_offset_ms,
        }
    }

    #[must_use]
    pub const fn epoch_offset_ms(&self) -> u64 {
        self.epoch_offset_ms
    }
}

impl<C: Clock> Clock for RtcClock<C> {
    fn now_ms(&self) -> u64 {
        self.elapsed.now_ms().saturating_add(self.epoch_offset_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virtual_clock_moves_forward_only() {
        let clock = VirtualClock::new(100);
        assert_eq!(clock.now_ms(), 100);

        assert!(clock.advance_to(250));
        assert_eq!(clock.now_ms(), 250);

        assert!(!clock.advance_to(200));
        assert_eq!(clock.now_ms(), 250);

        clock.advance_by(50);
        assert_eq!(clock.now_ms(), 300);
    }

    #[test]
    fn virtual_clock_saturates() {
        let clock = VirtualClock::new(u64::MAX - 1);
        clock.advance_by(10);
        assert_eq!(clock.now_ms(), u64::MAX);
    }

    #[test]
    fn rtc_clock_tracks_elapsed_with_offset() {
        let elapsed = Rc::new(VirtualClock::new(100));
        let rtc = RtcClock::new(Rc::clone(&elapsed), 1_000_000);
        assert_eq!(rtc.now_ms(), 1_000_100);

        elapsed.advance_by(900);
        assert_eq!(rtc.now_ms(), 1_001_000);
        assert_eq!(rtc.epoch_offset_ms(), 1_000_000);
    }
}
