use std::io;

use thiserror::Error;

use crate::{
    Nanos,
    clock::{ClockId, clock_now, sleep_until},
};

/// Shortest supported cycle. The launch-time Qdisc refuses deadlines
/// too close to now, so waking clients tighter than this is pointless.
pub const MIN_PHASE: Nanos = Nanos::from_micros(100);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimerError {
    #[error("phase {0} below minimum of {MIN_PHASE}")]
    PhaseTooShort(Nanos),
    #[error("base {base} is more than one phase ({phase}) behind now ({now})")]
    StaleBase { base: Nanos, phase: Nanos, now: Nanos },
}

/// Absolute-deadline periodic timer.
///
/// Each cycle advances a fixed deadline by `phase` and sleeps to it, so
/// processing jitter does not accumulate across cycles.
#[derive(Clone, Copy, Debug)]
pub struct PeriodicTimer {
    next: Nanos,
    phase: Nanos,
    clock: ClockId,
}

impl PeriodicTimer {
    /// `base` of zero starts the cycle chain at the current time on
    /// `clock`. A nonzero base must not lag more than one phase behind
    /// now, otherwise the timer would burn cycles catching up.
    pub fn new(base: Nanos, phase: Nanos, clock: ClockId) -> Result<Self, TimerError> {
        if phase < MIN_PHASE {
            return Err(TimerError::PhaseTooShort(phase));
        }

        let now = clock_now(clock.as_raw());
        let next = if base.is_zero() {
            now
        } else {
            if base < now.saturating_sub(phase) {
                return Err(TimerError::StaleBase { base, phase, now });
            }
            base
        };

        Ok(Self { next, phase, clock })
    }

    #[inline]
    pub fn phase(&self) -> Nanos {
        self.phase
    }

    /// Block until the next cycle deadline.
    pub fn next_cycle(&mut self) -> io::Result<()> {
        self.next += self.phase;
        sleep_until(self.clock.as_raw(), self.next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::monotonic_now;

    #[test]
    fn phase_below_minimum_rejected() {
        let err = PeriodicTimer::new(Nanos::ZERO, Nanos::from_micros(99), ClockId::Monotonic);
        assert_eq!(err.unwrap_err(), TimerError::PhaseTooShort(Nanos::from_micros(99)));
    }

    #[test]
    fn stale_base_rejected() {
        let now = monotonic_now();
        let base = now.saturating_sub(Nanos::from_secs(2));
        let err = PeriodicTimer::new(base, Nanos::from_millis(1), ClockId::Monotonic);
        assert!(matches!(err, Err(TimerError::StaleBase { .. })));
    }

    #[test]
    fn cycles_advance_by_phase() {
        let phase = Nanos::from_millis(2);
        let mut pt = PeriodicTimer::new(Nanos::ZERO, phase, ClockId::Monotonic).unwrap();
        let t0 = monotonic_now();
        pt.next_cycle().unwrap();
        pt.next_cycle().unwrap();
        let elapsed = monotonic_now() - t0;
        assert!(elapsed >= phase, "two cycles took {elapsed}");
    }
}
