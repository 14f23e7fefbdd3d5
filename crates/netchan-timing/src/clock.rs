use std::io;

use crate::{NS_IN_SEC, Nanos};

/// Clocks a periodic timer may run against.
///
/// TAI is the natural base for launch-time scheduling; MONOTONIC for
/// local wake-ups; REALTIME only for wall-clock aligned cycles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockId {
    Realtime,
    Monotonic,
    Tai,
}

impl ClockId {
    pub(crate) const fn as_raw(self) -> libc::clockid_t {
        match self {
            ClockId::Realtime => libc::CLOCK_REALTIME,
            ClockId::Monotonic => libc::CLOCK_MONOTONIC,
            ClockId::Tai => libc::CLOCK_TAI,
        }
    }
}

pub(crate) fn clock_now(clock: libc::clockid_t) -> Nanos {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    let rc = unsafe { libc::clock_gettime(clock, &raw mut ts) };
    if rc != 0 {
        return Nanos::ZERO;
    }
    Nanos(ts.tv_sec as u64 * NS_IN_SEC + ts.tv_nsec as u64)
}

#[inline]
pub fn tai_now() -> Nanos {
    clock_now(libc::CLOCK_TAI)
}

#[inline]
pub fn monotonic_now() -> Nanos {
    clock_now(libc::CLOCK_MONOTONIC)
}

#[inline]
pub fn real_now() -> Nanos {
    clock_now(libc::CLOCK_REALTIME)
}

/// Absolute sleep until `target` on `clock`. Restarts on EINTR so a
/// signal does not cut the wait short.
pub(crate) fn sleep_until(clock: libc::clockid_t, target: Nanos) -> io::Result<()> {
    let ts = libc::timespec {
        tv_sec: (target.0 / NS_IN_SEC) as libc::time_t,
        tv_nsec: (target.0 % NS_IN_SEC) as libc::c_long,
    };
    loop {
        let rc =
            unsafe { libc::clock_nanosleep(clock, libc::TIMER_ABSTIME, &ts, std::ptr::null_mut()) };
        match rc {
            0 => return Ok(()),
            libc::EINTR => {}
            err => return Err(io::Error::from_raw_os_error(err)),
        }
    }
}

#[inline]
pub fn sleep_tai_until(target: Nanos) -> io::Result<()> {
    sleep_until(libc::CLOCK_TAI, target)
}

#[inline]
pub fn sleep_monotonic_until(target: Nanos) -> io::Result<()> {
    sleep_until(libc::CLOCK_MONOTONIC, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clocks_tick() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(a > Nanos::ZERO);
        assert!(b >= a);
    }

    #[test]
    fn sleep_until_past_target_returns_immediately() {
        let t0 = monotonic_now();
        sleep_monotonic_until(t0.saturating_sub(Nanos::from_secs(1))).unwrap();
        let t1 = monotonic_now();
        assert!(t1 - t0 < Nanos::from_millis(50));
    }

    #[test]
    fn sleep_until_absolute_target() {
        let target = monotonic_now() + Nanos::from_millis(5);
        sleep_monotonic_until(target).unwrap();
        assert!(monotonic_now() >= target);
    }
}
