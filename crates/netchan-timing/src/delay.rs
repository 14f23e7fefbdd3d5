use std::io;

use tracing::trace;

use crate::{
    Nanos,
    clock::{monotonic_now, sleep_monotonic_until},
    ptp::{PtpClock, ptp_now_ns},
};

/// Outcome of one [`delay_until`] call.
///
/// `error_ns` is target minus actual wake-up on the CPU clock: positive
/// means we woke early, negative late. The cpu_* fields feed the
/// wake-delay log.
#[derive(Clone, Copy, Debug)]
pub struct Wake {
    pub error_ns: i64,
    pub ptp_target: Nanos,
    pub cpu_target: Nanos,
    pub cpu_actual: Nanos,
}

/// Sleep until `ptp_target` (a PTP/TAI instant) using the local
/// monotonic clock.
///
/// Both clocks are assumed to run at the same rate, so the PTP distance
/// to the target is mapped 1:1 onto CLOCK_MONOTONIC and slept on with
/// an absolute deadline. The wake error is measured on return; callers
/// chasing a tight deadline iterate while the error stays above their
/// tolerance (50 us is the convention here).
///
/// With no PTP handle (loopback) the PTP side reads zero and the
/// result is meaningless; *_wait semantics are undefined there.
pub fn delay_until(ptp: Option<&PtpClock>, ptp_target: Nanos) -> io::Result<Wake> {
    let ptp_now = ptp_now_ns(ptp);
    if ptp_target < ptp_now {
        // Already past: report how far behind without sleeping.
        let now_cpu = monotonic_now();
        return Ok(Wake {
            error_ns: ptp_target.signed_delta(ptp_now),
            ptp_target,
            cpu_target: now_cpu,
            cpu_actual: now_cpu,
        });
    }

    let rel = ptp_target - ptp_now;
    let cpu_target = monotonic_now() + rel;
    sleep_monotonic_until(cpu_target)?;
    let cpu_actual = monotonic_now();
    let error_ns = cpu_target.signed_delta(cpu_actual);

    trace!(
        target_ns = ptp_target.0,
        wake_ns = cpu_actual.0,
        error_ns,
        late = error_ns < 0,
        "wake"
    );

    Ok(Wake { error_ns, ptp_target, cpu_target, cpu_actual })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without a PHC the ptp side reads zero, so any target maps to a
    // relative monotonic sleep of the same length.
    #[test]
    fn zero_target_does_not_block() {
        let t0 = monotonic_now();
        let wake = delay_until(None, Nanos::ZERO).unwrap();
        assert!(wake.error_ns <= 0);
        assert!(monotonic_now() - t0 < Nanos::from_millis(50));
    }

    #[test]
    fn sleeps_relative_distance() {
        let t0 = monotonic_now();
        let wake = delay_until(None, Nanos::from_millis(10)).unwrap();
        let t1 = monotonic_now();
        assert!(t1 - t0 >= Nanos::from_millis(9));
        assert!(wake.cpu_actual >= wake.cpu_target);
    }
}
