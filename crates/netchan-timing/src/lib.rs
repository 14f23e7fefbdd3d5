mod clock;
mod delay;
mod nanos;
mod periodic;
mod ptp;

pub use clock::{ClockId, monotonic_now, real_now, sleep_monotonic_until, sleep_tai_until, tai_now};
pub use delay::{Wake, delay_until};
pub use nanos::Nanos;
pub use periodic::{MIN_PHASE, PeriodicTimer, TimerError};
pub use ptp::{PtpClock, PtpError, probe_phc, ptp_now_ns};

pub const NS_IN_US: u64 = 1_000;
pub const NS_IN_MS: u64 = 1_000 * NS_IN_US;
pub const NS_IN_SEC: u64 = 1_000 * NS_IN_MS;
pub const NS_IN_HOUR: u64 = 3_600 * NS_IN_SEC;

/// Lower 32 bit of a TAI nanosecond timestamp, as carried in the AVTP
/// common header. Wraps roughly every 4.29 s.
#[inline]
pub fn tai_to_avtp32(ns: Nanos) -> u32 {
    (ns.0 & 0xffff_ffff) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avtp32_is_lower_word() {
        assert_eq!(tai_to_avtp32(Nanos(0x1_2345_6789)), 0x2345_6789);
        assert_eq!(tai_to_avtp32(Nanos(u64::MAX)), u32::MAX);
        assert_eq!(tai_to_avtp32(Nanos::ZERO), 0);
    }
}
