use std::{
    ops::{Add, AddAssign, Div, Mul, Sub, SubAssign},
    str::FromStr,
};

use humantime::{Duration as HumanDuration, DurationError as HumanDurationError};
use serde::{Deserializer, Serialize};

use crate::{NS_IN_MS, NS_IN_SEC, NS_IN_US};

/// Nanoseconds, either as a span or as an absolute TAI timestamp.
///
/// Absolute values are ns since the epoch on CLOCK_TAI (or a PHC slaved
/// to it), good until 2554 or so.
#[derive(Copy, Clone, Debug, Default, Serialize, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[repr(C)]
pub struct Nanos(pub u64);

impl Nanos {
    pub const MAX: Nanos = Nanos(u64::MAX);
    pub const ZERO: Nanos = Nanos(0);

    #[inline]
    pub const fn from_secs(s: u64) -> Self {
        Nanos(s * NS_IN_SEC)
    }

    #[inline]
    pub const fn from_millis(ms: u64) -> Self {
        Nanos(ms * NS_IN_MS)
    }

    #[inline]
    pub const fn from_micros(us: u64) -> Self {
        Nanos(us * NS_IN_US)
    }

    #[inline]
    pub const fn from_hours(h: u64) -> Self {
        Nanos(h * 3600 * NS_IN_SEC)
    }

    #[inline]
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NS_IN_SEC as f64
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0 / NS_IN_US
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn saturating_sub(self, rhs: Nanos) -> Self {
        Nanos(self.0.saturating_sub(rhs.0))
    }

    #[inline]
    pub const fn saturating_add(self, rhs: Nanos) -> Self {
        Nanos(self.0.saturating_add(rhs.0))
    }

    /// Signed difference, for wake-error style measurements.
    #[inline]
    pub const fn signed_delta(self, rhs: Nanos) -> i64 {
        self.0 as i64 - rhs.0 as i64
    }
}

impl std::fmt::Display for Nanos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 < NS_IN_US {
            write!(f, "{}ns", self.0)
        } else if self.0 < NS_IN_MS {
            write!(f, "{}us", self.0 as f64 / NS_IN_US as f64)
        } else if self.0 < NS_IN_SEC {
            write!(f, "{}ms", self.0 as f64 / NS_IN_MS as f64)
        } else {
            write!(f, "{}s", self.as_secs_f64())
        }
    }
}

impl Add for Nanos {
    type Output = Nanos;

    #[inline]
    fn add(self, rhs: Nanos) -> Nanos {
        Nanos(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Nanos {
    #[inline]
    fn add_assign(&mut self, rhs: Nanos) {
        *self = *self + rhs;
    }
}

impl Sub for Nanos {
    type Output = Nanos;

    #[inline]
    fn sub(self, rhs: Nanos) -> Nanos {
        Nanos(self.0 - rhs.0)
    }
}

impl SubAssign for Nanos {
    #[inline]
    fn sub_assign(&mut self, rhs: Nanos) {
        *self = *self - rhs;
    }
}

impl Mul<u64> for Nanos {
    type Output = Nanos;

    #[inline]
    fn mul(self, rhs: u64) -> Nanos {
        Nanos(self.0 * rhs)
    }
}

impl Div<u64> for Nanos {
    type Output = Nanos;

    #[inline]
    fn div(self, rhs: u64) -> Nanos {
        Nanos(self.0 / rhs)
    }
}

impl Div<Nanos> for Nanos {
    type Output = u64;

    #[inline]
    fn div(self, rhs: Nanos) -> u64 {
        self.0 / rhs.0
    }
}

impl From<u64> for Nanos {
    #[inline]
    fn from(value: u64) -> Self {
        Nanos(value)
    }
}

impl From<Nanos> for u64 {
    #[inline]
    fn from(value: Nanos) -> Self {
        value.0
    }
}

impl From<Nanos> for std::time::Duration {
    #[inline]
    fn from(value: Nanos) -> Self {
        std::time::Duration::from_nanos(value.0)
    }
}

impl FromStr for Nanos {
    type Err = HumanDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let duration: std::time::Duration = s.trim().parse::<HumanDuration>()?.into();
        Ok(Nanos(duration.as_nanos() as u64))
    }
}

impl<'de> serde::Deserialize<'de> for Nanos {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use std::fmt;

        use serde::de::{self, Visitor};

        struct NanosVisitor;

        impl Visitor<'_> for NanosVisitor {
            type Value = Nanos;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an integer or a string with optional suffix (s, ms, us, ...)")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                Ok(Nanos(value))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                if value < 0 {
                    return Err(E::custom(format!("Nanos cannot be negative, got {value}")));
                }
                Ok(Nanos(value as u64))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                Nanos::from_str(value).map_err(|e| {
                    E::custom(format!("failed to parse '{value}' as a duration: {e}"))
                })
            }
        }

        if deserializer.is_human_readable() {
            deserializer.deserialize_any(NanosVisitor)
        } else {
            u64::deserialize(deserializer).map(Nanos)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_string_seconds() {
        let result: Nanos = serde_json::from_str(r#""10s""#).unwrap();
        assert_eq!(result, Nanos::from_secs(10));
    }

    #[test]
    fn from_string_milliseconds() {
        let result: Nanos = serde_json::from_str(r#""20ms""#).unwrap();
        assert_eq!(result, Nanos::from_millis(20));
    }

    #[test]
    fn from_string_microseconds() {
        let result: Nanos = serde_json::from_str(r#""528us""#).unwrap();
        assert_eq!(result, Nanos::from_micros(528));
    }

    #[test]
    fn from_number() {
        let result: Nanos = serde_json::from_str("528").unwrap();
        assert_eq!(result, Nanos(528));
    }

    #[test]
    fn signed_delta_goes_negative() {
        assert_eq!(Nanos(100).signed_delta(Nanos(250)), -150);
        assert_eq!(Nanos(250).signed_delta(Nanos(100)), 150);
    }
}
