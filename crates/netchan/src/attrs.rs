use netchan_timing::{ClockId, NS_IN_MS, NS_IN_US, Nanos, PeriodicTimer};

use crate::{Error, Result, frame::HDR_LEN};

/// Largest payload so that payload + header fits a 1500-octet MTU.
pub const MAX_PAYLOAD: usize = 1476;

/// Shortest declarable interval: one minimum-size Ethernet frame
/// including preamble and IPG at 1 Gbps.
pub const MIN_INTERVAL: Nanos = Nanos(528);

/// Longest declarable interval (one frame per hour).
pub const MAX_INTERVAL: Nanos = Nanos(3600 * 1_000_000_000);

/// Wire overhead per frame besides the payload: AVTP common header
/// plus Ethernet header, VLAN tag and FCS.
const FRAME_OVERHEAD: usize = HDR_LEN + 22;

/// Empty multicast MAC base; IP multicast maps its low-order 23 bits
/// into the low-order 23 here.
pub const DEFAULT_MCAST: [u8; 6] = [0x01, 0x00, 0x5E, 0x00, 0x00, 0x00];

/// AVB traffic class of a stream.
///
/// The class fixes the worst-case delivery bound the `*_wait` calls
/// sleep to, and the default PCP priority when running without SRP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamClass {
    A,
    B,
    Tas,
}

impl StreamClass {
    /// Guaranteed worst-case delivery bound for the class.
    pub const fn delay_bound(self) -> Nanos {
        match self {
            StreamClass::A => Nanos(2 * NS_IN_MS),
            StreamClass::B => Nanos(50 * NS_IN_MS),
            StreamClass::Tas => Nanos(100 * NS_IN_US),
        }
    }

    /// PCP used when no SRP domain overrides it.
    pub const fn default_prio(self) -> u8 {
        match self {
            StreamClass::A | StreamClass::Tas => 3,
            StreamClass::B => 2,
        }
    }
}

/// Static, user-declared description of one channel.
///
/// Typically these live in a manifest slice shared between the talker
/// and listener ends so both sides agree on framing and timing.
#[derive(Clone, Copy, Debug)]
pub struct ChannelAttrs {
    /// Destination MAC the talker publishes to: unicast, multicast
    /// (01:00:5e:..) or broadcast.
    pub dst: [u8; 6],
    /// Unique 64-bit stream id; zero is reserved.
    pub stream_id: u64,
    pub sc: StreamClass,
    /// Payload octets per frame.
    pub size: u16,
    /// Minimum distance between frames (1/freq).
    pub interval_ns: Nanos,
    /// Display name; manifests look channels up by it.
    pub name: &'static str,
}

impl ChannelAttrs {
    /// Screen the declaration against the framing and bandwidth limits
    /// for a link of `link_speed_bps`.
    pub fn validate(&self, link_speed_bps: u64) -> Result<()> {
        if self.stream_id == 0 {
            return Err(Error::InvalidAttribute("stream id must not be zero".into()));
        }
        if self.size == 0 || self.size as usize > MAX_PAYLOAD {
            return Err(Error::InvalidAttribute(format!(
                "payload size {} outside 1..={MAX_PAYLOAD}",
                self.size
            )));
        }
        if self.interval_ns < MIN_INTERVAL || self.interval_ns > MAX_INTERVAL {
            return Err(Error::InvalidAttribute(format!(
                "interval {} outside {MIN_INTERVAL}..={MAX_INTERVAL}",
                self.interval_ns
            )));
        }
        if self.name.len() > 32 {
            return Err(Error::InvalidAttribute(format!("name '{}' longer than 32", self.name)));
        }

        // The full frame must fit within one interval at link speed.
        let bytes_per_interval = link_speed_bps as u128 * self.interval_ns.0 as u128 / 8 / 1_000_000_000;
        let wire_bytes = (self.size as usize + FRAME_OVERHEAD) as u128;
        if wire_bytes > bytes_per_interval {
            return Err(Error::InvalidAttribute(format!(
                "{wire_bytes} wire bytes exceed the {bytes_per_interval} byte budget of one {} interval",
                self.interval_ns
            )));
        }
        Ok(())
    }

    /// Octets of one serialised PDU (header + payload).
    pub fn pdu_size(&self) -> usize {
        HDR_LEN + self.size as usize
    }

    /// TAI periodic timer running at the channel's declared interval,
    /// for talkers that pace themselves.
    pub fn periodic_timer(&self) -> Result<PeriodicTimer> {
        PeriodicTimer::new(Nanos::ZERO, self.interval_ns, ClockId::Tai)
            .map_err(|err| Error::InvalidAttribute(err.to_string()))
    }

    pub fn is_multicast(&self) -> bool {
        self.dst[..3] == DEFAULT_MCAST[..3]
    }
}

/// Find a channel declaration by name in a manifest slice.
pub fn attrs_by_name<'a>(name: &str, manifest: &'a [ChannelAttrs]) -> Option<&'a ChannelAttrs> {
    manifest.iter().find(|a| a.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GBIT: u64 = 1_000_000_000;

    fn attrs() -> ChannelAttrs {
        ChannelAttrs {
            dst: [0x01, 0x00, 0x5E, 0x00, 0x00, 0x2A],
            stream_id: 42,
            sc: StreamClass::A,
            size: 8,
            interval_ns: Nanos::from_millis(20),
            name: "test1",
        }
    }

    #[test]
    fn valid_declaration_accepted() {
        attrs().validate(GBIT).unwrap();
    }

    #[test]
    fn zero_stream_id_rejected() {
        let a = ChannelAttrs { stream_id: 0, ..attrs() };
        assert!(matches!(a.validate(GBIT), Err(Error::InvalidAttribute(_))));
    }

    #[test]
    fn payload_size_bounds() {
        assert!(ChannelAttrs { size: 0, ..attrs() }.validate(GBIT).is_err());
        assert!(ChannelAttrs { size: 1477, ..attrs() }.validate(GBIT).is_err());
        ChannelAttrs { size: 1476, ..attrs() }.validate(GBIT).unwrap();
    }

    #[test]
    fn interval_bounds() {
        assert!(
            ChannelAttrs { interval_ns: Nanos(527), size: 1, ..attrs() }.validate(GBIT).is_err()
        );
        assert!(
            ChannelAttrs { interval_ns: MAX_INTERVAL + Nanos(1), ..attrs() }
                .validate(GBIT)
                .is_err()
        );
        ChannelAttrs { interval_ns: MIN_INTERVAL, size: 1, ..attrs() }.validate(GBIT).unwrap();
        ChannelAttrs { interval_ns: MAX_INTERVAL, ..attrs() }.validate(GBIT).unwrap();
    }

    #[test]
    fn oversubscribed_interval_rejected() {
        // 1476 + 46 overhead = 1522 wire bytes need ~12.2 us at 1 Gbps.
        let a = ChannelAttrs { size: 1476, interval_ns: Nanos(1500), ..attrs() };
        assert!(a.validate(GBIT).is_err());
        // Plenty of room on a faster link.
        a.validate(100 * GBIT).unwrap();
        // And once the interval covers the frame time.
        ChannelAttrs { size: 1476, interval_ns: Nanos::from_micros(13), ..attrs() }
            .validate(GBIT)
            .unwrap();
    }

    #[test]
    fn class_bounds_and_prios() {
        assert_eq!(StreamClass::A.delay_bound(), Nanos::from_millis(2));
        assert_eq!(StreamClass::B.delay_bound(), Nanos::from_millis(50));
        assert_eq!(StreamClass::Tas.delay_bound(), Nanos::from_micros(100));
        assert_eq!(StreamClass::A.default_prio(), 3);
        assert_eq!(StreamClass::B.default_prio(), 2);
    }

    #[test]
    fn manifest_lookup_by_name() {
        let manifest = [attrs(), ChannelAttrs { stream_id: 43, name: "other", ..attrs() }];
        assert_eq!(attrs_by_name("other", &manifest).unwrap().stream_id, 43);
        assert!(attrs_by_name("missing", &manifest).is_none());
    }

    #[test]
    fn periodic_timer_follows_interval_limits() {
        assert!(attrs().periodic_timer().is_ok());
        let fast = ChannelAttrs { interval_ns: Nanos::from_micros(50), ..attrs() };
        assert!(fast.periodic_timer().is_err());
    }

    #[test]
    fn multicast_detection() {
        assert!(attrs().is_multicast());
        assert!(!ChannelAttrs { dst: [2; 6], ..attrs() }.is_multicast());
    }
}
