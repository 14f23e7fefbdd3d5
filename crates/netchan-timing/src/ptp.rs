use std::{
    fs::File,
    io,
    os::fd::{AsRawFd, OwnedFd},
};

use thiserror::Error;
use tracing::warn;

use crate::{Nanos, clock::clock_now};

const ETHTOOL_GET_TS_INFO: u32 = 0x0000_0041;
const SIOCETHTOOL: libc::c_ulong = 0x8946;
const CLOCKFD: libc::clockid_t = 3;

#[derive(Error, Debug)]
pub enum PtpError {
    /// Loopback can neither sync others nor be synced, so a PHC makes
    /// no sense there. Callers fall back to zero timestamps.
    #[error("loopback has no PTP hardware clock")]
    Loopback,
    #[error("no PTP hardware clock behind {0}")]
    NoPhc(String),
    #[error("ptp io: {0}")]
    Io(#[from] io::Error),
}

/// Mirrors struct ethtool_ts_info from linux/ethtool.h.
#[repr(C)]
#[derive(Default)]
struct EthtoolTsInfo {
    cmd: u32,
    so_timestamping: u32,
    phc_index: i32,
    tx_types: u32,
    tx_reserved: [u32; 3],
    rx_filters: u32,
    rx_reserved: [u32; 3],
}

#[repr(C)]
struct EthtoolIfreq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_data: *mut libc::c_void,
}

fn ifname_bytes(ifname: &str) -> [libc::c_char; libc::IFNAMSIZ] {
    let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
    for (slot, b) in name.iter_mut().zip(ifname.as_bytes().iter().take(libc::IFNAMSIZ - 1)) {
        *slot = *b as libc::c_char;
    }
    name
}

/// Handle to the PTP Hardware Clock on a NIC.
///
/// Expects a PTP daemon to keep the PHC in sync with the network; the
/// PHC is read directly, CLOCK_REALTIME is never consulted.
#[derive(Debug)]
pub struct PtpClock {
    fd: OwnedFd,
}

impl PtpClock {
    /// Look up the PHC index behind `ifname` via ethtool and open the
    /// matching /dev/ptp device.
    pub fn open(ifname: &str) -> Result<Self, PtpError> {
        if ifname.starts_with("lo") {
            return Err(PtpError::Loopback);
        }

        let probe = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if probe < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut info = EthtoolTsInfo { cmd: ETHTOOL_GET_TS_INFO, ..Default::default() };
        let mut req = EthtoolIfreq {
            ifr_name: ifname_bytes(ifname),
            ifr_data: (&raw mut info).cast::<libc::c_void>(),
        };
        let rc = unsafe { libc::ioctl(probe, SIOCETHTOOL, &raw mut req) };
        let ioctl_err = io::Error::last_os_error();
        unsafe { libc::close(probe) };
        if rc < 0 {
            return Err(ioctl_err.into());
        }
        if info.phc_index < 0 {
            return Err(PtpError::NoPhc(ifname.to_string()));
        }

        let file = File::open(format!("/dev/ptp{}", info.phc_index))?;
        Ok(Self { fd: file.into() })
    }

    /// Dynamic posix clock id for the PHC fd.
    fn clockid(&self) -> libc::clockid_t {
        (!self.fd.as_raw_fd() << 3) | CLOCKFD
    }

    /// Current PHC time in ns. A failed read returns zero rather than
    /// an error so hot paths stay branch-light; the caller decides
    /// whether zero timestamps are acceptable.
    pub fn now_ns(&self) -> Nanos {
        clock_now(self.clockid())
    }
}

/// PTP time through an optional handle, zero when the handle is absent
/// (loopback or probing failed at startup).
#[inline]
pub fn ptp_now_ns(clock: Option<&PtpClock>) -> Nanos {
    match clock {
        Some(c) => c.now_ns(),
        None => Nanos::ZERO,
    }
}

/// Probe helper for handler startup: warn and carry on without PTP.
pub fn probe_phc(ifname: &str) -> Option<PtpClock> {
    match PtpClock::open(ifname) {
        Ok(clock) => Some(clock),
        Err(err) => {
            warn!(ifname, %err, "no PTP clock, timestamps will read as zero");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_is_rejected() {
        assert!(matches!(PtpClock::open("lo"), Err(PtpError::Loopback)));
    }

    #[test]
    fn absent_handle_reads_zero() {
        assert_eq!(ptp_now_ns(None), Nanos::ZERO);
    }
}
