//! Raw kernel plumbing: packet sockets, launch-time control messages,
//! receive timestamping and the real-time latency knobs.
//!
//! Every unsafe block in the crate lives here, wrapped in small safe
//! functions. Constants missing from libc are defined locally from the
//! kernel headers.

use std::{
    fs::OpenOptions,
    io::{self, Write},
    mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    ptr,
};

use netchan_timing::Nanos;
use tracing::{debug, warn};

use crate::{Error, Result, SchedErrorKind, frame::ETH_P_TSN};

const ETHTOOL_GSET: u32 = 0x0000_0001;
const SIOCETHTOOL: libc::c_ulong = 0x8946;

const SO_EE_ORIGIN_TXTIME: u8 = 6;
const SO_EE_CODE_TXTIME_INVALID_PARAM: u8 = 1;
const SO_EE_CODE_TXTIME_MISSED: u8 = 2;

/// linux/if_packet.h pkttype of frames this host is sending.
const PACKET_OUTGOING: u8 = 4;

/// Receive timeout so the Rx thread can observe shutdown.
pub const RX_TIMEOUT_US: i64 = 250_000;

/// MTU-sized frame plus VLAN tag and headroom.
pub const RX_BUF_LEN: usize = 1522;

#[repr(C)]
union IfrIfru {
    ifindex: libc::c_int,
    flags: libc::c_short,
    data: *mut libc::c_void,
    hwaddr: libc::sockaddr,
}

#[repr(C)]
struct Ifreq {
    name: [libc::c_char; libc::IFNAMSIZ],
    ifru: IfrIfru,
}

impl Ifreq {
    fn for_interface(ifname: &str) -> Self {
        let mut name = [0 as libc::c_char; libc::IFNAMSIZ];
        for (slot, b) in name.iter_mut().zip(ifname.as_bytes().iter().take(libc::IFNAMSIZ - 1)) {
            *slot = *b as libc::c_char;
        }
        Self { name, ifru: IfrIfru { ifindex: 0 } }
    }
}

/// Legacy struct ethtool_cmd, enough of it to read the link speed.
#[repr(C)]
#[derive(Default)]
struct EthtoolCmd {
    cmd: u32,
    supported: u32,
    advertising: u32,
    speed: u16,
    duplex: u8,
    port: u8,
    phy_address: u8,
    transceiver: u8,
    autoneg: u8,
    mdio_support: u8,
    maxtxpkt: u32,
    maxrxpkt: u32,
    speed_hi: u16,
    eth_tp_mdix: u8,
    eth_tp_mdix_ctrl: u8,
    lp_advertising: u32,
    reserved: [u32; 2],
}

/// Interface facts the handler and channels need.
#[derive(Clone, Copy, Debug)]
pub struct IfInfo {
    pub index: i32,
    pub speed_bps: u64,
    pub is_lo: bool,
}

fn ioctl_ifreq(fd: RawFd, request: libc::c_ulong, req: &mut Ifreq) -> io::Result<()> {
    let rc = unsafe { libc::ioctl(fd, request, ptr::from_mut(req)) };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Resolve interface index and link speed. Loopback (or a NIC that
/// does not answer ethtool) is assumed to run at 1 Gbps, which only
/// affects attribute screening.
pub fn if_info(ifname: &str) -> Result<IfInfo> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut req = Ifreq::for_interface(ifname);
    ioctl_ifreq(fd.as_raw_fd(), libc::SIOCGIFINDEX, &mut req)
        .map_err(|_| Error::InvalidInterface(ifname.to_string()))?;
    let index = unsafe { req.ifru.ifindex };

    let is_lo = ifname.starts_with("lo");
    let mut cmd = EthtoolCmd { cmd: ETHTOOL_GSET, ..Default::default() };
    let mut req = Ifreq::for_interface(ifname);
    req.ifru.data = (&raw mut cmd).cast::<libc::c_void>();
    let speed_bps = match ioctl_ifreq(fd.as_raw_fd(), SIOCETHTOOL, &mut req) {
        Ok(()) => {
            let mbit = cmd.speed as u64 | ((cmd.speed_hi as u64) << 16);
            if mbit == 0 || mbit == 0xffff_ffff { 1_000_000_000 } else { mbit * 1_000_000 }
        }
        Err(err) => {
            debug!(ifname, ?err, "ethtool speed unavailable, assuming 1 Gbps");
            1_000_000_000
        }
    };

    Ok(IfInfo { index, speed_bps, is_lo })
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, opt: libc::c_int, val: &T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            ptr::from_ref(val).cast::<libc::c_void>(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

fn sockaddr_ll_for(ifindex: i32, protocol: u16, dst: Option<[u8; 6]>) -> libc::sockaddr_ll {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol.to_be();
    addr.sll_ifindex = ifindex;
    if let Some(dst) = dst {
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dst);
    }
    addr
}

/// One raw Rx socket per handler: promiscuous ETH_P_ALL with a 250 ms
/// receive timeout and nanosecond software receive timestamps.
///
/// Loopback is additionally flipped to promiscuous on the interface
/// itself, otherwise the stack drops our own frames and self-tests see
/// nothing.
pub fn create_rx_socket(ifname: &str, ifindex: i32, is_lo: bool) -> Result<OwnedFd> {
    let fd = unsafe {
        libc::socket(libc::AF_PACKET, libc::SOCK_RAW, (libc::ETH_P_ALL as u16).to_be() as i32)
    };
    if fd < 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let tv = libc::timeval { tv_sec: 0, tv_usec: RX_TIMEOUT_US as libc::suseconds_t };
    setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv)?;

    let enable: libc::c_int = 1;
    setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, &enable)?;

    let addr = sockaddr_ll_for(ifindex, libc::ETH_P_ALL as u16, None);
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            ptr::from_ref(&addr).cast::<libc::sockaddr>(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }

    add_promisc_membership(fd.as_raw_fd(), ifindex)?;

    if is_lo {
        if let Err(err) = set_iface_promisc(fd.as_raw_fd(), ifname) {
            warn!(?err, "couldn't place lo in promiscuous mode, self-tests may see no frames");
        }
    }

    Ok(fd)
}

pub fn add_promisc_membership(fd: RawFd, ifindex: i32) -> Result<()> {
    let mut mreq: libc::packet_mreq = unsafe { mem::zeroed() };
    mreq.mr_ifindex = ifindex;
    mreq.mr_type = libc::PACKET_MR_PROMISC as u16;
    mreq.mr_alen = 6;
    setsockopt(fd, libc::SOL_PACKET, libc::PACKET_ADD_MEMBERSHIP, &mreq)?;
    Ok(())
}

fn set_iface_promisc(fd: RawFd, ifname: &str) -> io::Result<()> {
    let mut req = Ifreq::for_interface(ifname);
    ioctl_ifreq(fd, libc::SIOCGIFFLAGS, &mut req)?;
    unsafe { req.ifru.flags |= libc::IFF_PROMISC as libc::c_short };
    ioctl_ifreq(fd, libc::SIOCSIFFLAGS, &mut req)
}

/// Per-channel Tx socket: ETH_P_TSN datagrams steered by SO_PRIORITY,
/// with launch-time transmission on CLOCK_TAI. Deadline mode asks the
/// Qdisc to send no later than the launch time; errors are reported on
/// the socket error queue.
pub fn create_tx_socket(ifindex: i32, dst: [u8; 6], prio: u8) -> Result<(OwnedFd, libc::sockaddr_ll)> {
    let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_DGRAM, ETH_P_TSN.to_be() as i32) };
    if fd < 0 {
        return Err(Error::Socket(io::Error::last_os_error()));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let prio = prio as libc::c_int;
    setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_PRIORITY, &prio)?;

    let txtime = libc::sock_txtime {
        clockid: libc::CLOCK_TAI,
        flags: libc::SOF_TXTIME_REPORT_ERRORS | libc::SOF_TXTIME_DEADLINE_MODE,
    };
    setsockopt(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_TXTIME, &txtime)?;

    let addr = sockaddr_ll_for(ifindex, ETH_P_TSN, Some(dst));
    Ok((fd, addr))
}

/// Send one PDU with a launch-time control message (SCM_TXTIME, 64-bit
/// TAI ns).
pub fn send_at(fd: RawFd, addr: &libc::sockaddr_ll, frame: &[u8], launch: Nanos) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: frame.as_ptr().cast_mut().cast::<libc::c_void>(),
        iov_len: frame.len(),
    };

    let mut control = [0u8; 64];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = ptr::from_ref(addr).cast_mut().cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = unsafe { libc::CMSG_SPACE(8) } as usize;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_TXTIME;
        (*cmsg).cmsg_len = libc::CMSG_LEN(8) as usize;
        ptr::copy_nonoverlapping(launch.0.to_ne_bytes().as_ptr(), libc::CMSG_DATA(cmsg), 8);
    }

    let sent = unsafe { libc::sendmsg(fd, &msg, 0) };
    if sent < 0 { Err(io::Error::last_os_error()) } else { Ok(sent as usize) }
}

/// One received frame with its software receive timestamp.
pub struct Received {
    pub len: usize,
    pub rx_hw_ns: Nanos,
    /// Looped-back copy of a frame this host transmitted; raw sockets
    /// see those too and receivers must skip them.
    pub outgoing: bool,
}

/// Blocking receive with the socket's 250 ms timeout; `Ok(None)` on
/// timeout so the caller can poll its running flag.
pub fn recv_frame(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<Received>> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut from: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut control = [0u8; 512];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = (&raw mut from).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, &raw mut msg, 0) };
    if n < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Ok(None)
            }
            _ => Err(err),
        };
    }
    if n == 0 {
        return Ok(None);
    }

    let mut rx_hw_ns = Nanos::ZERO;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SO_TIMESTAMPNS {
                let mut ts: libc::timespec = mem::zeroed();
                ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    (&raw mut ts).cast::<u8>(),
                    mem::size_of::<libc::timespec>(),
                );
                rx_hw_ns = Nanos(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(Some(Received {
        len: n as usize,
        rx_hw_ns,
        outgoing: from.sll_pkttype == PACKET_OUTGOING,
    }))
}

/// After a failed send, pull the specific launch-time rejection off
/// the error queue. `None` when the queue holds nothing relevant.
pub fn drain_error_queue(fd: RawFd) -> Option<SchedErrorKind> {
    let mut pfd = libc::pollfd { fd, events: 0, revents: 0 };
    let ready = unsafe { libc::poll(&raw mut pfd, 1, 0) };
    if ready != 1 || pfd.revents & libc::POLLERR == 0 {
        return None;
    }

    let mut buf = [0u8; 2048];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };
    let mut control = [0u8; 512];
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = control.len();

    let n = unsafe { libc::recvmsg(fd, &raw mut msg, libc::MSG_ERRQUEUE) };
    if n < 0 {
        return None;
    }

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let serr = libc::CMSG_DATA(cmsg).cast::<libc::sock_extended_err>();
            if (*serr).ee_origin == SO_EE_ORIGIN_TXTIME {
                let tstamp = ((*serr).ee_data as u64) << 32 | (*serr).ee_info as u64;
                let kind = match (*serr).ee_code {
                    SO_EE_CODE_TXTIME_INVALID_PARAM => SchedErrorKind::InvalidParam,
                    SO_EE_CODE_TXTIME_MISSED => SchedErrorKind::MissedDeadline,
                    code => SchedErrorKind::Other(code),
                };
                debug!(tstamp, ?kind, "launch-time frame dropped");
                return Some(kind);
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }
    None
}

/// An Rx socket error that cannot be retried; the Rx thread gives up
/// on these.
pub fn is_fatal_rx_error(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF | libc::ENETDOWN))
}

/// Fault in current and future pages so real-time paths never stall on
/// the pager.
pub fn lock_memory() -> io::Result<()> {
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc != 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Keeps /dev/cpu_dma_latency pinned at zero for the guard's lifetime,
/// holding the CPU out of deep C-states.
#[derive(Debug)]
pub struct DmaLatencyGuard {
    _file: std::fs::File,
}

pub fn pin_dma_latency() -> io::Result<DmaLatencyGuard> {
    let mut file = OpenOptions::new().read(true).write(true).open("/dev/cpu_dma_latency")?;
    file.write_all(&0i32.to_ne_bytes())?;
    Ok(DmaLatencyGuard { _file: file })
}
