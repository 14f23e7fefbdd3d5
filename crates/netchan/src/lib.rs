//! Deterministic network channels over AVB/TSN Ethernet.
//!
//! A channel is a unidirectional, periodic stream of fixed-size
//! payloads identified by a 64-bit stream id and a destination MAC,
//! carried in AVTP frames with launch-time scheduled transmission and
//! class-bounded delivery (A: 2 ms, B: 50 ms, TAS: gated).
//!
//! The [`NetHandler`] owns the single per-process reception pipeline;
//! [`TxChannel`]/[`RxChannel`] carry per-stream state. The
//! [`standalone`] module wraps one process-wide handler for manifest
//! driven clients.

use std::io;

use thiserror::Error;

mod attrs;
mod channel;
mod config;
mod frame;
mod handler;
mod socket;
pub mod standalone;
mod trace;

pub use attrs::{
    ChannelAttrs, DEFAULT_MCAST, MAX_INTERVAL, MAX_PAYLOAD, MIN_INTERVAL, StreamClass,
    attrs_by_name,
};
pub use channel::{RxChannel, TxChannel, TxPipe};
pub use config::Config;
pub use frame::{AVTP_SUBTYPE, AvtpHeader, ETH_P_TSN, HDR_LEN};
pub use handler::NetHandler;
pub use netchan_srp::{SrpClient, SrpConfig, SrpError};
pub use netchan_timing::{ClockId, Nanos, PeriodicTimer, tai_now, tai_to_avtp32};

/// Launch-time Qdisc rejection reasons, recovered from the socket
/// error queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedErrorKind {
    /// Launch time malformed or out of the Qdisc's window.
    InvalidParam,
    /// Deadline passed before the frame reached the wire.
    MissedDeadline,
    Other(u8),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid channel attributes: {0}")]
    InvalidAttribute(String),
    #[error("interface not usable: {0}")]
    InvalidInterface(String),
    /// Non-socket resource acquisition failed: a thread could not be
    /// spawned, a log file could not be created.
    #[error("out of resources: {0}")]
    OutOfResources(io::Error),
    #[error("socket: {0}")]
    Socket(#[from] io::Error),
    #[error("launch-time qdisc dropped frame: {0:?}")]
    Sched(SchedErrorKind),
    #[error("stream id {0:#x} already registered")]
    DuplicateStream(u64),
    #[error("callback table full")]
    TableFull,
    #[error("no channel for stream id {0:#x}")]
    NoRoute(u64),
    #[error("channel not ready")]
    NotReady,
    #[error("rate gated, {0} until the next tx slot")]
    RateGated(Nanos),
    #[error("end-to-end delay {delta_us} us crossed the break threshold")]
    LatencyViolation { delta_us: u64 },
    #[error("shutting down")]
    ShuttingDown,
    #[error("standalone handler already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Srp(#[from] SrpError),
}

pub type Result<T> = std::result::Result<T, Error>;
