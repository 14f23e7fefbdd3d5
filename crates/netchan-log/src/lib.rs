//! Preallocated timing log for deterministic channels.
//!
//! Appends go to in-memory rings so the hot path never touches the
//! filesystem; a full ring flushes to rotated CSV files. Buffers are
//! zero-filled up front so every page is faulted in before real-time
//! operation starts (the process is expected to mlockall()).

use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use netchan_timing::Nanos;
use thiserror::Error;
use tracing::{debug, info};

/// 6 hours of a single 50 Hz stream. Multiple streams share the ring,
/// shortening the logged window accordingly.
pub const DEFAULT_CAPACITY: usize = 50 * 3600 * 6;

#[derive(Error, Debug)]
pub enum LogError {
    #[error("empty log path")]
    EmptyPath,
    #[error("log io: {0}")]
    Io(#[from] io::Error),
}

/// One Tx or Rx observation. Tx rows leave the rx side zero and vice
/// versa, mirroring the CSV columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamRecord {
    pub stream_id: u64,
    pub sz: u16,
    pub seqnr: u8,
    pub avtp_ns: u64,
    pub cap_ptp_ns: Nanos,
    pub send_ptp_ns: Nanos,
    pub tx_ns: Nanos,
    pub rx_ns: Nanos,
    pub recv_ptp_ns: Nanos,
}

impl StreamRecord {
    pub fn tx(
        stream_id: u64,
        sz: u16,
        seqnr: u8,
        avtp_ns: u64,
        cap_ptp_ns: Nanos,
        send_ptp_ns: Nanos,
        tx_ns: Nanos,
    ) -> Self {
        Self { stream_id, sz, seqnr, avtp_ns, cap_ptp_ns, send_ptp_ns, tx_ns, ..Default::default() }
    }

    pub fn rx(
        stream_id: u64,
        sz: u16,
        seqnr: u8,
        avtp_ns: u64,
        rx_ns: Nanos,
        recv_ptp_ns: Nanos,
    ) -> Self {
        Self { stream_id, sz, seqnr, avtp_ns, rx_ns, recv_ptp_ns, ..Default::default() }
    }
}

/// One measured wake-up, produced by the delay engine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WakeRecord {
    pub ptp_target: Nanos,
    pub cpu_target: Nanos,
    pub cpu_actual: Nanos,
}

struct Inner {
    base: PathBuf,
    flush_ctr: u32,
    capacity: usize,
    stream: Vec<StreamRecord>,
    wake: Vec<WakeRecord>,
}

/// Shared logger, one per NetHandler. Appends and flushes serialise on
/// a single mutex; contention is bounded since appends are rare (one
/// per frame) and flushes rarer still.
pub struct Logger {
    inner: Mutex<Inner>,
}

impl Logger {
    pub fn create(base: impl Into<PathBuf>) -> Result<Self, LogError> {
        Self::with_capacity(base, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(base: impl Into<PathBuf>, capacity: usize) -> Result<Self, LogError> {
        let base = base.into();
        if base.as_os_str().is_empty() {
            return Err(LogError::EmptyPath);
        }

        // Page the rings in now, not on the first append.
        let mut stream = vec![StreamRecord::default(); capacity];
        let mut wake = vec![WakeRecord::default(); capacity];
        stream.clear();
        wake.clear();

        info!(base = %base.display(), capacity, "timing log ready");
        Ok(Self { inner: Mutex::new(Inner { base, flush_ctr: 0, capacity, stream, wake }) })
    }

    /// Append a Tx/Rx record; flushes and rotates when the ring is full.
    pub fn append_stream(&self, rec: StreamRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.stream.len() == inner.capacity {
            inner.flush_and_rotate();
        }
        inner.stream.push(rec);
    }

    /// Append a wake-delay record; flushes and rotates when full.
    pub fn append_wake(&self, rec: WakeRecord) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.wake.len() == inner.capacity {
            inner.flush_and_rotate();
        }
        inner.wake.push(rec);
    }

    /// Drop buffered entries without writing them out.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.stream.clear();
        inner.wake.clear();
    }

    /// Write both rings to `<base>-<n>.csv` / `<base>_d-<n>.csv` and
    /// advance the rotation counter. Empty rings produce no file.
    pub fn flush_and_rotate(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.flush_and_rotate();
    }

    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        (inner.stream.len(), inner.wake.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == (0, 0)
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush_and_rotate();
    }
}

impl Inner {
    fn rotated(&self, suffix: &str) -> PathBuf {
        let mut name = self.base.as_os_str().to_os_string();
        name.push(format!("{suffix}-{}.csv", self.flush_ctr));
        PathBuf::from(name)
    }

    fn flush_and_rotate(&mut self) {
        if !self.stream.is_empty() {
            if let Err(err) = flush_stream(&self.rotated(""), &self.stream) {
                debug!(?err, "stream log flush failed");
            }
        }
        if !self.wake.is_empty() {
            if let Err(err) = flush_wake(&self.rotated("_d"), &self.wake) {
                debug!(?err, "wake-delay log flush failed");
            }
        }
        self.flush_ctr += 1;
        self.stream.clear();
        self.wake.clear();
    }
}

fn flush_stream(path: &Path, records: &[StreamRecord]) -> io::Result<()> {
    let mut fp = BufWriter::new(File::create(path)?);
    writeln!(fp, "stream_id,sz,seqnr,avtp_ns,cap_ptp_ns,send_ptp_ns,tx_ns,rx_ns,recv_ptp_ns")?;
    for r in records {
        writeln!(
            fp,
            "{},{},{},{},{},{},{},{},{}",
            r.stream_id,
            r.sz,
            r.seqnr,
            r.avtp_ns,
            r.cap_ptp_ns.0,
            r.send_ptp_ns.0,
            r.tx_ns.0,
            r.rx_ns.0,
            r.recv_ptp_ns.0
        )?;
    }
    fp.flush()?;
    info!(path = %path.display(), entries = records.len(), "wrote stream log");
    Ok(())
}

fn flush_wake(path: &Path, records: &[WakeRecord]) -> io::Result<()> {
    let mut fp = BufWriter::new(File::create(path)?);
    writeln!(fp, "ptp_target,cpu_target,cpu_actual")?;
    for r in records {
        writeln!(fp, "{},{},{}", r.ptp_target.0, r.cpu_target.0, r.cpu_actual.0)?;
    }
    fp.flush()?;
    info!(path = %path.display(), entries = records.len(), "wrote wake-delay log");
    Ok(())
}
