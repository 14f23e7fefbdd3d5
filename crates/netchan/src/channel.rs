//! Per-stream channel state.
//!
//! A channel is either Tx or Rx, never both; the two sides share the
//! attribute screening and the serialised PDU layout but nothing else.
//! Tx owns a launch-time socket and the rate gate, Rx owns the read
//! end of the pipe the handler's callback writes into.

use std::{
    io::{self, Read, Write},
    os::fd::AsRawFd,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use netchan_log::{StreamRecord, WakeRecord};
use netchan_timing::{Nanos, delay_until, sleep_tai_until, tai_now, tai_to_avtp32};
use tracing::{debug, info, warn};

use crate::{
    Error, Result, SchedErrorKind,
    attrs::ChannelAttrs,
    frame::{AvtpHeader, HDR_LEN},
    handler::HandlerShared,
    socket,
};

/// Metadata prefix of every sample crossing the Rx pipe. Native byte
/// order, in-process only.
pub(crate) const PIPE_META_LEN: usize = 20;

#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PipeMeta {
    pub rx_hw_ns: Nanos,
    pub recv_ptp_ns: Nanos,
    pub avtp_timestamp: u32,
}

impl PipeMeta {
    pub(crate) fn write_to(self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.rx_hw_ns.0.to_ne_bytes());
        buf[8..16].copy_from_slice(&self.recv_ptp_ns.0.to_ne_bytes());
        buf[16..20].copy_from_slice(&self.avtp_timestamp.to_ne_bytes());
    }

    pub(crate) fn read_from(buf: &[u8]) -> Self {
        Self {
            rx_hw_ns: Nanos(u64::from_ne_bytes(buf[0..8].try_into().unwrap())),
            recv_ptp_ns: Nanos(u64::from_ne_bytes(buf[8..16].try_into().unwrap())),
            avtp_timestamp: u32::from_ne_bytes(buf[16..20].try_into().unwrap()),
        }
    }
}

/// Reconstruct the sender's 64-bit capture time from the 32-bit AVTP
/// timestamp and the receive-side PTP reading.
///
/// Exact whenever capture and receive are less than 2^31 ns (~2.1 s)
/// apart; the 32-bit subtraction wraps the way the timestamp does.
pub(crate) fn reconstruct_capture(meta: &PipeMeta) -> (Nanos, Nanos) {
    let recv_low = tai_to_avtp32(meta.recv_ptp_ns);
    let delta = Nanos(recv_low.wrapping_sub(meta.avtp_timestamp) as u64);
    (meta.recv_ptp_ns.saturating_sub(delta), delta)
}

/// Iterate the delay engine towards `target` until |wake error| drops
/// under 50 us.
///
/// A late wake cannot be improved by sleeping again (the target is
/// behind us), so the loop also stops as soon as an iteration fails to
/// shrink the error.
fn converge_on(shared: &HandlerShared, target: Nanos) -> Result<()> {
    let mut prev_abs = u64::MAX;
    loop {
        let wake = delay_until(shared.ptp.as_ref(), target)?;
        if shared.log_delay {
            if let Some(logger) = &shared.logger {
                logger.append_wake(WakeRecord {
                    ptp_target: wake.ptp_target,
                    cpu_target: wake.cpu_target,
                    cpu_actual: wake.cpu_actual,
                });
            }
        }
        if let Some(tb) = &shared.trace {
            tb.tag(&format!(
                "delay wake, target={}, actual={}, error={} ({})",
                wake.ptp_target.0,
                wake.cpu_actual.0,
                wake.error_ns,
                if wake.error_ns < 0 { "late" } else { "early" }
            ));
        }

        let abs = wake.error_ns.unsigned_abs();
        if abs <= 50_000 || abs >= prev_abs {
            return Ok(());
        }
        prev_abs = abs;
    }
}

/// Outgoing channel: serialised PDU staging plus its own launch-time
/// socket.
pub struct TxChannel {
    shared: Arc<HandlerShared>,
    attrs: ChannelAttrs,
    hdr: AvtpHeader,
    /// Header + payload staging, rewritten in place per send.
    frame: Vec<u8>,
    sock: std::os::fd::OwnedFd,
    addr: libc::sockaddr_ll,
    /// Earliest TAI time the next frame may leave. Monotone
    /// non-decreasing across successful sends.
    next_tx_ns: Nanos,
    last_sched_err: Option<SchedErrorKind>,
    ready: bool,
}

impl TxChannel {
    pub(crate) fn create(shared: Arc<HandlerShared>, attrs: &ChannelAttrs) -> Result<Self> {
        shared.check_running()?;
        attrs.validate(shared.ifinfo.speed_bps)?;
        shared.claim_tx_id(attrs.stream_id)?;

        let prio = shared.tx_prio_for(attrs.sc);
        let (sock, addr) = match socket::create_tx_socket(shared.ifinfo.index, attrs.dst, prio) {
            Ok(v) => v,
            Err(err) => {
                shared.release_tx_id(attrs.stream_id);
                return Err(err);
            }
        };

        let mut chan = Self {
            hdr: AvtpHeader::new(attrs.stream_id),
            frame: vec![0u8; attrs.pdu_size()],
            sock,
            addr,
            next_tx_ns: Nanos::ZERO,
            last_sched_err: None,
            ready: false,
            attrs: *attrs,
            shared,
        };

        if let Some(srp) = chan.shared.srp() {
            // Reserve bandwidth, then hold the channel back until a
            // listener acknowledges.
            let wire = (attrs.pdu_size() + 22) as u32;
            let class_a = attrs.sc == crate::StreamClass::A;
            srp.advertise(attrs.stream_id, attrs.dst, wire, class_a)
                .and_then(|()| srp.await_listener(attrs.stream_id))?;
        }

        chan.ready = true;
        chan.shared.tx_registered();
        info!(stream_id = attrs.stream_id, name = attrs.name, "tx channel ready");
        Ok(chan)
    }

    pub fn attrs(&self) -> &ChannelAttrs {
        &self.attrs
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Frame the next sample: pre-increment the sequence number, stamp
    /// the AVTP timestamp and copy the payload into the staging PDU.
    pub fn update(&mut self, ts_avtp: u32, data: &[u8]) -> Result<()> {
        if data.len() != self.attrs.size as usize {
            return Err(Error::InvalidAttribute(format!(
                "payload is {} bytes, channel carries {}",
                data.len(),
                self.attrs.size
            )));
        }
        self.hdr.seqnr = self.hdr.seqnr.wrapping_add(1);
        self.hdr.tv = true;
        self.hdr.avtp_timestamp = ts_avtp;
        self.hdr.sdl = self.attrs.size;
        self.frame[..HDR_LEN].copy_from_slice(&self.hdr.pack());
        self.frame[HDR_LEN..].copy_from_slice(data);
        Ok(())
    }

    /// Transmit the currently framed PDU at `*launch_ns` (TAI).
    ///
    /// A launch time before the channel's next tx slot blocks until
    /// the slot opens; one in the past is clamped to now. The
    /// effective launch time is written back.
    pub fn send(&mut self, launch_ns: &mut Nanos) -> Result<usize> {
        self.shared.check_running()?;
        if !self.ready {
            return Err(Error::NotReady);
        }

        if *launch_ns < self.next_tx_ns {
            sleep_tai_until(self.next_tx_ns)?;
            *launch_ns = self.next_tx_ns;
        }
        let now = tai_now();
        if *launch_ns < now {
            *launch_ns = now;
        }

        let sent = socket::send_at(self.sock.as_raw_fd(), &self.addr, &self.frame, *launch_ns)
            .map_err(|err| match socket::drain_error_queue(self.sock.as_raw_fd()) {
                Some(kind) => Error::Sched(kind),
                None => Error::Socket(err),
            })?;

        // Deadline-mode rejections surface asynchronously; pick them
        // up so the caller can observe them without a failed send.
        if let Some(kind) = socket::drain_error_queue(self.sock.as_raw_fd()) {
            self.last_sched_err = Some(kind);
        }

        self.next_tx_ns = self.next_tx_ns.max(*launch_ns) + self.attrs.interval_ns;
        Ok(sent)
    }

    /// Non-blocking variant: fails with [`Error::RateGated`] instead
    /// of sleeping when the budget is not yet replenished.
    pub fn try_send(&mut self, launch_ns: &mut Nanos) -> Result<usize> {
        let now = tai_now();
        if now < self.next_tx_ns {
            return Err(Error::RateGated(self.next_tx_ns - now));
        }
        self.send(launch_ns)
    }

    fn send_now_inner(&mut self, data: &[u8], wait_class_delay: bool) -> Result<usize> {
        let t_cap = self.shared.ptp_now();
        self.update(tai_to_avtp32(t_cap), data)?;

        let mut launch = t_cap;
        let sent = self.send(&mut launch)?;

        if let Some(logger) = &self.shared.logger {
            logger.append_stream(StreamRecord::tx(
                self.attrs.stream_id,
                self.attrs.size,
                self.hdr.seqnr,
                self.hdr.avtp_timestamp as u64,
                t_cap,
                t_cap,
                launch,
            ));
        }
        if self.shared.verbose() {
            info!(stream_id = self.attrs.stream_id, capture_ns = t_cap.0, "sample sent");
        }

        if wait_class_delay {
            converge_on(&self.shared, t_cap + self.attrs.sc.delay_bound())?;
        }
        Ok(sent)
    }

    /// Capture the PTP time, frame `data` and send immediately
    /// (subject to the rate gate).
    pub fn send_now(&mut self, data: &[u8]) -> Result<usize> {
        self.send_now_inner(data, false)
    }

    /// As [`send_now`], then sleep until capture time plus the class
    /// delivery bound, synchronising talker and listeners.
    ///
    /// [`send_now`]: TxChannel::send_now
    pub fn send_now_wait(&mut self, data: &[u8]) -> Result<usize> {
        self.send_now_inner(data, true)
    }

    /// Time left until the rate gate opens; zero when ready, `MAX`
    /// when the channel is unusable.
    pub fn time_to_tx(&self) -> Nanos {
        if !self.ready || !self.shared.is_running() {
            return Nanos::MAX;
        }
        let now = tai_now();
        if now >= self.next_tx_ns { Nanos::ZERO } else { self.next_tx_ns - now }
    }

    /// Sleep until roughly 100 us before the next tx slot. The
    /// launch-time Qdisc rejects deadlines too close to now, so waking
    /// exactly on the slot would be self-defeating.
    pub fn wait_for_tx_slot(&self) -> Result<()> {
        self.shared.check_running()?;
        let target = self.next_tx_ns.saturating_sub(Nanos::from_micros(100));
        if tai_now() < target {
            sleep_tai_until(target)?;
        }
        Ok(())
    }

    /// Most recent asynchronous launch-time rejection, if any.
    pub fn sched_error(&mut self) -> Option<SchedErrorKind> {
        if let Some(kind) = socket::drain_error_queue(self.sock.as_raw_fd()) {
            self.last_sched_err = Some(kind);
        }
        self.last_sched_err.take()
    }

    /// Earliest TAI time the next frame may leave.
    pub fn next_tx_ns(&self) -> Nanos {
        self.next_tx_ns
    }

    /// Sequence number of the most recently framed PDU.
    pub fn seqnr(&self) -> u8 {
        self.hdr.seqnr
    }

    /// Diagnostic snapshot of the channel internals.
    pub fn dump_state(&self) {
        info!(
            stream_id = self.attrs.stream_id,
            name = self.attrs.name,
            class = ?self.attrs.sc,
            size = self.attrs.size,
            interval_ns = self.attrs.interval_ns.0,
            seqnr = self.hdr.seqnr,
            next_tx_ns = self.next_tx_ns.0,
            ready = self.ready,
            "tx channel state"
        );
    }

    /// Hand the channel to a worker thread fed through an OS pipe:
    /// each payload-sized write becomes one `send_now`.
    pub fn into_pipe(self) -> Result<TxPipe> {
        let (reader, writer) = io::pipe()?;
        let stop = Arc::new(AtomicBool::new(false));
        let size = self.attrs.size as usize;
        let name = format!("netchan-tx-{}", self.attrs.stream_id);
        let worker_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || tx_worker(self, reader, &worker_stop))
            .map_err(Error::OutOfResources)?;
        Ok(TxPipe { writer, stop, size, handle: Some(handle) })
    }
}

impl Drop for TxChannel {
    fn drop(&mut self) {
        if let Some(srp) = self.shared.srp() {
            let wire = (self.attrs.pdu_size() + 22) as u32;
            let class_a = self.attrs.sc == crate::StreamClass::A;
            if let Err(err) = srp.unadvertise(self.attrs.stream_id, self.attrs.dst, wire, class_a)
            {
                debug!(?err, "unadvertise on drop failed");
            }
        }
        if self.ready {
            self.shared.tx_deregistered();
        }
        self.shared.release_tx_id(self.attrs.stream_id);
    }
}

fn tx_worker(mut chan: TxChannel, mut reader: io::PipeReader, stop: &AtomicBool) {
    let mut buf = vec![0u8; chan.attrs.size as usize];
    loop {
        if reader.read_exact(&mut buf).is_err() {
            break;
        }
        if stop.load(Ordering::Acquire) || !chan.shared.is_running() {
            break;
        }
        match chan.send_now(&buf) {
            Ok(_) => {}
            Err(Error::ShuttingDown) => break,
            Err(err) => debug!(?err, "tx worker send failed"),
        }
    }
}

/// Write side of a pipe-driven Tx channel (see [`TxChannel::into_pipe`]).
///
/// Dropping it wakes a worker blocked on the pipe with one zero-filled
/// payload, then joins the thread.
pub struct TxPipe {
    writer: io::PipeWriter,
    stop: Arc<AtomicBool>,
    size: usize,
    handle: Option<thread::JoinHandle<()>>,
}

impl TxPipe {
    pub fn write_sample(&mut self, data: &[u8]) -> io::Result<()> {
        if data.len() != self.size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload is {} bytes, channel carries {}", data.len(), self.size),
            ));
        }
        self.writer.write_all(data)
    }
}

impl Drop for TxPipe {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        let dummy = vec![0u8; self.size];
        let _ = self.writer.write_all(&dummy);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Incoming channel: the read end of the pipe the handler's standard
/// callback feeds.
pub struct RxChannel {
    shared: Arc<HandlerShared>,
    attrs: ChannelAttrs,
    reader: io::PipeReader,
    /// One meta + payload tuple, reused per read.
    staging: Vec<u8>,
    last_capture: Nanos,
    ready: bool,
}

impl RxChannel {
    pub(crate) fn create(shared: Arc<HandlerShared>, attrs: &ChannelAttrs) -> Result<Self> {
        shared.check_running()?;
        attrs.validate(shared.ifinfo.speed_bps)?;

        let (reader, writer) = io::pipe()?;
        shared.register_sink(attrs.stream_id, writer, attrs.size)?;

        if attrs.is_multicast() {
            if let Err(err) =
                socket::add_promisc_membership(shared.rx_sock.as_raw_fd(), shared.ifinfo.index)
            {
                warn!(?err, "multicast membership failed, may not receive frames");
            }
        }

        if let Some(srp) = shared.srp() {
            // Block until the talker shows up, then declare ready.
            let res = srp
                .await_talker(attrs.stream_id)
                .and_then(|_mac| srp.send_ready(attrs.stream_id));
            if let Err(err) = res {
                shared.remove_sink(attrs.stream_id);
                return Err(err.into());
            }
        }

        let chan = Self {
            staging: vec![0u8; PIPE_META_LEN + attrs.size as usize],
            reader,
            last_capture: Nanos::ZERO,
            ready: true,
            attrs: *attrs,
            shared,
        };
        chan.shared.rx_registered();
        info!(stream_id = attrs.stream_id, name = attrs.name, "rx channel ready");
        Ok(chan)
    }

    pub fn attrs(&self) -> &ChannelAttrs {
        &self.attrs
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Blocking read of one sample into `buf` (first `size` bytes).
    /// Returns the payload length.
    ///
    /// Reconstructs the sender's capture time from the sample's
    /// timestamps; crossing the configured break threshold reports a
    /// latency violation and shuts the handler down.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.shared.check_running()?;
        if !self.ready {
            return Err(Error::NotReady);
        }

        self.reader.read_exact(&mut self.staging)?;
        let meta = PipeMeta::read_from(&self.staging);
        let (capture, delta) = reconstruct_capture(&meta);
        self.last_capture = capture;

        let n = buf.len().min(self.attrs.size as usize);
        buf[..n].copy_from_slice(&self.staging[PIPE_META_LEN..PIPE_META_LEN + n]);

        if let Some(limit) = self.shared.break_us {
            let delta_us = delta.as_micros();
            if delta_us > limit {
                warn!(
                    stream_id = self.attrs.stream_id,
                    delta_us, limit, "end-to-end delay crossed break threshold, shutting down"
                );
                if let Some(tb) = &self.shared.trace {
                    tb.tag(&format!("E2E delay ({delta_us} us) exceeded break value ({limit})"));
                }
                self.shared.initiate_shutdown();
                return Err(Error::LatencyViolation { delta_us });
            }
        }

        if self.shared.verbose() {
            info!(
                stream_id = self.attrs.stream_id,
                delta_ns = delta.0,
                capture_ns = capture.0,
                "sample read"
            );
        }

        Ok(n)
    }

    /// As [`read`], then sleep until the reconstructed capture time
    /// plus the class delivery bound. Presentation-time semantics for
    /// synchronised listeners; undefined on loopback where PTP reads
    /// zero.
    ///
    /// [`read`]: RxChannel::read
    pub fn read_wait(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read(buf)?;
        converge_on(&self.shared, self.last_capture + self.attrs.sc.delay_bound())?;
        Ok(n)
    }

    /// Capture time reconstructed from the most recent [`read`].
    ///
    /// [`read`]: RxChannel::read
    pub fn last_capture_ptp(&self) -> Nanos {
        self.last_capture
    }

    /// Diagnostic snapshot of the channel internals.
    pub fn dump_state(&self) {
        info!(
            stream_id = self.attrs.stream_id,
            name = self.attrs.name,
            class = ?self.attrs.sc,
            size = self.attrs.size,
            interval_ns = self.attrs.interval_ns.0,
            last_capture_ns = self.last_capture.0,
            ready = self.ready,
            "rx channel state"
        );
    }
}

impl Drop for RxChannel {
    fn drop(&mut self) {
        if let Some(srp) = self.shared.srp() {
            if let Err(err) = srp.send_leave(self.attrs.stream_id) {
                debug!(?err, "listener leave on drop failed");
            }
        }
        self.shared.remove_sink(self.attrs.stream_id);
        if self.ready {
            self.shared.rx_deregistered();
        }
    }
}
