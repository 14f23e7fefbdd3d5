//! The per-process reception pipeline and channel registry.
//!
//! One raw socket, one Rx thread. Incoming frames are demultiplexed
//! through an open-addressing callback table keyed by stream id; each
//! hit writes one `meta + payload` tuple into the owning channel's
//! pipe (atomic for sizes up to PIPE_BUF).

use std::{
    collections::HashSet,
    io::Write,
    os::fd::{AsRawFd, OwnedFd},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    thread,
};

use netchan_log::{LogError, Logger, StreamRecord};
use netchan_srp::{SrpClient, SrpConfig};
use netchan_timing::{Nanos, PtpClock, probe_phc, ptp_now_ns};
use tracing::{debug, info, warn};

use crate::{
    Config, Error, Result, StreamClass,
    attrs::ChannelAttrs,
    channel::{PIPE_META_LEN, PipeMeta, RxChannel, TxChannel},
    frame::{AvtpHeader, HDR_LEN, strip_ethernet},
    socket::{self, DmaLatencyGuard, IfInfo, RX_BUF_LEN},
    trace::TraceBuffer,
};

/// Standard per-stream Rx sink: the write end of the channel's pipe
/// plus a staging buffer reused for every frame.
pub(crate) struct RxSink {
    writer: std::io::PipeWriter,
    size: u16,
    staging: Vec<u8>,
}

impl RxSink {
    fn new(writer: std::io::PipeWriter, size: u16) -> Self {
        Self { writer, size, staging: vec![0u8; PIPE_META_LEN + size as usize] }
    }

    /// Attach metadata and hand the sample to the channel in one
    /// write. Short frames are zero-padded to the declared size.
    fn deliver(&mut self, meta: PipeMeta, payload: &[u8]) {
        meta.write_to(&mut self.staging[..PIPE_META_LEN]);
        let n = payload.len().min(self.size as usize);
        self.staging[PIPE_META_LEN..PIPE_META_LEN + n].copy_from_slice(&payload[..n]);
        self.staging[PIPE_META_LEN + n..].fill(0);

        match self.writer.write(&self.staging) {
            Ok(written) if written == self.staging.len() => {}
            Ok(written) => warn!(written, expected = self.staging.len(), "partial pipe write"),
            Err(err) => debug!(?err, "rx pipe write failed, listener gone?"),
        }
    }
}

struct Slot {
    stream_id: u64,
    sink: RxSink,
}

/// Open-addressing stream table: slot = id mod capacity, linear probe.
///
/// Entries are only removed when a channel is destroyed, so probing
/// never has to worry about tombstone rehash; lookups scan the full
/// probe sequence.
pub(crate) struct CallbackMap {
    slots: Vec<Option<Slot>>,
}

impl CallbackMap {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    fn insert(&mut self, stream_id: u64, sink: RxSink) -> Result<()> {
        let cap = self.slots.len();
        if cap == 0 {
            return Err(Error::TableFull);
        }
        // Scan the whole probe sequence before taking a hole: removals
        // leave gaps, and a duplicate may sit behind one.
        let mut idx = (stream_id % cap as u64) as usize;
        let mut free = None;
        for _ in 0..cap {
            match &self.slots[idx] {
                Some(slot) if slot.stream_id == stream_id => {
                    return Err(Error::DuplicateStream(stream_id));
                }
                Some(_) => {}
                None => free = free.or(Some(idx)),
            }
            idx = (idx + 1) % cap;
        }
        match free {
            Some(idx) => {
                self.slots[idx] = Some(Slot { stream_id, sink });
                Ok(())
            }
            None => Err(Error::TableFull),
        }
    }

    fn get_mut(&mut self, stream_id: u64) -> Option<&mut RxSink> {
        let cap = self.slots.len();
        if cap == 0 {
            return None;
        }
        let mut idx = (stream_id % cap as u64) as usize;
        for _ in 0..cap {
            if let Some(slot) = &self.slots[idx] {
                if slot.stream_id == stream_id {
                    return self.slots[idx].as_mut().map(|s| &mut s.sink);
                }
            }
            idx = (idx + 1) % cap;
        }
        None
    }

    fn remove(&mut self, stream_id: u64) {
        let cap = self.slots.len();
        if cap == 0 {
            return;
        }
        let mut idx = (stream_id % cap as u64) as usize;
        for _ in 0..cap {
            if self.slots[idx].as_ref().is_some_and(|s| s.stream_id == stream_id) {
                self.slots[idx] = None;
                return;
            }
            idx = (idx + 1) % cap;
        }
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
    }
}

/// State shared between the handler, its Rx thread and every channel.
pub(crate) struct HandlerShared {
    pub(crate) ifname: String,
    pub(crate) ifinfo: IfInfo,
    pub(crate) rx_sock: OwnedFd,
    pub(crate) running: AtomicBool,
    pub(crate) ptp: Option<PtpClock>,
    pub(crate) logger: Option<Logger>,
    srp: Mutex<Option<Arc<SrpClient>>>,
    pub(crate) trace: Option<TraceBuffer>,
    pub(crate) break_us: Option<u64>,
    pub(crate) log_delay: bool,
    verbose: AtomicBool,
    tx_prio: [AtomicU8; 3],
    callbacks: Mutex<CallbackMap>,
    tx_ids: Mutex<HashSet<u64>>,
    num_tx: AtomicUsize,
    num_rx: AtomicUsize,
}

impl HandlerShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn check_running(&self) -> Result<()> {
        if self.is_running() { Ok(()) } else { Err(Error::ShuttingDown) }
    }

    /// Flag every thread down. Actual joining happens on the owner's
    /// destroy path; the Rx thread observes this within one socket
    /// timeout, the SRP monitor within one poll interval.
    pub(crate) fn initiate_shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!(ifname = %self.ifname, "shutdown initiated");
        }
        if let Some(srp) = self.srp() {
            srp.shutdown();
        }
    }

    pub(crate) fn ptp_now(&self) -> Nanos {
        ptp_now_ns(self.ptp.as_ref())
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose.load(Ordering::Relaxed)
    }

    /// Snapshot of the SRP client; never hold the handler's lock
    /// across the client's blocking waits.
    pub(crate) fn srp(&self) -> Option<Arc<SrpClient>> {
        self.srp.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    pub(crate) fn tx_prio_for(&self, sc: StreamClass) -> u8 {
        // SRP domain priorities win over the configured defaults.
        if let Some(srp) = self.srp() {
            let domain = match sc {
                StreamClass::A | StreamClass::Tas => srp.domain_a(),
                StreamClass::B => srp.domain_b(),
            };
            if domain.valid {
                return domain.prio;
            }
        }
        let idx = match sc {
            StreamClass::A => 0,
            StreamClass::B => 1,
            StreamClass::Tas => 2,
        };
        self.tx_prio[idx].load(Ordering::Relaxed)
    }

    pub(crate) fn claim_tx_id(&self, stream_id: u64) -> Result<()> {
        if stream_id == 0 {
            return Err(Error::InvalidAttribute("stream id must not be zero".into()));
        }
        let mut ids = self.tx_ids.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !ids.insert(stream_id) {
            return Err(Error::DuplicateStream(stream_id));
        }
        Ok(())
    }

    pub(crate) fn release_tx_id(&self, stream_id: u64) {
        self.tx_ids
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&stream_id);
    }

    pub(crate) fn register_sink(
        &self,
        stream_id: u64,
        writer: std::io::PipeWriter,
        size: u16,
    ) -> Result<()> {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(stream_id, RxSink::new(writer, size))
    }

    pub(crate) fn remove_sink(&self, stream_id: u64) {
        self.callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(stream_id);
    }

    /// Route one parsed PDU to its channel. Unknown streams report
    /// [`Error::NoRoute`], which the Rx thread treats as routine.
    pub(crate) fn feed(
        &self,
        hdr: &AvtpHeader,
        payload: &[u8],
        rx_hw_ns: Nanos,
        recv_ptp_ns: Nanos,
    ) -> Result<()> {
        let mut callbacks =
            self.callbacks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(sink) = callbacks.get_mut(hdr.stream_id) else {
            return Err(Error::NoRoute(hdr.stream_id));
        };
        sink.deliver(
            PipeMeta { rx_hw_ns, recv_ptp_ns, avtp_timestamp: hdr.avtp_timestamp },
            payload,
        );
        if let Some(tb) = &self.trace {
            tb.tag(&format!("fed stream {:#x} seq {}", hdr.stream_id, hdr.seqnr));
        }
        Ok(())
    }

    pub(crate) fn tx_registered(&self) {
        self.num_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn tx_deregistered(&self) {
        self.num_tx.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_registered(&self) {
        self.num_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rx_deregistered(&self) {
        self.num_rx.fetch_sub(1, Ordering::Relaxed);
    }
}

fn log_error(err: LogError) -> Error {
    match err {
        LogError::EmptyPath => Error::InvalidAttribute("empty log path".into()),
        LogError::Io(io) => Error::OutOfResources(io),
    }
}

/// Full SRP bring-up: connect, block on domain discovery, register the
/// class A domain and join its VLAN.
fn connect_srp(port: u16, prio_a: u8, prio_b: u8) -> Result<SrpClient> {
    let client = SrpClient::new(SrpConfig { port, prio_a, prio_b })?;
    client.discover_domain()?;
    client.register_domain_a()?;
    client.join_vlan()?;
    Ok(client)
}

/// Owner of the reception pipeline: raw socket, Rx thread, callback
/// table, SRP client, logger and the PTP handle.
pub struct NetHandler {
    shared: Arc<HandlerShared>,
    rx_thread: Option<thread::JoinHandle<()>>,
    _dma: Option<DmaLatencyGuard>,
}

impl NetHandler {
    /// Bring the full pipeline up on the configured NIC and start the
    /// Rx thread. With SRP enabled this blocks on domain discovery.
    pub fn create(cfg: &Config) -> Result<Self> {
        let ifinfo = socket::if_info(&cfg.nic)?;
        let rx_sock = socket::create_rx_socket(&cfg.nic, ifinfo.index, ifinfo.is_lo)?;

        // Real-time hygiene, both best-effort: pages we touch must not
        // fault, CPUs should stay out of deep C-states.
        if let Err(err) = socket::lock_memory() {
            warn!(?err, "mlockall failed, page faults possible during operation");
        }
        let dma = if cfg.keep_cstate {
            None
        } else {
            match socket::pin_dma_latency() {
                Ok(guard) => Some(guard),
                Err(err) => {
                    warn!(?err, "couldn't pin /dev/cpu_dma_latency");
                    None
                }
            }
        };

        let logger = match &cfg.log_file {
            Some(path) => Some(Logger::create(path).map_err(log_error)?),
            None => None,
        };
        let ptp = if ifinfo.is_lo { None } else { probe_phc(&cfg.nic) };
        let trace = if cfg.ftrace { TraceBuffer::open() } else { None };

        let srp = if cfg.use_srp {
            Some(Arc::new(connect_srp(cfg.srp_port, cfg.tx_prio_a, cfg.tx_prio_b)?))
        } else {
            None
        };

        let shared = Arc::new(HandlerShared {
            ifname: cfg.nic.clone(),
            ifinfo,
            rx_sock,
            running: AtomicBool::new(true),
            ptp,
            logger,
            srp: Mutex::new(srp),
            trace,
            break_us: cfg.break_us,
            log_delay: cfg.log_delay,
            verbose: AtomicBool::new(cfg.verbose),
            tx_prio: [
                AtomicU8::new(cfg.tx_prio_a),
                AtomicU8::new(cfg.tx_prio_b),
                AtomicU8::new(cfg.tx_prio_tas),
            ],
            callbacks: Mutex::new(CallbackMap::new(cfg.hmap_size)),
            tx_ids: Mutex::new(HashSet::new()),
            num_tx: AtomicUsize::new(0),
            num_rx: AtomicUsize::new(0),
        });

        let rx_shared = Arc::clone(&shared);
        let rx_thread = thread::Builder::new()
            .name(format!("netchan-rx-{}", cfg.nic))
            .spawn(move || rx_loop(&rx_shared))
            .map_err(Error::OutOfResources)?;

        info!(
            ifname = %cfg.nic,
            ifidx = ifinfo.index,
            speed_bps = ifinfo.speed_bps,
            srp = cfg.use_srp,
            "nethandler up"
        );
        Ok(Self { shared, rx_thread: Some(rx_thread), _dma: dma })
    }

    /// Handler with defaults on the given interface; loopback for
    /// self-tests.
    pub fn on_interface(ifname: &str) -> Result<Self> {
        Self::create(&Config::for_nic(ifname))
    }

    pub fn create_tx(&self, attrs: &ChannelAttrs) -> Result<TxChannel> {
        TxChannel::create(Arc::clone(&self.shared), attrs)
    }

    pub fn create_rx(&self, attrs: &ChannelAttrs) -> Result<RxChannel> {
        RxChannel::create(Arc::clone(&self.shared), attrs)
    }

    /// Inject a PDU as if it had arrived from the wire; the normal
    /// path for fault injection and tests.
    pub fn feed_frame(&self, pdu: &[u8], rx_hw_ns: Nanos, recv_ptp_ns: Nanos) -> Result<()> {
        let hdr = AvtpHeader::unpack(pdu)
            .ok_or_else(|| Error::InvalidAttribute("malformed AVTP header".into()))?;
        self.shared.feed(&hdr, &pdu[HDR_LEN..], rx_hw_ns, recv_ptp_ns)
    }

    pub fn num_tx(&self) -> usize {
        self.shared.num_tx.load(Ordering::Relaxed)
    }

    pub fn num_rx(&self) -> usize {
        self.shared.num_rx.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> bool {
        self.shared.is_running()
    }

    pub fn set_verbose(&self, on: bool) {
        self.shared.verbose.store(on, Ordering::Relaxed);
    }

    /// Enable or disable SRP on a live handler. Enabling connects to
    /// the daemon and blocks on domain discovery; disabling tears the
    /// client down. Only channels created afterwards are affected.
    pub fn set_srp(&self, on: bool, port: u16) -> Result<()> {
        let current = self.shared.srp();
        match (on, current) {
            (true, Some(_)) | (false, None) => Ok(()),
            (true, None) => {
                let prio_a = self.shared.tx_prio[0].load(Ordering::Relaxed);
                let prio_b = self.shared.tx_prio[1].load(Ordering::Relaxed);
                let client = Arc::new(connect_srp(port, prio_a, prio_b)?);
                *self
                    .shared
                    .srp
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(client);
                Ok(())
            }
            (false, Some(client)) => {
                *self
                    .shared
                    .srp
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
                client.shutdown();
                Ok(())
            }
        }
    }

    /// Override the PCP used for new Tx sockets of `sc`. Existing
    /// channels keep their priority.
    pub fn set_tx_prio(&self, sc: StreamClass, prio: u8) {
        let idx = match sc {
            StreamClass::A => 0,
            StreamClass::B => 1,
            StreamClass::Tas => 2,
        };
        self.shared.tx_prio[idx].store(prio, Ordering::Relaxed);
    }

    pub fn ptp_now(&self) -> Nanos {
        self.shared.ptp_now()
    }

    /// Stop the pipeline: flag the threads down, join the Rx thread
    /// (bounded by the 250 ms socket timeout), flush the log.
    /// Idempotent; channels outliving the handler observe
    /// [`Error::ShuttingDown`].
    pub fn stop(&mut self) {
        self.shared.initiate_shutdown();
        if let Some(handle) = self.rx_thread.take() {
            let _ = handle.join();
        }
        // Readers blocked on their pipes get EOF once the sinks go.
        self.shared
            .callbacks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
        if let Some(logger) = &self.shared.logger {
            logger.flush_and_rotate();
        }
    }
}

impl Drop for NetHandler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Rx thread body: blocking receive with a 250 ms timeout, then
/// timestamp, demultiplex, log.
fn rx_loop(shared: &HandlerShared) {
    let fd = shared.rx_sock.as_raw_fd();
    let mut buf = [0u8; RX_BUF_LEN];

    while shared.is_running() {
        match socket::recv_frame(fd, &mut buf) {
            Ok(None) => {}
            Ok(Some(recv)) => {
                // PTP receive time first, everything else can wait.
                let recv_ptp_ns = shared.ptp_now();
                if recv.outgoing {
                    // Looped-back copy of our own transmission.
                    continue;
                }
                let Some(pdu) = strip_ethernet(&buf[..recv.len]) else {
                    continue;
                };
                let Some(hdr) = AvtpHeader::unpack(pdu) else {
                    continue;
                };

                match shared.feed(&hdr, &pdu[HDR_LEN..], recv.rx_hw_ns, recv_ptp_ns) {
                    Ok(()) | Err(Error::NoRoute(_)) => {}
                    Err(err) => debug!(?err, "rx dispatch failed"),
                }

                // Timestamps are all in hand, log after the hand-off.
                if let Some(logger) = &shared.logger {
                    logger.append_stream(StreamRecord::rx(
                        hdr.stream_id,
                        hdr.sdl,
                        hdr.seqnr,
                        hdr.avtp_timestamp as u64,
                        recv.rx_hw_ns,
                        recv_ptp_ns,
                    ));
                }
            }
            Err(err) if socket::is_fatal_rx_error(&err) => {
                warn!(?err, "rx socket unrecoverable, receiver thread exiting");
                return;
            }
            Err(err) => debug!(?err, "rx receive failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (RxSink, std::io::PipeReader) {
        let (reader, writer) = std::io::pipe().unwrap();
        (RxSink::new(writer, 8), reader)
    }

    #[test]
    fn table_accepts_colliding_ids_until_full() {
        let mut map = CallbackMap::new(4);
        // All of these hash to slot 1 with capacity 4.
        for sid in [1u64, 5, 9, 13] {
            map.insert(sid, sink().0).unwrap();
        }
        let err = map.insert(17, sink().0).unwrap_err();
        assert!(matches!(err, Error::TableFull));

        for sid in [1u64, 5, 9, 13] {
            assert!(map.get_mut(sid).is_some());
        }
        assert!(map.get_mut(17).is_none());
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut map = CallbackMap::new(4);
        map.insert(7, sink().0).unwrap();
        let err = map.insert(7, sink().0).unwrap_err();
        assert!(matches!(err, Error::DuplicateStream(7)));
    }

    #[test]
    fn removal_keeps_probe_chain_reachable() {
        let mut map = CallbackMap::new(4);
        map.insert(1, sink().0).unwrap();
        map.insert(5, sink().0).unwrap();
        map.remove(1);
        // 5 sits behind the hole left by 1; lookups scan the whole
        // probe sequence so it stays reachable.
        assert!(map.get_mut(5).is_some());
        assert!(map.get_mut(1).is_none());
    }

    #[test]
    fn reinsert_after_removal_cannot_duplicate() {
        let mut map = CallbackMap::new(4);
        map.insert(1, sink().0).unwrap();
        map.insert(5, sink().0).unwrap();
        map.remove(1);
        // 5 still lives behind the hole; the hole must not hide it.
        let err = map.insert(5, sink().0).unwrap_err();
        assert!(matches!(err, Error::DuplicateStream(5)));
        // A fresh id can take the hole.
        map.insert(9, sink().0).unwrap();
    }

    #[test]
    fn delivery_is_one_tuple_per_frame() {
        use std::io::Read;

        let (mut s, mut reader) = sink();
        s.deliver(
            PipeMeta { rx_hw_ns: Nanos(1), recv_ptp_ns: Nanos(2), avtp_timestamp: 3 },
            &[0xDE, 0xAD, 0xBE, 0xEF],
        );

        let mut tuple = [0u8; PIPE_META_LEN + 8];
        reader.read_exact(&mut tuple).unwrap();
        let meta = PipeMeta::read_from(&tuple);
        assert_eq!(meta.recv_ptp_ns, Nanos(2));
        // Short payload zero-padded to the declared size.
        assert_eq!(&tuple[PIPE_META_LEN..], &[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 0]);
    }
}
