//! Client for the stream reservation daemon (mrpd).
//!
//! One UDP socket to localhost carries the text protocol; a monitor
//! thread polls it and folds attribute events into shared state that
//! channel creation blocks on (domain discovery, awaiting a talker,
//! awaiting the first listener).

use std::{
    collections::HashMap,
    io,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use mio::{Events, Interest, Poll, Token};
use thiserror::Error;
use tracing::{debug, warn};

pub mod proto;

pub use proto::{DOMAIN_ID_CLASS_A, MSRP_LISTENER_ASKFAILED, SrpEvent};

/// mrpd control port on localhost.
pub const MRPD_PORT: u16 = 7500;

/// Monitor poll period; doubles as the cancellation latency bound for
/// every blocking wait in this crate.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const SOCK: Token = Token(0);

#[derive(Error, Debug)]
pub enum SrpError {
    #[error("srp io: {0}")]
    Io(#[from] io::Error),
    #[error("shutting down")]
    ShuttingDown,
}

#[derive(Clone, Copy, Debug)]
pub struct SrpConfig {
    pub port: u16,
    /// Fallback PCP priorities used until the daemon announces a domain.
    pub prio_a: u8,
    pub prio_b: u8,
}

impl Default for SrpConfig {
    fn default() -> Self {
        Self { port: MRPD_PORT, prio_a: 3, prio_b: 2 }
    }
}

/// One announced SRP domain (class A or B).
#[derive(Clone, Copy, Debug)]
pub struct DomainAttr {
    pub id: u8,
    pub prio: u8,
    pub vid: u16,
    pub valid: bool,
}

struct State {
    domain_a: DomainAttr,
    domain_b: DomainAttr,
    /// Talker advertises seen on the network: stream id to dst MAC.
    talkers_seen: HashMap<u64, [u8; 6]>,
    /// Acknowledged listeners per stream we advertise.
    listeners: HashMap<u64, usize>,
    shutting_down: bool,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

/// SRP/MRP client bound to one daemon.
///
/// Sends may come from any thread; the socket is only ever *read* by
/// the monitor thread.
pub struct SrpClient {
    sock: UdpSocket,
    daemon: SocketAddr,
    shared: Arc<Shared>,
    monitor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl SrpClient {
    /// Bind the control socket and start the monitor thread. Does not
    /// touch the daemon yet; call [`discover_domain`] next.
    ///
    /// [`discover_domain`]: SrpClient::discover_domain
    pub fn new(cfg: SrpConfig) -> Result<Self, SrpError> {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        let daemon = SocketAddr::from((Ipv4Addr::LOCALHOST, cfg.port));

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                domain_a: DomainAttr { id: DOMAIN_ID_CLASS_A, prio: cfg.prio_a, vid: 2, valid: false },
                domain_b: DomainAttr { id: 0, prio: cfg.prio_b, vid: 2, valid: false },
                talkers_seen: HashMap::new(),
                listeners: HashMap::new(),
                shutting_down: false,
            }),
            cv: Condvar::new(),
        });

        let monitor_sock = sock.try_clone()?;
        let monitor_shared = Arc::clone(&shared);
        let monitor = thread::Builder::new()
            .name("srp-monitor".into())
            .spawn(move || monitor_loop(monitor_sock, &monitor_shared))?;

        Ok(Self { sock, daemon, shared, monitor: Mutex::new(Some(monitor)) })
    }

    fn send(&self, msg: &str) -> Result<(), SrpError> {
        // mrpd expects the terminating NUL to be part of the datagram.
        let mut data = msg.as_bytes().to_vec();
        data.push(0);
        self.sock.send_to(&data, self.daemon)?;
        debug!(msg, "-> mrpd");
        Ok(())
    }

    /// Query the daemon and block until at least one of the class A/B
    /// domains is valid, or shutdown is initiated.
    pub fn discover_domain(&self) -> Result<(), SrpError> {
        self.send(&proto::query_domain())?;
        self.wait_on(|st| st.domain_a.valid || st.domain_b.valid)
    }

    pub fn domain_a(&self) -> DomainAttr {
        self.lock().domain_a
    }

    pub fn domain_b(&self) -> DomainAttr {
        self.lock().domain_b
    }

    pub fn join_vlan(&self) -> Result<(), SrpError> {
        let vid = self.lock().domain_a.vid;
        self.send(&proto::join_vlan(vid))
    }

    pub fn leave_vlan(&self) -> Result<(), SrpError> {
        let vid = self.lock().domain_a.vid;
        self.send(&proto::leave_vlan(vid))
    }

    pub fn register_domain_a(&self) -> Result<(), SrpError> {
        let d = self.lock().domain_a;
        self.send(&proto::register_domain(d.id, d.prio, d.vid))
    }

    pub fn unregister_domain_a(&self) -> Result<(), SrpError> {
        let d = self.lock().domain_a;
        self.send(&proto::unregister_domain(d.id, d.prio, d.vid))
    }

    /// Advertise one of our streams (talker declaration).
    pub fn advertise(
        &self,
        stream_id: u64,
        dst: [u8; 6],
        full_size: u32,
        class_a: bool,
    ) -> Result<(), SrpError> {
        let (vid, prio) = self.class_attrs(class_a);
        self.send(&proto::advertise_stream(stream_id, dst, vid, full_size, 1, prio, 3900))
    }

    pub fn unadvertise(
        &self,
        stream_id: u64,
        dst: [u8; 6],
        full_size: u32,
        class_a: bool,
    ) -> Result<(), SrpError> {
        let (vid, prio) = self.class_attrs(class_a);
        let res = self.send(&proto::unadvertise_stream(stream_id, dst, vid, full_size, 1, prio, 3900));
        self.lock().listeners.remove(&stream_id);
        res
    }

    fn class_attrs(&self, class_a: bool) -> (u16, u8) {
        let st = self.lock();
        if class_a { (st.domain_a.vid, st.domain_a.prio) } else { (st.domain_b.vid, st.domain_b.prio) }
    }

    /// Block until a talker advertise for `stream_id` is seen, then
    /// return the destination MAC it announced.
    pub fn await_talker(&self, stream_id: u64) -> Result<[u8; 6], SrpError> {
        self.wait_on(|st| st.talkers_seen.contains_key(&stream_id))?;
        Ok(self.lock().talkers_seen[&stream_id])
    }

    /// Declare listener-ready for an incoming stream.
    pub fn send_ready(&self, stream_id: u64) -> Result<(), SrpError> {
        self.send(&proto::listener_ready(stream_id))
    }

    /// Withdraw a listener declaration.
    pub fn send_leave(&self, stream_id: u64) -> Result<(), SrpError> {
        self.send(&proto::listener_leave(stream_id))
    }

    /// Block until at least one listener has acknowledged `stream_id`.
    pub fn await_listener(&self, stream_id: u64) -> Result<(), SrpError> {
        self.wait_on(|st| st.listeners.get(&stream_id).copied().unwrap_or(0) > 0)
    }

    pub fn listener_count(&self, stream_id: u64) -> usize {
        self.lock().listeners.get(&stream_id).copied().unwrap_or(0)
    }

    /// Unblock every waiter and stop the monitor. Safe to call more
    /// than once; subsequent waits fail with [`SrpError::ShuttingDown`].
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
        }
        self.shared.cv.notify_all();
        let handle = self
            .monitor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let _ = self.leave_vlan();
        let _ = self.unregister_domain_a();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Condvar wait with periodic wake so shutdown is observed within
    /// one poll interval even without a notification.
    fn wait_on(&self, pred: impl Fn(&State) -> bool) -> Result<(), SrpError> {
        let mut st = self.lock();
        loop {
            if st.shutting_down {
                return Err(SrpError::ShuttingDown);
            }
            if pred(&st) {
                return Ok(());
            }
            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(st, POLL_INTERVAL)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = guard;
        }
    }
}

impl Drop for SrpClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_event(st: &mut State, ev: SrpEvent) {
    match ev {
        SrpEvent::Domain { id, prio, vid } => {
            let d = if id == DOMAIN_ID_CLASS_A { &mut st.domain_a } else { &mut st.domain_b };
            d.id = id;
            d.prio = prio;
            d.vid = vid;
            d.valid = true;
        }
        SrpEvent::TalkerSeen { stream_id, dst } => {
            st.talkers_seen.insert(stream_id, dst);
        }
        SrpEvent::TalkerLeave { stream_id } => {
            st.talkers_seen.remove(&stream_id);
        }
        SrpEvent::ListenerJoin { stream_id, substate } => {
            if substate > MSRP_LISTENER_ASKFAILED {
                *st.listeners.entry(stream_id).or_insert(0) += 1;
            }
        }
        SrpEvent::ListenerLeave { stream_id } => {
            if let Some(n) = st.listeners.get_mut(&stream_id) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

fn monitor_loop(sock: UdpSocket, shared: &Shared) {
    sock.set_nonblocking(true).ok();
    let mut sock = mio::net::UdpSocket::from_std(sock);

    let Ok(mut poll) = Poll::new() else {
        warn!("srp monitor: no poll, giving up");
        return;
    };
    if let Err(err) = poll.registry().register(&mut sock, SOCK, Interest::READABLE) {
        warn!(?err, "srp monitor: register failed");
        return;
    }

    let mut events = Events::with_capacity(8);
    let mut buf = [0u8; 1522];

    loop {
        {
            let st = shared.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if st.shutting_down {
                return;
            }
        }

        if let Err(err) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(?err, "srp monitor: poll failed");
            return;
        }

        for _ev in events.iter() {
            // Drain everything that is ready; edge-triggered readiness
            // may coalesce datagrams.
            loop {
                match sock.recv_from(&mut buf) {
                    Ok((len, _from)) => {
                        let text = String::from_utf8_lossy(&buf[..len]);
                        debug!(msg = %text.trim_end_matches('\0'), "<- mrpd");
                        let parsed = proto::parse(&text);
                        if !parsed.is_empty() {
                            let mut st = shared
                                .state
                                .lock()
                                .unwrap_or_else(std::sync::PoisonError::into_inner);
                            for ev in parsed {
                                apply_event(&mut st, ev);
                            }
                            drop(st);
                            shared.cv.notify_all();
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        warn!(?err, "srp monitor: recv failed");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_daemon() -> (UdpSocket, u16) {
        let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[test]
    fn discovery_blocks_until_domain_reply() {
        let (daemon, port) = fake_daemon();
        daemon.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let responder = thread::spawn(move || {
            let mut buf = [0u8; 128];
            let (len, from) = daemon.recv_from(&mut buf).unwrap();
            assert!(buf[..len].starts_with(b"S??"));
            daemon.send_to(b"SJO D:C=6,P=3,V=0002\n", from).unwrap();
        });

        let client = SrpClient::new(SrpConfig { port, ..Default::default() }).unwrap();
        client.discover_domain().unwrap();
        responder.join().unwrap();

        let a = client.domain_a();
        assert!(a.valid);
        assert_eq!((a.id, a.prio, a.vid), (6, 3, 2));
        assert!(!client.domain_b().valid);
    }

    #[test]
    fn await_talker_returns_announced_mac() {
        let (daemon, port) = fake_daemon();
        let client = SrpClient::new(SrpConfig { port, ..Default::default() }).unwrap();
        let to = client.sock.local_addr().unwrap();

        daemon.send_to(b"SNE T:S=000000000000002A,A=01005E000001\n", to).unwrap();
        let mac = client.await_talker(0x2a).unwrap();
        assert_eq!(mac, [0x01, 0x00, 0x5E, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn listener_join_and_leave_track_count() {
        let (daemon, port) = fake_daemon();
        let client = SrpClient::new(SrpConfig { port, ..Default::default() }).unwrap();
        let to = client.sock.local_addr().unwrap();

        // Ask-failed must not count.
        daemon.send_to(b"SJO L:D=1,S=0000000000000007\n", to).unwrap();
        daemon.send_to(b"SJO L:D=2,S=0000000000000007\n", to).unwrap();
        client.await_listener(7).unwrap();
        assert_eq!(client.listener_count(7), 1);

        daemon.send_to(b"SLE L:D=3,S=0000000000000007\n", to).unwrap();
        // Leave is applied by the monitor; wait for it to drain.
        for _ in 0..50 {
            if client.listener_count(7) == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(client.listener_count(7), 0);
    }

    #[test]
    fn shutdown_unblocks_waiters() {
        let (_daemon, port) = fake_daemon();
        let client = Arc::new(SrpClient::new(SrpConfig { port, ..Default::default() }).unwrap());

        let waiter_client = Arc::clone(&client);
        let waiter = thread::spawn(move || {
            // Nothing ever announces stream 99, only shutdown can end
            // this wait.
            let err = waiter_client.await_talker(99).unwrap_err();
            assert!(matches!(err, SrpError::ShuttingDown));
        });

        thread::sleep(Duration::from_millis(50));
        client.shutdown();
        waiter.join().unwrap();
    }
}
