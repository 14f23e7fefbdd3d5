//! Singleton wrapper behavior. One test function: the singleton is
//! process-wide state and the checks have to run in order.

use std::{sync::mpsc, thread, time::Duration};

use netchan::{ChannelAttrs, Error, Nanos, StreamClass, standalone};

static MANIFEST: &[ChannelAttrs] = &[
    ChannelAttrs {
        dst: [0x01, 0x00, 0x5E, 0x00, 0x00, 0x11],
        stream_id: 0x11,
        sc: StreamClass::B,
        size: 4,
        interval_ns: Nanos::from_millis(10),
        name: "ping",
    },
    ChannelAttrs {
        dst: [0x01, 0x00, 0x5E, 0x00, 0x00, 0x12],
        stream_id: 0x12,
        sc: StreamClass::B,
        size: 4,
        interval_ns: Nanos::from_millis(10),
        name: "pong",
    },
];

#[test]
fn singleton_lifecycle() {
    standalone::configure(|cfg| cfg.nic = "lo".to_string());

    if let Err(err) = standalone::init() {
        eprintln!("skipping standalone test (needs CAP_NET_RAW): {err}");
        return;
    }

    // Double init is refused while the handler runs.
    match standalone::init() {
        Err(Error::AlreadyInitialized) => {}
        other => panic!("expected AlreadyInitialized, got {other:?}"),
    }

    // Unknown manifest names are screened before any handler work.
    assert!(standalone::create_tx("nosuch", MANIFEST).is_err());

    let mut tx = standalone::create_tx("ping", MANIFEST).unwrap();
    let mut rx = standalone::create_rx("ping", MANIFEST).unwrap();

    tx.send_now(&[1, 2, 3, 4]).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 4];
        let res = rx.read(&mut buf).map(|_| buf);
        done_tx.send(res).unwrap();
    });
    let buf = done_rx.recv_timeout(Duration::from_secs(5)).expect("no frame within 5s").unwrap();
    assert_eq!(buf, [1, 2, 3, 4]);
    reader.join().unwrap();

    // Teardown is idempotent and live channels observe it.
    standalone::destroy();
    standalone::destroy();
    match tx.send_now(&[1, 2, 3, 4]) {
        Err(Error::ShuttingDown) => {}
        other => panic!("expected ShuttingDown, got {other:?}"),
    }
}
