//! Self-tests against the loopback device.
//!
//! These need CAP_NET_RAW for the packet sockets; without it every
//! test prints a note and passes vacuously so unprivileged builds stay
//! green.

use std::{sync::mpsc, thread, time::Duration};

use netchan::{
    ChannelAttrs, Config, Error, Nanos, NetHandler, StreamClass, tai_now, tai_to_avtp32,
};

fn attrs(stream_id: u64, name: &'static str) -> ChannelAttrs {
    ChannelAttrs {
        dst: [0x01, 0x00, 0x5E, 0x00, 0x00, 0x01],
        stream_id,
        sc: StreamClass::A,
        size: 8,
        interval_ns: Nanos::from_millis(20),
        name,
    }
}

fn handler_on_lo(cfg: &Config) -> Option<NetHandler> {
    match NetHandler::create(cfg) {
        Ok(nh) => Some(nh),
        Err(err) => {
            eprintln!("skipping loopback test (needs CAP_NET_RAW): {err}");
            None
        }
    }
}

#[test]
fn basic_round_trip() {
    let Some(nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(42, "roundtrip");
    let mut tx = nh.create_tx(&a).unwrap();
    let mut rx = nh.create_rx(&a).unwrap();

    let payload = [0xDEu8, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF];
    tx.send_now(&payload).unwrap();

    // Read on a helper thread so a lost frame fails the test instead
    // of hanging it.
    let (done_tx, done_rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 8];
        let res = rx.read(&mut buf).map(|n| (n, buf));
        done_tx.send(res).unwrap();
        rx
    });

    let res = done_rx.recv_timeout(Duration::from_secs(5)).expect("no frame within 5s");
    let (n, buf) = res.unwrap();
    assert_eq!(n, 8);
    assert_eq!(buf, payload);
    reader.join().unwrap();
}

#[test]
fn rate_gate_blocks_second_send() {
    let Some(nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(43, "rategate");
    let mut tx = nh.create_tx(&a).unwrap();
    let payload = [0u8; 8];

    tx.send_now(&payload).unwrap();
    let t0 = std::time::Instant::now();
    tx.send_now(&payload).unwrap();
    let blocked = t0.elapsed();

    assert!(blocked >= Duration::from_millis(19), "second send blocked only {blocked:?}");
    // The budget for the next frame sits a full interval out again.
    let ttx = tx.time_to_tx();
    assert!(ttx > Nanos::from_millis(15) && ttx <= Nanos::from_millis(20), "time_to_tx {ttx}");
}

#[test]
fn try_send_reports_rate_gating() {
    let Some(nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(44, "trysend");
    let mut tx = nh.create_tx(&a).unwrap();
    let payload = [0u8; 8];

    tx.send_now(&payload).unwrap();
    tx.update(tai_to_avtp32(tai_now()), &payload).unwrap();
    let mut launch = Nanos::ZERO;
    match tx.try_send(&mut launch) {
        Err(Error::RateGated(left)) => assert!(left <= Nanos::from_millis(20)),
        other => panic!("expected RateGated, got {other:?}"),
    }
}

#[test]
fn callback_table_collisions_and_capacity() {
    let cfg = Config { hmap_size: 4, ..Config::default() };
    let Some(nh) = handler_on_lo(&cfg) else { return };

    // All four stream ids map to slot 1 of a 4-slot table.
    let mut chans = Vec::new();
    for sid in [1u64, 5, 9, 13] {
        chans.push(nh.create_rx(&attrs(sid, "collide")).unwrap());
    }
    match nh.create_rx(&attrs(17, "overflow")) {
        Err(Error::TableFull) => {}
        other => panic!("expected TableFull, got {:?}", other.err()),
    }

    // Same id twice is a distinct failure.
    match nh.create_rx(&attrs(5, "duplicate")) {
        Err(Error::DuplicateStream(5)) => {}
        other => panic!("expected DuplicateStream, got {:?}", other.err()),
    }
    assert_eq!(nh.num_rx(), 4);
}

fn pdu_for(stream_id: u64, capture: Nanos, payload: &[u8]) -> Vec<u8> {
    let mut hdr = netchan::AvtpHeader::new(stream_id);
    hdr.seqnr = 0;
    hdr.tv = true;
    hdr.avtp_timestamp = tai_to_avtp32(capture);
    hdr.sdl = payload.len() as u16;
    let mut pdu = hdr.pack().to_vec();
    pdu.extend_from_slice(payload);
    pdu
}

#[test]
fn capture_time_reconstruction_from_injected_frame() {
    let Some(nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(45, "reconstruct");
    let mut rx = nh.create_rx(&a).unwrap();

    // Sender captured at T, we "receive" 5 ms later.
    let t = Nanos(123_456_789_000);
    let recv_ptp = t + Nanos::from_millis(5);
    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    nh.feed_frame(&pdu_for(45, t, &payload), Nanos(1), recv_ptp).unwrap();

    let mut buf = [0u8; 8];
    rx.read(&mut buf).unwrap();
    assert_eq!(buf, payload);
    assert_eq!(rx.last_capture_ptp(), recv_ptp - Nanos::from_millis(5));
}

#[test]
fn break_threshold_shuts_the_handler_down() {
    let cfg = Config { break_us: Some(1000), ..Config::default() };
    let Some(mut nh) = handler_on_lo(&cfg) else { return };

    let a = attrs(46, "break");
    let mut rx = nh.create_rx(&a).unwrap();

    // 2 ms end-to-end delay against a 1000 us threshold.
    let t = Nanos(500_000_000_000);
    let pdu = pdu_for(46, t, &[0u8; 8]);
    nh.feed_frame(&pdu, Nanos(1), t + Nanos::from_millis(2)).unwrap();

    let mut buf = [0u8; 8];
    match rx.read(&mut buf) {
        Err(Error::LatencyViolation { delta_us }) => assert_eq!(delta_us, 2000),
        other => panic!("expected LatencyViolation, got {other:?}"),
    }
    assert!(!nh.running());

    // Everything after the violation reports shutdown.
    match rx.read(&mut buf) {
        Err(Error::ShuttingDown) => {}
        other => panic!("expected ShuttingDown, got {other:?}"),
    }

    let t0 = std::time::Instant::now();
    nh.stop();
    assert!(t0.elapsed() < Duration::from_millis(500));
}

#[test]
fn logger_records_send_and_receive_sides() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = Config { log_file: Some(dir.path().join("chanlog")), ..Config::default() };
    let Some(mut nh) = handler_on_lo(&cfg) else { return };

    let a = attrs(49, "logged");
    let mut tx = nh.create_tx(&a).unwrap();
    let mut rx = nh.create_rx(&a).unwrap();

    tx.send_now(&[7u8; 8]).unwrap();
    let (done_tx, done_rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 8];
        let res = rx.read(&mut buf).map(|_| ());
        done_tx.send(res).unwrap();
    });
    done_rx.recv_timeout(Duration::from_secs(5)).expect("no frame within 5s").unwrap();
    reader.join().unwrap();

    // stop() joins the Rx thread and flushes the ring.
    nh.stop();
    let csv = std::fs::read_to_string(dir.path().join("chanlog-0.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(
        lines.next().unwrap(),
        "stream_id,sz,seqnr,avtp_ns,cap_ptp_ns,send_ptp_ns,tx_ns,rx_ns,recv_ptp_ns"
    );
    let rows: Vec<Vec<&str>> = lines.map(|l| l.split(',').collect()).collect();
    // First frame after channel creation goes out with seqnr 0.
    let tx_row = rows.iter().find(|r| r[0] == "49" && r[7] == "0").expect("tx row");
    assert_eq!(tx_row[2], "0");
    let rx_row = rows.iter().find(|r| r[0] == "49" && r[7] != "0").expect("rx row");
    assert_eq!(rx_row[2], "0");
}

#[test]
fn stop_is_idempotent_and_channels_observe_it() {
    let Some(mut nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(47, "stoptwice");
    let mut tx = nh.create_tx(&a).unwrap();

    nh.stop();
    nh.stop();

    match tx.send_now(&[0u8; 8]) {
        Err(Error::ShuttingDown) => {}
        other => panic!("expected ShuttingDown, got {other:?}"),
    }
    assert_eq!(tx.time_to_tx(), Nanos::MAX);
}

#[test]
fn pipe_driven_tx_worker_delivers_and_unblocks_on_drop() {
    let Some(nh) = handler_on_lo(&Config::default()) else { return };

    let a = attrs(48, "txworker");
    let tx = nh.create_tx(&a).unwrap();
    let mut rx = nh.create_rx(&a).unwrap();

    let mut pipe = tx.into_pipe().unwrap();
    pipe.write_sample(&[9u8; 8]).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 8];
        let res = rx.read(&mut buf).map(|_| buf);
        done_tx.send(res).unwrap();
    });
    let buf = done_rx.recv_timeout(Duration::from_secs(5)).expect("no frame within 5s").unwrap();
    assert_eq!(buf, [9u8; 8]);
    reader.join().unwrap();

    // Worker is blocked on its pipe; drop must wake and join it.
    drop(pipe);
}
