//! Kernel trace-buffer tagging via tracefs.
//!
//! Tags written to `trace_marker` interleave with sched/net/irq events
//! in the trace, which is how frame arrivals and wake errors get
//! correlated with what the kernel was doing at the time.

use std::{
    fs::File,
    io::Write,
    path::Path,
    sync::Mutex,
};

use tracing::{info, warn};

const TRACEFS: &str = "/sys/kernel/tracing";

fn write_knob(attr: &str, val: &str) {
    let path = Path::new(TRACEFS).join(attr);
    if let Ok(mut f) = File::create(&path) {
        let _ = writeln!(f, "{val}");
    }
}

/// Open handle to the kernel trace marker.
pub struct TraceBuffer {
    marker: Mutex<File>,
}

impl TraceBuffer {
    /// Configure the trace buffer and start tracing. Requires a
    /// writable tracefs, so usually root.
    pub fn open() -> Option<Self> {
        write_knob("tracing_on", "0");
        write_knob("buffer_size_kb", "8192");
        write_knob("events/sched/enable", "1");
        write_knob("events/net/enable", "1");
        write_knob("events/irq/enable", "1");

        let marker = match File::create(Path::new(TRACEFS).join("trace_marker")) {
            Ok(f) => f,
            Err(err) => {
                warn!(?err, "tracefs unavailable, ftrace tags disabled");
                return None;
            }
        };
        write_knob("tracing_on", "1");
        info!("tracebuffer opened");

        Some(Self { marker: Mutex::new(marker) })
    }

    /// Drop a tag into the trace.
    pub fn tag(&self, msg: &str) {
        let mut marker = self.marker.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Err(err) = marker.write_all(msg.as_bytes()).and_then(|()| marker.flush()) {
            warn!(?err, "failed writing trace tag");
        }
    }
}

impl Drop for TraceBuffer {
    fn drop(&mut self) {
        write_knob("tracing_on", "0");
    }
}
