use std::path::PathBuf;

use netchan_srp::MRPD_PORT;
use serde::Deserialize;

/// Handler configuration, exhaustive.
///
/// Deserializes from human-friendly forms (`"break_us": 1000`,
/// priorities per class) and defaults to a loopback self-test setup.
#[derive(Clone, Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// NIC to attach to.
    pub nic: String,
    /// Callback table capacity (stream id -> Rx channel).
    pub hmap_size: usize,
    /// Negotiate bandwidth with a local mrpd before channels go ready.
    pub use_srp: bool,
    /// Leave CPU C-states alone (skip the /dev/cpu_dma_latency pin).
    pub keep_cstate: bool,
    pub verbose: bool,
    /// Base path for the rotated CSV timing logs; None disables
    /// logging entirely.
    pub log_file: Option<PathBuf>,
    /// Also record wake-delay measurements from the delay engine.
    pub log_delay: bool,
    /// Tag frame arrivals and wake errors into the kernel trace buffer.
    pub ftrace: bool,
    /// End-to-end delay in us beyond which the handler shuts down.
    pub break_us: Option<u64>,
    /// PCP priorities per class, used when SRP does not override them.
    pub tx_prio_a: u8,
    pub tx_prio_b: u8,
    pub tx_prio_tas: u8,
    /// mrpd control port.
    pub srp_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nic: "lo".to_string(),
            hmap_size: 42,
            use_srp: false,
            keep_cstate: false,
            verbose: false,
            log_file: None,
            log_delay: false,
            ftrace: false,
            break_us: None,
            tx_prio_a: 3,
            tx_prio_b: 2,
            tx_prio_tas: 3,
            srp_port: MRPD_PORT,
        }
    }
}

impl Config {
    pub fn for_nic(nic: impl Into<String>) -> Self {
        Self { nic: nic.into(), ..Default::default() }
    }
}
