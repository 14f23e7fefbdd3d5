//! Wire strings for the mrpd text protocol.
//!
//! Messages are short `\n`/`\0`-terminated ASCII lines over UDP. The
//! daemon echoes attribute events back with three-letter state
//! prefixes (SNE new, SJO join, SLE leave).

/// Listener declaration below or at this substate means ask-failed and
/// must not count towards readiness.
pub const MSRP_LISTENER_ASKFAILED: u8 = 1;

/// Domain id mrpd uses for class A; every other id maps to class B.
pub const DOMAIN_ID_CLASS_A: u8 = 6;

pub fn query_domain() -> String {
    "S??".to_string()
}

pub fn join_vlan(vid: u16) -> String {
    format!("V++:I={vid:04x}")
}

pub fn leave_vlan(vid: u16) -> String {
    format!("V--:I={vid:04x}")
}

pub fn register_domain(id: u8, prio: u8, vid: u16) -> String {
    format!("S+D:C={id},P={prio},V={vid:04x}")
}

pub fn unregister_domain(id: u8, prio: u8, vid: u16) -> String {
    format!("S-D:C={id},P={prio},V={vid:04x}")
}

#[allow(clippy::too_many_arguments)]
fn advertise_msg(
    op: &str,
    stream_id: u64,
    dst: [u8; 6],
    vid: u16,
    pktsz: u32,
    interval: u32,
    prio: u8,
    latency: u32,
) -> String {
    let sid = stream_id.to_be_bytes();
    let mut msg = format!("S{op}:S=");
    for b in sid {
        msg.push_str(&format!("{b:02X}"));
    }
    msg.push_str(",A=");
    for b in dst {
        msg.push_str(&format!("{b:02X}"));
    }
    msg.push_str(&format!(
        ",V={vid:04X},Z={pktsz},I={interval},P={prio_shifted},L={latency}",
        prio_shifted = (prio as u32) << 5
    ));
    msg
}

#[allow(clippy::too_many_arguments)]
pub fn advertise_stream(
    stream_id: u64,
    dst: [u8; 6],
    vid: u16,
    pktsz: u32,
    interval: u32,
    prio: u8,
    latency: u32,
) -> String {
    advertise_msg("++", stream_id, dst, vid, pktsz, interval, prio, latency)
}

#[allow(clippy::too_many_arguments)]
pub fn unadvertise_stream(
    stream_id: u64,
    dst: [u8; 6],
    vid: u16,
    pktsz: u32,
    interval: u32,
    prio: u8,
    latency: u32,
) -> String {
    advertise_msg("--", stream_id, dst, vid, pktsz, interval, prio, latency)
}

fn listener_msg(join: bool, stream_id: u64) -> String {
    let sid = stream_id.to_be_bytes();
    let mut msg = format!("S{}L:L=", if join { "+" } else { "-" });
    for b in sid {
        msg.push_str(&format!("{b:02x}"));
    }
    msg.push_str(&format!(", D={}", if join { 2 } else { 3 }));
    msg
}

pub fn listener_ready(stream_id: u64) -> String {
    listener_msg(true, stream_id)
}

pub fn listener_leave(stream_id: u64) -> String {
    listener_msg(false, stream_id)
}

/// Attribute event recovered from a daemon line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SrpEvent {
    /// `SJO D:` (or a bare domain line in a query reply). An id of
    /// [`DOMAIN_ID_CLASS_A`] selects class A, anything else class B.
    Domain { id: u8, prio: u8, vid: u16 },
    /// `SNE T:` / `SJO T:` talker advertise seen on the network.
    TalkerSeen { stream_id: u64, dst: [u8; 6] },
    /// `SLE T:` talker withdrew.
    TalkerLeave { stream_id: u64 },
    /// `SJO L:` / `SNE L:` listener declaration for one of our talkers.
    ListenerJoin { stream_id: u64, substate: u8 },
    /// `SLE L:` listener withdrew.
    ListenerLeave { stream_id: u64 },
}

fn hex_u64_at(line: &str, key: &str) -> Option<u64> {
    let start = line.find(key)? + key.len();
    let hex: String = line[start..].chars().take_while(char::is_ascii_hexdigit).collect();
    if hex.len() < 16 {
        return None;
    }
    u64::from_str_radix(&hex[..16], 16).ok()
}

fn mac_at(line: &str, key: &str) -> Option<[u8; 6]> {
    let start = line.find(key)? + key.len();
    let hex: String = line[start..].chars().take_while(char::is_ascii_hexdigit).collect();
    if hex.len() < 12 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, chunk) in mac.iter_mut().enumerate() {
        *chunk = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(mac)
}

fn dec_at(line: &str, key: &str) -> Option<u32> {
    let start = line.find(key)? + key.len();
    let digits: String = line[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

fn hex_u16_at(line: &str, key: &str) -> Option<u16> {
    let start = line.find(key)? + key.len();
    let hex: String = line[start..].chars().take_while(char::is_ascii_hexdigit).collect();
    if hex.is_empty() {
        return None;
    }
    u16::from_str_radix(&hex, 16).ok()
}

fn parse_domain(body: &str) -> Option<SrpEvent> {
    // Body is either "C=<id>,P=<prio>,V=<vid>" or "<id>,P=<prio>,V=<vid>".
    let id = dec_at(body, "C=").or_else(|| {
        let digits: String = body.chars().take_while(char::is_ascii_digit).collect();
        digits.parse().ok()
    })?;
    let prio = dec_at(body, "P=")?;
    let vid = hex_u16_at(body, "V=")?;
    Some(SrpEvent::Domain { id: id as u8, prio: prio as u8, vid })
}

fn parse_line(line: &str) -> Option<SrpEvent> {
    let line = line.trim_matches(['\0', '\r', ' ']);
    if line.len() < 4 {
        return None;
    }

    if let Some(body) = line.strip_prefix("SJO D:").or_else(|| line.strip_prefix("D:")) {
        return parse_domain(body);
    }

    if line.starts_with("SNE T:") || line.starts_with("SJO T:") {
        return Some(SrpEvent::TalkerSeen {
            stream_id: hex_u64_at(line, "S=")?,
            dst: mac_at(line, "A=")?,
        });
    }
    if line.starts_with("SLE T:") {
        return Some(SrpEvent::TalkerLeave { stream_id: hex_u64_at(line, "S=")? });
    }

    if line.starts_with("SJO L:") || line.starts_with("SNE L:") {
        let stream_id = hex_u64_at(line, "S=").or_else(|| hex_u64_at(line, "L="))?;
        let substate = dec_at(line, "D=").unwrap_or(0) as u8;
        return Some(SrpEvent::ListenerJoin { stream_id, substate });
    }
    if line.starts_with("SLE L:") {
        let stream_id = hex_u64_at(line, "S=").or_else(|| hex_u64_at(line, "L="))?;
        return Some(SrpEvent::ListenerLeave { stream_id });
    }

    None
}

/// Split a datagram into lines and recover the events we act on.
/// Unknown or malformed lines are skipped, the daemon sends plenty of
/// attribute chatter we do not track.
pub fn parse(buf: &str) -> Vec<SrpEvent> {
    buf.split(['\n', '\0']).filter_map(parse_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_vlan_and_domain() {
        assert_eq!(join_vlan(2), "V++:I=0002");
        assert_eq!(leave_vlan(0x0abc), "V--:I=0abc");
        assert_eq!(register_domain(6, 3, 2), "S+D:C=6,P=3,V=0002");
        assert_eq!(unregister_domain(6, 3, 2), "S-D:C=6,P=3,V=0002");
    }

    #[test]
    fn formats_talker_advertise() {
        let msg = advertise_stream(
            0x0011_2233_4455_6677,
            [0x01, 0x00, 0x5E, 0x00, 0x00, 0x2A],
            2,
            72,
            1,
            3,
            3900,
        );
        assert_eq!(msg, "S++:S=0011223344556677,A=01005E00002A,V=0002,Z=72,I=1,P=96,L=3900");
    }

    #[test]
    fn formats_listener_ready_and_leave() {
        assert_eq!(listener_ready(0x2a), "S+L:L=000000000000002a, D=2");
        assert_eq!(listener_leave(0x2a), "S-L:L=000000000000002a, D=3");
    }

    #[test]
    fn parses_domain_announcement() {
        let events = parse("SJO D:C=6,P=3,V=0002");
        assert_eq!(events, vec![SrpEvent::Domain { id: 6, prio: 3, vid: 2 }]);

        // Query-reply form without the C= key.
        let events = parse("SJO D:5,P=2,V=0abc");
        assert_eq!(events, vec![SrpEvent::Domain { id: 5, prio: 2, vid: 0x0abc }]);
    }

    #[test]
    fn parses_talker_events() {
        let events = parse("SNE T:S=00000000000000FF,A=AABBCCDDEEFF,V=0002");
        assert_eq!(
            events,
            vec![SrpEvent::TalkerSeen {
                stream_id: 0xff,
                dst: [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]
            }]
        );
        assert_eq!(parse("SLE T:S=0000000000000001,A=000000000000"), vec![SrpEvent::TalkerLeave {
            stream_id: 1
        }]);
    }

    #[test]
    fn parses_listener_events_and_substates() {
        let events = parse("SJO L:D=2,S=000000000000002a");
        assert_eq!(events, vec![SrpEvent::ListenerJoin { stream_id: 0x2a, substate: 2 }]);

        let events = parse("SLE L:D=3,S=000000000000002a");
        assert_eq!(events, vec![SrpEvent::ListenerLeave { stream_id: 0x2a }]);
    }

    #[test]
    fn multiline_datagram_yields_all_events() {
        let events = parse("SJO D:C=6,P=3,V=0002\nSNE T:S=0000000000000001,A=001122334455\n");
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn garbage_is_skipped() {
        assert!(parse("ERC bad command\nMJO weird\n").is_empty());
        assert!(parse("SJO L:D=2,S=123").is_empty());
    }
}
