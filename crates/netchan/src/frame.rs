//! AVTP common-header framing, bit-exact and endian-explicit.
//!
//! Serialisation is positional; multi-octet fields are network byte
//! order. Receivers tolerate any value in reserved fields.

/// Experimental AVTP subtype claimed for netchan PDUs.
pub const AVTP_SUBTYPE: u8 = 0x7F;

/// Serialised common-header length in octets.
pub const HDR_LEN: usize = 24;

/// EtherType carrying netchan frames on the wire.
pub const ETH_P_TSN: u16 = 0x22F0;

const ETH_HLEN: usize = 14;
const ETH_P_8021Q: u16 = 0x8100;

/// AVTP common header in host representation.
///
/// `stream_id` is the host-order value; it is converted to big endian
/// on pack and back on unpack. The same header instance is reused for
/// every frame a channel sends, with `seqnr` and `avtp_timestamp`
/// rewritten in place.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AvtpHeader {
    pub sv: bool,
    pub version: u8,
    pub mr: bool,
    pub fsd: u8,
    /// Timestamp valid; set whenever `avtp_timestamp` carries a value.
    pub tv: bool,
    /// Wraps 0xff -> 0x00. Starts at 0xff so the first pre-incremented
    /// frame goes out as 0x00.
    pub seqnr: u8,
    pub tu: bool,
    pub stream_id: u64,
    /// Lower 32 bit of the capture TAI time, ns.
    pub avtp_timestamp: u32,
    /// Stream data length: payload octets following the header.
    pub sdl: u16,
}

impl AvtpHeader {
    pub fn new(stream_id: u64) -> Self {
        Self {
            sv: true,
            version: 0,
            mr: false,
            fsd: 0,
            tv: false,
            seqnr: 0xff,
            tu: false,
            stream_id,
            avtp_timestamp: 0,
            sdl: 0,
        }
    }

    pub fn pack(&self) -> [u8; HDR_LEN] {
        let mut buf = [0u8; HDR_LEN];
        buf[0] = AVTP_SUBTYPE;
        buf[1] = (self.tv as u8)
            | ((self.fsd & 0x3) << 1)
            | ((self.mr as u8) << 3)
            | ((self.version & 0x7) << 4)
            | ((self.sv as u8) << 7);
        buf[2] = self.seqnr;
        buf[3] = self.tu as u8;
        buf[4..12].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.avtp_timestamp.to_be_bytes());
        // buf[16..20] format specific, zero for netchan
        buf[20..22].copy_from_slice(&self.sdl.to_be_bytes());
        // buf[22..24] reserved
        buf
    }

    /// Parse a header, rejecting short buffers and foreign subtypes.
    /// Reserved octets are skipped, whatever their content.
    pub fn unpack(buf: &[u8]) -> Option<Self> {
        if buf.len() < HDR_LEN || buf[0] != AVTP_SUBTYPE {
            return None;
        }
        Some(Self {
            tv: buf[1] & 0x1 != 0,
            fsd: (buf[1] >> 1) & 0x3,
            mr: buf[1] & 0x8 != 0,
            version: (buf[1] >> 4) & 0x7,
            sv: buf[1] & 0x80 != 0,
            seqnr: buf[2],
            tu: buf[3] & 0x1 != 0,
            stream_id: u64::from_be_bytes(buf[4..12].try_into().ok()?),
            avtp_timestamp: u32::from_be_bytes(buf[12..16].try_into().ok()?),
            sdl: u16::from_be_bytes(buf[20..22].try_into().ok()?),
        })
    }
}

/// Strip the link-layer header from a raw (ETH_P_ALL) capture,
/// returning the AVTP PDU when the frame carries our EtherType.
/// A single 802.1Q tag in front of it is skipped.
pub fn strip_ethernet(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < ETH_HLEN {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    match ethertype {
        ETH_P_TSN => Some(&frame[ETH_HLEN..]),
        ETH_P_8021Q if frame.len() >= ETH_HLEN + 4 => {
            let inner = u16::from_be_bytes([frame[16], frame[17]]);
            (inner == ETH_P_TSN).then(|| &frame[ETH_HLEN + 4..])
        }
        _ => None,
    }
}
