//! Wire formats for the three nested layers of the SMA Bluetooth
//! protocol: the 18-byte outer frame spoken directly over the socket,
//! the byte-stuffed PPP frame it carries, and the multiplexed inner
//! (0x6560) message inside that.

use std::str::FromStr;

use nom::bytes::complete::take;
use nom::number::complete::{le_u16, le_u32, le_u8};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use super::hdlc;
use super::{Error, Result};

pub const OUTER_HLEN: usize = 18;
pub const OUTER_MAXLEN: usize = 0x70;
pub const INNER_HLEN: usize = 36;

pub const SMA_PROTOCOL_ID: u16 = 0x6560;
pub const PPP_MARKER: [u8; 2] = [0xff, 0x03];

/// Link-level variable id for the radio signal strength.
pub const OVAR_SIGNAL: u16 = 0x05;

/// Sentinel value for a historic slot with no recorded data.
pub const NO_DATA: u32 = 0xffff_ffff;

// {{{ OuterType
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum OuterType {
    Ppp = 0x01,
    Hello = 0x02,
    GetVar = 0x03,
    VarVal = 0x04,
    Error = 0x07,
    Ppp2 = 0x08,
}
// }}}

// {{{ LinkAddr
/// A Bluetooth link address. Stored in wire order (little-endian); the
/// textual form is the usual most-significant-first colon notation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LinkAddr([u8; 6]);

impl LinkAddr {
    pub const BROADCAST: LinkAddr = LinkAddr([0xff; 6]);
    pub const ZERO: LinkAddr = LinkAddr([0x00; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    fn from_slice(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(bytes);
        Self(addr)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl FromStr for LinkAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut addr = [0u8; 6];
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(Error::Argument(format!("bad bluetooth address {:?}", s)));
        }
        for (i, part) in parts.iter().rev().enumerate() {
            addr[i] = u8::from_str_radix(part, 16)
                .map_err(|_| Error::Argument(format!("bad bluetooth address {:?}", s)))?;
        }
        Ok(Self(addr))
    }
}

impl std::fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text: Vec<String> = self.0.iter().rev().map(|b| format!("{:02X}", b)).collect();
        write!(f, "{}", text.join(":"))
    }
}

impl std::fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
// }}}

// {{{ DeviceAddr
/// The secondary six-byte address used by the inner protocol. Unlike
/// [`LinkAddr`] this is an opaque device identity, not a Bluetooth
/// address, and is never byte-reversed.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceAddr([u8; 6]);

impl DeviceAddr {
    pub const BROADCAST: DeviceAddr = DeviceAddr([0xff; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    fn from_slice(bytes: &[u8]) -> Self {
        let mut addr = [0u8; 6];
        addr.copy_from_slice(bytes);
        Self(addr)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Default for DeviceAddr {
    // the well-known local identity the reference clients present
    fn default() -> Self {
        Self([0x78, 0x00, 0x3f, 0x10, 0xfb, 0x39])
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text: Vec<String> = self.0.iter().map(|b| format!("{:02x}", b)).collect();
        write!(f, "{}", text.join(":"))
    }
}

impl std::fmt::Debug for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}
// }}}

/// Validates the fixed 18-byte outer header and returns the declared
/// total packet length.
pub fn check_header(hdr: &[u8]) -> Result<usize> {
    if hdr.len() < OUTER_HLEN {
        return Err(Error::Framing("truncated outer header".into()));
    }
    if hdr[0] != hdlc::FLAG {
        return Err(Error::Framing("missing packet start marker".into()));
    }
    if hdr[1] as usize > OUTER_MAXLEN || hdr[2] != 0 {
        return Err(Error::Framing(format!("bad packet length {:#04x}", hdr[1])));
    }
    if hdr[3] != (hdr[0] ^ hdr[1] ^ hdr[2]) {
        return Err(Error::Framing("bad header check byte".into()));
    }
    if (hdr[1] as usize) < OUTER_HLEN {
        return Err(Error::Framing(format!(
            "declared length {:#04x} shorter than header",
            hdr[1]
        )));
    }
    Ok(hdr[1] as usize)
}

// {{{ OuterFrame
/// The addressed frame spoken directly over the Bluetooth socket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OuterFrame {
    pub from: LinkAddr,
    pub to: LinkAddr,
    pub msg_type: u16,
    pub payload: Vec<u8>,
}

impl OuterFrame {
    /// Decodes a complete packet whose header has already been sized by
    /// [`check_header`].
    pub fn decode(pkt: &[u8]) -> Result<Self> {
        let pktlen = check_header(pkt)?;
        if pkt.len() != pktlen {
            return Err(Error::Framing(format!(
                "outer length mismatch (declared {}, got {})",
                pktlen,
                pkt.len()
            )));
        }

        Ok(Self {
            from: LinkAddr::from_slice(&pkt[4..10]),
            to: LinkAddr::from_slice(&pkt[10..16]),
            msg_type: u16::from_le_bytes([pkt[16], pkt[17]]),
            payload: pkt[OUTER_HLEN..].to_vec(),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let pktlen = self.payload.len() + OUTER_HLEN;
        if pktlen > OUTER_MAXLEN {
            return Err(Error::Argument(format!(
                "outer frame payload too long ({} bytes)",
                self.payload.len()
            )));
        }

        let mut pkt = Vec::with_capacity(pktlen);
        pkt.push(hdlc::FLAG);
        pkt.push(pktlen as u8);
        pkt.push(0x00);
        pkt.push(hdlc::FLAG ^ pktlen as u8);
        pkt.extend_from_slice(&self.from.0);
        pkt.extend_from_slice(&self.to.0);
        pkt.extend_from_slice(&self.msg_type.to_le_bytes());
        pkt.extend_from_slice(&self.payload);

        debug_assert_eq!(check_header(&pkt).ok(), Some(pktlen));
        Ok(pkt)
    }
}
// }}}

// {{{ PppFrame
/// One complete PPP frame, after de-stuffing and CRC verification.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PppFrame {
    pub protocol: u16,
    pub payload: Vec<u8>,
}

impl PppFrame {
    /// Decodes a de-stuffed frame: marker, protocol id, body, trailing FCS.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 6 {
            return Err(Error::Framing("PPP frame too short".into()));
        }
        if frame[0..2] != PPP_MARKER {
            return Err(Error::Protocol("bad marker bytes on PPP frame".into()));
        }

        let fcs_at = frame.len() - 2;
        let received = u16::from_le_bytes([frame[fcs_at], frame[fcs_at + 1]]);
        let computed = hdlc::crc16(&frame[..fcs_at]);
        if received != computed {
            return Err(Error::Crc { computed, received });
        }

        Ok(Self {
            protocol: u16::from_le_bytes([frame[2], frame[3]]),
            payload: frame[4..fcs_at].to_vec(),
        })
    }

    /// Builds the stuffed, flag-delimited wire form ready to be carried
    /// in an outer frame payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(self.payload.len() + 6);
        frame.extend_from_slice(&PPP_MARKER);
        frame.extend_from_slice(&self.protocol.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        let fcs = hdlc::crc16(&frame);
        frame.extend_from_slice(&fcs.to_le_bytes());
        hdlc::stuff(&frame)
    }
}

/// Pulls the next complete flag-delimited frame out of a per-source
/// reassembly buffer. Returns `None` until a closing flag has arrived.
/// On a malformed frame the offending bytes have already been drained,
/// so reassembly for this source restarts cleanly at the next frame.
pub fn extract_ppp(buf: &mut Vec<u8>) -> Result<Option<PppFrame>> {
    let term = match buf.iter().skip(1).position(|&b| b == hdlc::FLAG) {
        Some(pos) => pos + 1,
        None => return Ok(None),
    };

    let raw: Vec<u8> = buf.drain(..=term).collect();
    let frame = hdlc::destuff(&raw)?;
    PppFrame::decode(&frame).map(Some)
}
// }}}

// {{{ InnerMessage
/// The fixed-layout multiplexed message carried inside PPP frames with
/// protocol id [`SMA_PROTOCOL_ID`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InnerMessage {
    pub a2: u8,
    pub to2: DeviceAddr,
    pub b1: u8,
    pub b2: u8,
    pub from2: DeviceAddr,
    pub c1: u8,
    pub c2: u8,
    pub error: u16,
    pub pktcount: u16,
    /// 15-bit request tag; the top wire bit is [`InnerMessage::first`].
    pub tag: u16,
    pub first: bool,
    /// Message type with the low (response) bit stripped.
    pub msg_type: u16,
    pub response: bool,
    pub subtype: u16,
    pub arg1: u32,
    pub arg2: u32,
    pub extra: Vec<u8>,
}

fn parse_inner(i: &[u8]) -> nom::IResult<&[u8], InnerMessage> {
    let (i, _innerlen) = le_u8(i)?;
    let (i, a2) = le_u8(i)?;
    let (i, to2) = take(6usize)(i)?;
    let (i, b1) = le_u8(i)?;
    let (i, b2) = le_u8(i)?;
    let (i, from2) = take(6usize)(i)?;
    let (i, c1) = le_u8(i)?;
    let (i, c2) = le_u8(i)?;
    let (i, error) = le_u16(i)?;
    let (i, pktcount) = le_u16(i)?;
    let (i, tag) = le_u16(i)?;
    let (i, msg_type) = le_u16(i)?;
    let (i, subtype) = le_u16(i)?;
    let (i, arg1) = le_u32(i)?;
    let (i, arg2) = le_u32(i)?;

    Ok((
        i,
        InnerMessage {
            a2,
            to2: DeviceAddr::from_slice(to2),
            b1,
            b2,
            from2: DeviceAddr::from_slice(from2),
            c1,
            c2,
            error,
            pktcount,
            tag: tag & 0x7fff,
            first: tag & 0x8000 != 0,
            msg_type: msg_type & !1,
            response: msg_type & 1 != 0,
            subtype,
            arg1,
            arg2,
            extra: Vec::new(),
        },
    ))
}

impl InnerMessage {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(Error::Protocol("empty inner message".into()));
        }
        let innerlen = payload[0] as usize * 4;
        if payload.len() != innerlen {
            return Err(Error::Protocol(format!(
                "inner length field ({} bytes) does not match actual length ({} bytes)",
                innerlen,
                payload.len()
            )));
        }
        if payload.len() < INNER_HLEN {
            return Err(Error::Protocol("inner message shorter than header".into()));
        }

        let (extra, mut msg) = parse_inner(payload)
            .map_err(|_| Error::Protocol("malformed inner header".into()))?;
        msg.extra = extra.to_vec();
        Ok(msg)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.extra.len() % 4 != 0 {
            return Err(Error::Argument(
                "inner protocol payloads must have a multiple of 4 bytes length".into(),
            ));
        }
        if self.tag & 0x8000 != 0 {
            return Err(Error::Argument("tag wider than 15 bits".into()));
        }
        if self.msg_type & 1 != 0 {
            return Err(Error::Argument(
                "inner message type must have a clear low bit".into(),
            ));
        }

        let innerlen = (self.extra.len() + INNER_HLEN) / 4;
        let mut payload = Vec::with_capacity(INNER_HLEN + self.extra.len());
        payload.push(innerlen as u8);
        payload.push(self.a2);
        payload.extend_from_slice(&self.to2.0);
        payload.push(self.b1);
        payload.push(self.b2);
        payload.extend_from_slice(&self.from2.0);
        payload.push(self.c1);
        payload.push(self.c2);
        payload.extend_from_slice(&self.error.to_le_bytes());
        payload.extend_from_slice(&self.pktcount.to_le_bytes());
        let tag = if self.first { self.tag | 0x8000 } else { self.tag };
        payload.extend_from_slice(&tag.to_le_bytes());
        let msg_type = if self.response { self.msg_type | 1 } else { self.msg_type };
        payload.extend_from_slice(&msg_type.to_le_bytes());
        payload.extend_from_slice(&self.subtype.to_le_bytes());
        payload.extend_from_slice(&self.arg1.to_le_bytes());
        payload.extend_from_slice(&self.arg2.to_le_bytes());
        payload.extend_from_slice(&self.extra);
        Ok(payload)
    }
}
// }}}

// {{{ YieldReading
/// One timestamped production value, in watt-hours.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct YieldReading {
    pub timestamp: u32,
    pub value: u32,
}

fn le_u32_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Decodes the reply payload of an instantaneous/daily/total yield
/// query: a header word, then timestamp and value.
pub fn decode_yield(extra: &[u8]) -> Result<YieldReading> {
    if extra.len() < 12 {
        return Err(Error::Protocol(format!(
            "yield reply too short ({} bytes)",
            extra.len()
        )));
    }
    Ok(YieldReading {
        timestamp: le_u32_at(extra, 4),
        value: le_u32_at(extra, 8),
    })
}

/// Decodes historic-query payload bytes as 12-byte records of
/// `(timestamp, value, pad)`, dropping slots holding the no-data
/// sentinel.
pub fn decode_historic(extra: &[u8]) -> Vec<YieldReading> {
    extra
        .chunks(12)
        .filter(|record| record.len() >= 8)
        .filter_map(|record| {
            let timestamp = le_u32_at(record, 0);
            let value = le_u32_at(record, 4);
            (value != NO_DATA).then_some(YieldReading { timestamp, value })
        })
        .collect()
}
// }}}
