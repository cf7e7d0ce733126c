//! HDLC-style byte stuffing and frame check sequence, as used by the
//! PPP layer of the SMA Bluetooth protocol.

use super::{Error, Result};

pub const FLAG: u8 = 0x7e;
pub const ESCAPE: u8 = 0x7d;
const XON: u8 = 0x11;
const XOFF: u8 = 0x13;
const ESCAPE_XOR: u8 = 0x20;

fn reserved(b: u8) -> bool {
    matches!(b, FLAG | ESCAPE | XON | XOFF)
}

/// Wraps `frame` in flag bytes, escaping FLAG, ESCAPE, XON and XOFF.
pub fn stuff(frame: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(frame.len() + 2);
    raw.push(FLAG);
    for &b in frame {
        if reserved(b) {
            raw.push(ESCAPE);
            raw.push(b ^ ESCAPE_XOR);
        } else {
            raw.push(b);
        }
    }
    raw.push(FLAG);
    raw
}

/// Inverse of [`stuff`]: strips the delimiting flag bytes and undoes
/// escaping in a single pass over the slice.
pub fn destuff(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() < 2 || raw[0] != FLAG || raw[raw.len() - 1] != FLAG {
        return Err(Error::Framing("missing flag byte on PPP packet".into()));
    }

    let mut frame = Vec::with_capacity(raw.len() - 2);
    let mut iter = raw[1..raw.len() - 1].iter();
    while let Some(&b) = iter.next() {
        if b == ESCAPE {
            match iter.next() {
                Some(&e) => frame.push(e ^ ESCAPE_XOR),
                None => {
                    return Err(Error::Framing(
                        "escape byte truncated at end of PPP packet".into(),
                    ))
                }
            }
        } else {
            frame.push(b);
        }
    }
    Ok(frame)
}

/// CRC-16/X.25 (the HDLC FCS), covering everything in the de-stuffed
/// frame up to the two FCS bytes themselves.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::X_25>::calculate(data)
}
