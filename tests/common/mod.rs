#![allow(dead_code)]

use std::str::FromStr;

use sma_bridge::sma::packet::{
    DeviceAddr, InnerMessage, LinkAddr, OuterFrame, OuterType, PppFrame, SMA_PROTOCOL_ID,
};

pub const INVERTER: &str = "00:80:25:2C:11:B2";
pub const LOCAL: &str = "00:1C:4D:77:00:1E";

pub const HELLO_PAYLOAD: [u8; 13] = [
    0x00, 0x04, 0x70, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
];

pub fn inverter_addr() -> LinkAddr {
    LinkAddr::from_str(INVERTER).unwrap()
}

pub fn local_addr() -> LinkAddr {
    LinkAddr::from_str(LOCAL).unwrap()
}

/// Wire bytes of one outer frame sent by the inverter.
pub fn outer(msg_type: u16, payload: &[u8]) -> Vec<u8> {
    OuterFrame {
        from: inverter_addr(),
        to: local_addr(),
        msg_type,
        payload: payload.to_vec(),
    }
    .encode()
    .unwrap()
}

/// Wire bytes of one inner-protocol reply from the inverter, wrapped in
/// PPP and an outer frame.
pub fn inner_reply(tag: u16, first: bool, pktcount: u16, error: u16, extra: Vec<u8>) -> Vec<u8> {
    outer(OuterType::Ppp.into(), &reply_ppp(tag, first, pktcount, error, extra))
}

/// The stuffed PPP payload of a reply, for tests that split it across
/// outer frames themselves.
pub fn reply_ppp(tag: u16, first: bool, pktcount: u16, error: u16, extra: Vec<u8>) -> Vec<u8> {
    let msg = InnerMessage {
        a2: 0xa0,
        to2: DeviceAddr::default(),
        b1: 0x00,
        b2: 0x00,
        from2: DeviceAddr::new([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
        c1: 0x00,
        c2: 0x00,
        error,
        pktcount,
        tag,
        first,
        msg_type: 0x0200,
        response: true,
        subtype: 0x5400,
        arg1: 0,
        arg2: 0,
        extra,
    };
    PppFrame {
        protocol: SMA_PROTOCOL_ID,
        payload: msg.encode().unwrap(),
    }
    .encode()
}

pub fn yield_extra(timestamp: u32, value: u32) -> Vec<u8> {
    let mut extra = vec![0x01, 0x26, 0x00, 0x40];
    extra.extend_from_slice(&timestamp.to_le_bytes());
    extra.extend_from_slice(&value.to_le_bytes());
    extra.extend_from_slice(&[0; 4]);
    extra
}

pub fn historic_extra(points: &[(u32, u32)]) -> Vec<u8> {
    let mut extra = Vec::new();
    for &(timestamp, value) in points {
        extra.extend_from_slice(&timestamp.to_le_bytes());
        extra.extend_from_slice(&value.to_le_bytes());
        extra.extend_from_slice(&[0; 4]);
    }
    extra
}
