mod common;
use common::*;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use sma_bridge::sma::connection::Connection;
use sma_bridge::sma::packet::{extract_ppp, InnerMessage, OuterFrame, OuterType};
use sma_bridge::sma::Error;

fn connection() -> (Connection<DuplexStream>, DuplexStream) {
    let (ours, theirs) = tokio::io::duplex(4096);
    (
        Connection::new(ours, inverter_addr(), local_addr()),
        theirs,
    )
}

/// Reads one outer frame off the peer end of the link.
async fn read_outer(peer: &mut DuplexStream) -> OuterFrame {
    let mut header = [0u8; 18];
    peer.read_exact(&mut header).await.unwrap();
    let mut pkt = header.to_vec();
    pkt.resize(header[1] as usize, 0);
    peer.read_exact(&mut pkt[18..]).await.unwrap();
    OuterFrame::decode(&pkt).unwrap()
}

/// Reads one outer frame and unwraps the inner request it carries.
async fn read_request(peer: &mut DuplexStream) -> InnerMessage {
    let frame = read_outer(peer).await;
    assert_eq!(frame.msg_type, u16::from(OuterType::Ppp));
    let mut buf = frame.payload;
    let ppp = extract_ppp(&mut buf).unwrap().unwrap();
    InnerMessage::decode(&ppp.payload).unwrap()
}

#[tokio::test]
async fn hello_handshake() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&outer(OuterType::Hello.into(), &HELLO_PAYLOAD))
        .await
        .unwrap();

    let handshake = tokio::spawn(async move {
        sma.hello().await.unwrap();
    });

    // the echoed hello comes from the zero address
    let echo = read_outer(&mut peer).await;
    assert_eq!(echo.msg_type, u16::from(OuterType::Hello));
    assert_eq!(echo.from.as_bytes(), &[0; 6]);
    assert_eq!(echo.to, inverter_addr());
    assert_eq!(echo.payload, HELLO_PAYLOAD);

    peer.write_all(&outer(0x05, &[])).await.unwrap();
    handshake.await.unwrap();
}

#[tokio::test]
async fn hello_rejects_unexpected_payload() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&outer(OuterType::Hello.into(), &[0x00, 0x04]))
        .await
        .unwrap();

    assert!(matches!(sma.hello().await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn total_yield_end_to_end() {
    let (mut sma, mut peer) = connection();

    // first request gets tag 1
    peer.write_all(&inner_reply(1, true, 0, 0, yield_extra(1377975600, 12345)))
        .await
        .unwrap();

    let reading = sma.total_yield().await.unwrap();
    assert_eq!(reading.timestamp, 1377975600);
    assert_eq!(reading.value, 12345);

    let request = read_request(&mut peer).await;
    assert_eq!(request.tag, 1);
    assert!(request.first);
    assert!(!request.response);
    assert_eq!(request.msg_type, 0x0200);
    assert_eq!(request.subtype, 0x5400);
    assert_eq!(request.arg1, 0x0026_0100);
    assert_eq!(request.arg2, 0x0026_01ff);
}

#[tokio::test]
async fn logon_encodes_password() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(1, true, 0, 0, vec![])).await.unwrap();
    sma.logon("0000", 900).await.unwrap();

    let request = read_request(&mut peer).await;
    assert_eq!(request.msg_type, 0x040c);
    assert_eq!(request.subtype, 0xfffd);
    assert_eq!(request.arg1, 7);
    assert_eq!(request.arg2, 900);
    assert_eq!(&request.extra[..8], &[0xaa, 0xaa, 0xbb, 0xbb, 0x00, 0x00, 0x00, 0x00]);
    // '0' is 0x30; (0x30 + 0x88) % 0xff = 0xb8, NUL padding gives 0x88
    assert_eq!(
        &request.extra[8..],
        &[0xb8, 0xb8, 0xb8, 0xb8, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88, 0x88]
    );
}

#[tokio::test]
async fn logon_rejects_long_password() {
    let (mut sma, _peer) = connection();
    assert!(matches!(
        sma.logon("far too long a password", 900).await,
        Err(Error::Argument(_))
    ));
}

#[tokio::test]
async fn multi_packet_reply_reassembles_in_order() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(1, true, 2, 0, historic_extra(&[(1000, 10)])))
        .await
        .unwrap();
    peer.write_all(&inner_reply(1, false, 1, 0, historic_extra(&[(1300, 20)])))
        .await
        .unwrap();
    peer.write_all(&inner_reply(1, false, 0, 0, historic_extra(&[(1600, 30)])))
        .await
        .unwrap();

    let points = sma.historic(0, 2000).await.unwrap();
    let got: Vec<(u32, u32)> = points.iter().map(|p| (p.timestamp, p.value)).collect();
    assert_eq!(got, vec![(1000, 10), (1300, 20), (1600, 30)]);
}

#[tokio::test]
async fn multi_packet_reply_rejects_out_of_order_counter() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(1, true, 2, 0, vec![])).await.unwrap();
    peer.write_all(&inner_reply(1, false, 2, 0, vec![])).await.unwrap();

    assert!(matches!(
        sma.historic(0, 2000).await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn multi_packet_reply_requires_first_flag() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(1, false, 1, 0, vec![])).await.unwrap();

    assert!(matches!(
        sma.historic(0, 2000).await,
        Err(Error::Protocol(_))
    ));
}

#[tokio::test]
async fn unrelated_tags_are_ignored() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(5, true, 0, 0, yield_extra(1, 1)))
        .await
        .unwrap();
    peer.write_all(&inner_reply(1, true, 0, 0, yield_extra(1377975600, 777)))
        .await
        .unwrap();

    let reading = sma.total_yield().await.unwrap();
    assert_eq!(reading.value, 777);
}

#[tokio::test]
async fn device_errors_abort_the_wait() {
    let (mut sma, mut peer) = connection();

    peer.write_all(&inner_reply(1, true, 0, 0x0017, vec![]))
        .await
        .unwrap();

    assert!(matches!(
        sma.total_yield().await,
        Err(Error::Device(0x0017))
    ));
}

#[tokio::test]
async fn waits_time_out() {
    let (mut sma, _peer) = connection();
    sma.set_timeout(Duration::from_millis(50));

    assert!(matches!(sma.total_yield().await, Err(Error::Timeout(_))));
}

#[tokio::test]
async fn frames_for_other_link_addresses_are_dropped() {
    let (mut sma, mut peer) = connection();

    // valid reply, but addressed to some other station
    let mut stray = OuterFrame::decode(&inner_reply(1, true, 0, 0, yield_extra(1, 1))).unwrap();
    stray.to = "AA:BB:CC:DD:EE:FF".parse().unwrap();
    peer.write_all(&stray.encode().unwrap()).await.unwrap();

    peer.write_all(&inner_reply(1, true, 0, 0, yield_extra(1377975600, 42)))
        .await
        .unwrap();

    let reading = sma.total_yield().await.unwrap();
    assert_eq!(reading.value, 42);
}

#[tokio::test]
async fn ppp_frames_split_across_outer_packets_reassemble() {
    let (mut sma, mut peer) = connection();

    let raw = reply_ppp(1, true, 0, 0, yield_extra(1377975600, 999));
    let (head, tail) = raw.split_at(raw.len() / 2);
    peer.write_all(&outer(OuterType::Ppp.into(), head)).await.unwrap();
    peer.write_all(&outer(OuterType::Ppp2.into(), tail)).await.unwrap();

    let reading = sma.total_yield().await.unwrap();
    assert_eq!(reading.value, 999);
}

#[tokio::test]
async fn peer_hangup_surfaces_as_io_error() {
    let (mut sma, peer) = connection();
    drop(peer);

    assert!(matches!(sma.total_yield().await, Err(Error::Io(_))));
}
