//! The protocol engine proper: drives a byte stream carrying the SMA
//! Bluetooth protocol, correlates replies to requests by tag, and
//! exposes the device operations (logon, yield queries, historic
//! queries, clock set) on top.
//!
//! The exchange is strictly half-duplex: one request, then its
//! reply, enforced by every wait taking `&mut self`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use super::frame_decoder::FrameDecoder;
use super::packet::{
    self, DeviceAddr, InnerMessage, LinkAddr, OuterFrame, OuterType, PppFrame, YieldReading,
    OVAR_SIGNAL, SMA_PROTOCOL_ID,
};
use super::{Error, Result};

const MAX_RXBUF: usize = 512;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed payload both ends exchange during the hello handshake.
const HELLO_PAYLOAD: [u8; 13] = [
    0x00, 0x04, 0x70, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00,
];

/// Unnamed packet type the inverter sends to finish the handshake.
const OTYPE_HELLO_ACK: u16 = 0x05;

// {{{ Request
/// Parameters of one inner-protocol request. The defaults cover the
/// common query shape; operations override what differs.
pub struct Request {
    pub a2: u8,
    pub b1: u8,
    pub b2: u8,
    pub c1: u8,
    pub c2: u8,
    pub msg_type: u16,
    pub subtype: u16,
    pub arg1: u32,
    pub arg2: u32,
    pub extra: Vec<u8>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            a2: 0xa0,
            b1: 0,
            b2: 0,
            c1: 0,
            c2: 0,
            msg_type: 0,
            subtype: 0,
            arg1: 0,
            arg2: 0,
            extra: Vec::new(),
        }
    }
}
// }}}

// {{{ Connection
pub struct Connection<S> {
    stream: S,
    remote_addr: LinkAddr,
    local_addr: LinkAddr,
    local_addr2: DeviceAddr,
    decoder: FrameDecoder,
    rxbuf: bytes::BytesMut,
    pppbuf: HashMap<LinkAddr, Vec<u8>>,
    rxqueue: VecDeque<InnerMessage>,
    tagcounter: u16,
    timeout: Duration,
}

impl Connection<TcpStream> {
    /// Connects to a serial-over-TCP bridge fronting the inverter's
    /// RFCOMM channel.
    pub async fn connect(
        host: &str,
        port: u16,
        remote_addr: LinkAddr,
        local_addr: LinkAddr,
    ) -> Result<Self> {
        debug!("connecting to {}:{} for inverter {}", host, port, remote_addr);
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Self::new(stream, remote_addr, local_addr))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, remote_addr: LinkAddr, local_addr: LinkAddr) -> Self {
        Self {
            stream,
            remote_addr,
            local_addr,
            local_addr2: DeviceAddr::default(),
            decoder: FrameDecoder::new(),
            rxbuf: bytes::BytesMut::with_capacity(MAX_RXBUF),
            pppbuf: HashMap::new(),
            rxqueue: VecDeque::new(),
            tagcounter: 0,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// How long each wait may block before giving up with
    /// [`Error::Timeout`].
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    // tags are 15 bits wide on the wire; zero is never handed out so a
    // stale reply with a cleared tag field can never match
    fn next_tag(&mut self) -> u16 {
        self.tagcounter = (self.tagcounter + 1) % 0x8000;
        if self.tagcounter == 0 {
            self.tagcounter = 1;
        }
        self.tagcounter
    }

    // {{{ rx side
    fn rxfilter_outer(&self, to: &LinkAddr) -> bool {
        *to == self.local_addr || *to == LinkAddr::BROADCAST || *to == LinkAddr::ZERO
    }

    fn rxfilter_inner(&self, to2: &DeviceAddr) -> bool {
        *to2 == self.local_addr2 || *to2 == DeviceAddr::BROADCAST
    }

    async fn recv_outer(&mut self) -> Result<OuterFrame> {
        loop {
            if let Some(frame) = self.decoder.decode(&mut self.rxbuf)? {
                trace!(
                    "rx outer {} -> {} type {:#04x} ({} bytes)",
                    frame.from,
                    frame.to,
                    frame.msg_type,
                    frame.payload.len()
                );
                if self.rxfilter_outer(&frame.to) {
                    return Ok(frame);
                }
                debug!("dropping packet addressed to {}", frame.to);
                continue;
            }

            if self.rxbuf.len() >= MAX_RXBUF {
                return Err(Error::Framing(
                    "receive buffer full without a complete packet".into(),
                ));
            }
            let n = self.stream.read_buf(&mut self.rxbuf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                )));
            }
        }
    }

    /// Feeds one PPP-bearing outer frame into the per-source
    /// reassembly buffer and queues any inner messages completed by it.
    fn rx_ppp(&mut self, frame: &OuterFrame) -> Result<()> {
        let mut buf = self.pppbuf.remove(&frame.from).unwrap_or_default();
        buf.extend_from_slice(&frame.payload);

        let res = loop {
            match packet::extract_ppp(&mut buf) {
                Ok(None) => break Ok(()),
                Ok(Some(ppp)) => {
                    if ppp.protocol != SMA_PROTOCOL_ID {
                        debug!("ignoring PPP frame with protocol {:#06x}", ppp.protocol);
                        continue;
                    }
                    let msg = InnerMessage::decode(&ppp.payload)?;
                    if !self.rxfilter_inner(&msg.to2) {
                        trace!("dropping inner message addressed to {}", msg.to2);
                        continue;
                    }
                    self.rxqueue.push_back(msg);
                }
                Err(e) => break Err(e),
            }
        };

        self.pppbuf.insert(frame.from, buf);
        res
    }

    async fn recv_inner(&mut self) -> Result<InnerMessage> {
        loop {
            if let Some(msg) = self.rxqueue.pop_front() {
                return Ok(msg);
            }

            let frame = self.recv_outer().await?;
            match OuterType::try_from(frame.msg_type) {
                Ok(OuterType::Ppp) | Ok(OuterType::Ppp2) => self.rx_ppp(&frame)?,
                Ok(OuterType::Error) => {
                    warn!("link-level error report from {}", frame.from)
                }
                _ => debug!(
                    "ignoring type {:#04x} packet while waiting for data",
                    frame.msg_type
                ),
            }
        }
    }
    // }}}

    // {{{ tx side
    async fn tx_raw(&mut self, pkt: &[u8]) -> Result<()> {
        self.stream.write_all(pkt).await?;
        Ok(())
    }

    async fn tx_outer(
        &mut self,
        from: LinkAddr,
        to: LinkAddr,
        msg_type: u16,
        payload: &[u8],
    ) -> Result<()> {
        let frame = OuterFrame {
            from,
            to,
            msg_type,
            payload: payload.to_vec(),
        };
        trace!(
            "tx outer {} -> {} type {:#04x} ({} bytes)",
            from,
            to,
            msg_type,
            payload.len()
        );
        let pkt = frame.encode()?;
        self.tx_raw(&pkt).await
    }

    /// Sends one inner-protocol request and returns the tag its reply
    /// will carry.
    async fn send_request(&mut self, req: Request) -> Result<u16> {
        let tag = self.next_tag();
        let msg = InnerMessage {
            a2: req.a2,
            to2: DeviceAddr::BROADCAST,
            b1: req.b1,
            b2: req.b2,
            from2: self.local_addr2,
            c1: req.c1,
            c2: req.c2,
            error: 0,
            pktcount: 0,
            tag,
            first: true,
            msg_type: req.msg_type,
            response: false,
            subtype: req.subtype,
            arg1: req.arg1,
            arg2: req.arg2,
            extra: req.extra,
        };

        let ppp = PppFrame {
            protocol: SMA_PROTOCOL_ID,
            payload: msg.encode()?,
        };
        let local = self.local_addr;
        self.tx_outer(local, LinkAddr::BROADCAST, OuterType::Ppp.into(), &ppp.encode())
            .await?;
        Ok(tag)
    }
    // }}}

    // {{{ waits
    /// Waits for an outer packet of the given type whose payload starts
    /// with `prefix`. PPP traffic arriving meanwhile is still fed into
    /// reassembly.
    async fn wait_outer(&mut self, wtype: u16, prefix: &[u8]) -> Result<Vec<u8>> {
        let timeout = self.timeout;
        let wait = async {
            loop {
                let frame = self.recv_outer().await?;
                if frame.msg_type == wtype && frame.payload.starts_with(prefix) {
                    return Ok(frame.payload);
                }
                match OuterType::try_from(frame.msg_type) {
                    Ok(OuterType::Ppp) | Ok(OuterType::Ppp2) => self.rx_ppp(&frame)?,
                    _ => debug!(
                        "ignoring type {:#04x} packet while waiting for type {:#04x}",
                        frame.msg_type, wtype
                    ),
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Waits for the single-packet reply carrying `tag`.
    async fn wait_inner(&mut self, tag: u16) -> Result<InnerMessage> {
        let timeout = self.timeout;
        let wait = async {
            loop {
                let msg = self.recv_inner().await?;
                if !msg.response || msg.tag != tag {
                    debug!("ignoring unrelated inner message (tag {:#06x})", msg.tag);
                    continue;
                }
                if msg.pktcount != 0 || !msg.first {
                    return Err(Error::Protocol("unexpected multi-packet reply".into()));
                }
                if msg.error != 0 {
                    return Err(Error::Device(msg.error));
                }
                return Ok(msg);
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }

    /// Waits for a multi-packet reply carrying `tag`. The first packet
    /// announces how many follow via its counter; each subsequent one
    /// must count down in order, and zero terminates the sequence.
    async fn wait_inner_multi(&mut self, tag: u16) -> Result<Vec<InnerMessage>> {
        let timeout = self.timeout;
        let wait = async {
            let mut replies: Vec<InnerMessage> = Vec::new();
            let mut expected = 0;
            loop {
                let msg = self.recv_inner().await?;
                if !msg.response || msg.tag != tag {
                    debug!("ignoring unrelated inner message (tag {:#06x})", msg.tag);
                    continue;
                }
                if msg.error != 0 {
                    return Err(Error::Device(msg.error));
                }

                if replies.is_empty() {
                    if !msg.first {
                        return Err(Error::Protocol(
                            "first packet of reply went missing".into(),
                        ));
                    }
                    expected = msg.pktcount as usize + 1;
                } else {
                    let want = expected - replies.len() - 1;
                    if msg.pktcount as usize != want {
                        return Err(Error::Protocol(format!(
                            "got packet counter {} instead of {}",
                            msg.pktcount, want
                        )));
                    }
                }

                let last = msg.pktcount == 0;
                replies.push(msg);
                if last {
                    debug_assert_eq!(replies.len(), expected);
                    return Ok(replies);
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(timeout)),
        }
    }
    // }}}

    // {{{ operations
    /// Performs the hello handshake the inverter initiates on connect.
    pub async fn hello(&mut self) -> Result<()> {
        let payload = self.wait_outer(OuterType::Hello.into(), &[]).await?;
        if payload != HELLO_PAYLOAD {
            return Err(Error::Protocol(format!(
                "unexpected hello payload {:02x?}",
                payload
            )));
        }
        let remote = self.remote_addr;
        self.tx_outer(LinkAddr::ZERO, remote, OuterType::Hello.into(), &HELLO_PAYLOAD)
            .await?;
        self.wait_outer(OTYPE_HELLO_ACK, &[]).await?;
        debug!("hello handshake with {} complete", self.remote_addr);
        Ok(())
    }

    /// Reads a link-level variable.
    pub async fn getvar(&mut self, varid: u16) -> Result<Vec<u8>> {
        let remote = self.remote_addr;
        self.tx_outer(
            LinkAddr::ZERO,
            remote,
            OuterType::GetVar.into(),
            &varid.to_le_bytes(),
        )
        .await?;
        let val = self
            .wait_outer(OuterType::VarVal.into(), &varid.to_le_bytes())
            .await?;
        if val.len() < 2 {
            return Err(Error::Protocol("truncated variable value".into()));
        }
        Ok(val[2..].to_vec())
    }

    /// Radio signal strength as a fraction of full scale.
    pub async fn signal_strength(&mut self) -> Result<f64> {
        let val = self.getvar(OVAR_SIGNAL).await?;
        if val.len() < 3 {
            return Err(Error::Protocol(format!(
                "signal strength reply too short ({} bytes)",
                val.len()
            )));
        }
        Ok(f64::from(val[2]) / 255.0)
    }

    /// Authenticates with the user password. `timeout_secs` is how long
    /// the inverter keeps the session alive without traffic.
    pub async fn logon(&mut self, password: &str, timeout_secs: u32) -> Result<()> {
        let password = password.as_bytes();
        if password.len() > 12 {
            return Err(Error::Argument("password longer than 12 bytes".into()));
        }

        let mut extra = vec![0xaa, 0xaa, 0xbb, 0xbb, 0x00, 0x00, 0x00, 0x00];
        for i in 0..12 {
            let c = password.get(i).copied().unwrap_or(0);
            extra.push(((u16::from(c) + 0x88) % 0xff) as u8);
        }

        let tag = self
            .send_request(Request {
                b2: 0x01,
                c2: 0x01,
                msg_type: 0x040c,
                subtype: 0xfffd,
                arg1: 7,
                arg2: timeout_secs,
                extra,
                ..Default::default()
            })
            .await?;
        self.wait_inner(tag).await?;
        debug!("logged on to {}", self.remote_addr);
        Ok(())
    }

    /// Total generation to date.
    pub async fn total_yield(&mut self) -> Result<YieldReading> {
        self.yield_query(0x0026_0100, 0x0026_01ff).await
    }

    /// Generation so far today.
    pub async fn daily_yield(&mut self) -> Result<YieldReading> {
        self.yield_query(0x0026_2200, 0x0026_22ff).await
    }

    async fn yield_query(&mut self, arg1: u32, arg2: u32) -> Result<YieldReading> {
        let tag = self
            .send_request(Request {
                msg_type: 0x0200,
                subtype: 0x5400,
                arg1,
                arg2,
                ..Default::default()
            })
            .await?;
        let msg = self.wait_inner(tag).await?;
        packet::decode_yield(&msg.extra)
    }

    /// Five-minutely total-yield samples in `[fromtime, totime]`.
    pub async fn historic(&mut self, fromtime: u32, totime: u32) -> Result<Vec<YieldReading>> {
        self.historic_query(0x7000, fromtime, totime).await
    }

    /// Daily total-yield samples in `[fromtime, totime]`.
    pub async fn historic_daily(
        &mut self,
        fromtime: u32,
        totime: u32,
    ) -> Result<Vec<YieldReading>> {
        self.historic_query(0x7020, fromtime, totime).await
    }

    async fn historic_query(
        &mut self,
        subtype: u16,
        fromtime: u32,
        totime: u32,
    ) -> Result<Vec<YieldReading>> {
        let tag = self
            .send_request(Request {
                a2: 0xe0,
                msg_type: 0x0200,
                subtype,
                arg1: fromtime,
                arg2: totime,
                ..Default::default()
            })
            .await?;
        let replies = self.wait_inner_multi(tag).await?;

        let mut points = Vec::new();
        for msg in &replies {
            points.extend(packet::decode_historic(&msg.extra));
        }
        Ok(points)
    }

    /// Sets the inverter clock. The inverter sends no reply to this.
    pub async fn set_time(&mut self, timestamp: u32, tzoffset: u16) -> Result<()> {
        let mut extra = Vec::with_capacity(28);
        extra.extend_from_slice(&0x0023_6d00_u32.to_le_bytes());
        extra.extend_from_slice(&timestamp.to_le_bytes());
        extra.extend_from_slice(&timestamp.to_le_bytes());
        extra.extend_from_slice(&timestamp.to_le_bytes());
        extra.extend_from_slice(&tzoffset.to_le_bytes());
        extra.extend_from_slice(&0_u16.to_le_bytes());
        extra.extend_from_slice(&0x007e_fe30_u32.to_le_bytes());
        extra.extend_from_slice(&0x0000_0001_u32.to_le_bytes());

        self.send_request(Request {
            msg_type: 0x020a,
            subtype: 0xf000,
            arg1: 0x0023_6d00,
            arg2: 0x0023_6d00,
            extra,
            ..Default::default()
        })
        .await?;
        Ok(())
    }
    // }}}
}
// }}}
