//! Extracts complete outer frames from the raw socket byte stream.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::packet::{check_header, OuterFrame, OUTER_HLEN};
use super::Error;

#[derive(Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameDecoder {
    type Item = OuterFrame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < OUTER_HLEN {
            return Ok(None);
        }

        let pktlen = check_header(src)?;

        if src.len() < pktlen {
            src.reserve(pktlen - src.len());
            return Ok(None);
        }

        let pkt = src.split_to(pktlen);
        OuterFrame::decode(&pkt).map(Some)
    }
}
