// SMA Bluetooth protocol engine: framing, CRC, request/response
// correlation and the operations built on top of them.
pub mod connection;
pub mod frame_decoder;
pub mod hdlc;
pub mod packet;

use thiserror::Error as ThisError;

/// Errors surfaced by the protocol engine. Everything is reported
/// synchronously to the operation that was in flight; the engine never
/// retries on its own.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Malformed outer header, truncated escape, bad check byte.
    #[error("framing error: {0}")]
    Framing(String),

    /// FCS mismatch on a de-stuffed PPP frame.
    #[error("bad CRC on PPP frame (computed {computed:#06x}, received {received:#06x})")]
    Crc { computed: u16, received: u16 },

    /// Bad marker bytes, length mismatch, reassembly ordering violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The inverter reported a nonzero error code in a response.
    #[error("device returned error {0:#06x}")]
    Device(u16),

    /// Caller-supplied values violate an encoding constraint.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// No matching reply arrived within the configured wait.
    #[error("no reply from inverter within {0:?}")]
    Timeout(std::time::Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
