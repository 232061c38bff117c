//! Length-framed wire protocol: a 4-byte little-endian header followed by a
//! bounded payload.
//!
//! `decode_stream` reads against a `tokio::net::TcpStream` and loops over
//! partial reads, giving up after a bounded wall-clock budget rather than a
//! fixed retry count, so it behaves the same whether the peer trickles bytes
//! one at a time or all at once.

use crate::error::{EndpointError, Result};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::Instant;

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD: usize = 2048;
pub const MAX_FRAME: usize = MAX_PAYLOAD + 64; // 2112 B of slack per spec

pub const DECODE_BUDGET: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Audio,
    Start,
    Stop,
    Ping,
    Pong,
    Error,
    Ring,
    Answer,
}

impl MsgType {
    pub fn to_byte(self) -> u8 {
        match self {
            MsgType::Audio => 0x01,
            MsgType::Start => 0x02,
            MsgType::Stop => 0x03,
            MsgType::Ping => 0x04,
            MsgType::Pong => 0x05,
            MsgType::Error => 0x06,
            MsgType::Ring => 0x07,
            MsgType::Answer => 0x08,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x01 => MsgType::Audio,
            0x02 => MsgType::Start,
            0x03 => MsgType::Stop,
            0x04 => MsgType::Ping,
            0x05 => MsgType::Pong,
            0x06 => MsgType::Error,
            0x07 => MsgType::Ring,
            0x08 => MsgType::Answer,
            _ => return None,
        })
    }
}

pub const FLAG_NO_RING: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorReason {
    Ok = 0x00,
    Busy = 0x01,
    InvalidMsg = 0x02,
    NotReady = 0x03,
    Internal = 0xFF,
}

impl ErrorReason {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => ErrorReason::Ok,
            0x01 => ErrorReason::Busy,
            0x02 => ErrorReason::InvalidMsg,
            0x03 => ErrorReason::NotReady,
            _ => ErrorReason::Internal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub msg_type: u8,
    pub flags: u8,
    pub length: u16,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Encodes `header` and `payload` into a single contiguous byte buffer.
/// Rejects payloads longer than [`MAX_PAYLOAD`].
pub fn encode(msg_type: u8, flags: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(EndpointError::Oversize {
            len: payload.len() as u16,
        });
    }
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(msg_type);
    out.push(flags);
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Reads exactly one frame from `stream`: 4 header bytes, then `length`
/// payload bytes. Retries transient short reads up to [`DECODE_BUDGET`] of
/// wall-clock time, resetting the budget on every byte of progress.
pub async fn decode_stream(stream: &mut TcpStream) -> Result<Frame> {
    let mut header_buf = [0u8; HEADER_LEN];
    read_exact_budgeted(stream, &mut header_buf).await?;

    let header = Header {
        msg_type: header_buf[0],
        flags: header_buf[1],
        length: u16::from_le_bytes([header_buf[2], header_buf[3]]),
    };

    if header.length as usize > MAX_FRAME {
        return Err(EndpointError::Oversize { len: header.length });
    }

    let mut payload = vec![0u8; header.length as usize];
    if header.length > 0 {
        read_exact_budgeted(stream, &mut payload).await?;
    }

    Ok(Frame { header, payload })
}

/// Fills `dst` completely, retrying on a zero-byte-yet-not-EOF read (which
/// cannot happen with tokio's `read`, but mirrors the spec's non-blocking
/// retry loop) and on a short read, resetting the retry budget whenever any
/// bytes are copied.
async fn read_exact_budgeted(stream: &mut TcpStream, dst: &mut [u8]) -> Result<()> {
    let mut filled = 0usize;
    let mut deadline = Instant::now() + DECODE_BUDGET;

    while filled < dst.len() {
        let now = Instant::now();
        if now >= deadline {
            return Err(EndpointError::Incomplete);
        }

        let read = tokio::time::timeout(deadline - now, stream.read(&mut dst[filled..])).await;
        match read {
            Err(_elapsed) => return Err(EndpointError::Incomplete),
            Ok(Ok(0)) => return Err(EndpointError::Closed),
            Ok(Ok(n)) => {
                filled += n;
                deadline = Instant::now() + DECODE_BUDGET;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Ok(Err(e)) => return Err(EndpointError::Io(e)),
        }
    }
    Ok(())
}
