//! RPC wire format.
//!
//! Each RPC message travels as the body of one packed channel frame:
//!
//! ```text
//! seq: u32 LE | type: u8 (0=request, 1=response) | ping: u8 |
//! cmd_len: u16 LE | cmd: utf-8 | payload
//! ```
//!
//! The payload runs to the end of the frame body; there is no inner length
//! field.

use core::fmt;

use bytes::{Buf, BufMut};

pub const TYPE_REQUEST: u8 = 0;
pub const TYPE_RESPONSE: u8 = 1;

/// Fixed-size portion of the RPC frame body.
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// A decoded RPC frame, borrowing `cmd` and `payload` from the input buffer.
#[derive(Debug, PartialEq)]
pub struct RpcFrame<'a> {
    pub seq: u32,
    pub kind: FrameKind,
    pub ping: bool,
    /// Command name; empty for responses.
    pub cmd: &'a str,
    pub payload: &'a [u8],
}

/// Malformed RPC frame bodies. Fatal to the channel that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtoError {
    Truncated { len: usize },
    BadType(u8),
    BadCmd,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { len } => write!(f, "truncated rpc frame ({len} bytes)"),
            Self::BadType(t) => write!(f, "unknown rpc frame type {t}"),
            Self::BadCmd => write!(f, "command name is not valid UTF-8"),
        }
    }
}

impl std::error::Error for ProtoError {}

pub fn encode(seq: u32, kind: FrameKind, ping: bool, cmd: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(cmd.len() <= usize::from(u16::MAX));
    let mut buf = Vec::with_capacity(HEADER_LEN + cmd.len() + payload.len());
    buf.put_u32_le(seq);
    buf.put_u8(match kind {
        FrameKind::Request => TYPE_REQUEST,
        FrameKind::Response => TYPE_RESPONSE,
    });
    buf.put_u8(u8::from(ping));
    buf.put_u16_le(cmd.len() as u16);
    buf.put_slice(cmd.as_bytes());
    buf.put_slice(payload);
    buf
}

pub fn decode(body: &[u8]) -> Result<RpcFrame<'_>, ProtoError> {
    if body.len() < HEADER_LEN {
        return Err(ProtoError::Truncated { len: body.len() });
    }
    let mut header = &body[..HEADER_LEN];
    let seq = header.get_u32_le();
    let kind = match header.get_u8() {
        TYPE_REQUEST => FrameKind::Request,
        TYPE_RESPONSE => FrameKind::Response,
        t => return Err(ProtoError::BadType(t)),
    };
    let ping = header.get_u8() != 0;
    let cmd_len = usize::from(header.get_u16_le());
    if body.len() - HEADER_LEN < cmd_len {
        return Err(ProtoError::Truncated { len: body.len() });
    }
    let cmd = std::str::from_utf8(&body[HEADER_LEN..HEADER_LEN + cmd_len])
        .map_err(|_| ProtoError::BadCmd)?;
    let payload = &body[HEADER_LEN + cmd_len..];
    Ok(RpcFrame {
        seq,
        kind,
        ping,
        cmd,
        payload,
    })
}
