//! Wire encoding for the framed messages exchanged between the TCP worker
//! and its ring-buffer peers: BEGIN, DATA, END, ABORT, WINDOW, RESET.
//!
//! Encoding is little-endian, a one-byte type tag followed by a fixed set
//! of fields and, for BEGIN/DATA/END/ABORT, a length-prefixed variable
//! payload/extension.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Upper bound on a single encoded frame, matching `maxMessageLength` in the
/// default configuration. Frames produced here never exceed this; frames
/// read that claim to exceed it are rejected.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Begin { stream_id: u64, authorization: u64, extension: Vec<u8> },
    Data {
        stream_id: u64,
        authorization: u64,
        flags: u8,
        group_id: u64,
        padding: u16,
        payload: Vec<u8>,
        extension: Vec<u8>,
    },
    End { stream_id: u64, authorization: u64, extension: Vec<u8> },
    Abort { stream_id: u64, authorization: u64, extension: Vec<u8> },
    Window { stream_id: u64, credit: i32, padding: i32, group_id: u64 },
    Reset { stream_id: u64 },
}

impl StreamMessage {
    pub fn stream_id(&self) -> u64 {
        match self {
            StreamMessage::Begin { stream_id, .. }
            | StreamMessage::Data { stream_id, .. }
            | StreamMessage::End { stream_id, .. }
            | StreamMessage::Abort { stream_id, .. }
            | StreamMessage::Window { stream_id, .. }
            | StreamMessage::Reset { stream_id } => *stream_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamMessage::End { .. } | StreamMessage::Abort { .. })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameType {
    Begin = 0x01,
    Data = 0x02,
    End = 0x03,
    Abort = 0x04,
    Window = 0x05,
    Reset = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => FrameType::Begin,
            0x02 => FrameType::Data,
            0x03 => FrameType::End,
            0x04 => FrameType::Abort,
            0x05 => FrameType::Window,
            0x06 => FrameType::Reset,
            other => return Err(MessageError::UnknownFrameType(other)),
        })
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown frame type tag {0:#x}")]
    UnknownFrameType(u8),
    #[error("frame length {0} exceeds max {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("truncated frame")]
    Truncated,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encodes `StreamMessage`s into a byte buffer. Stateless; reused across
/// calls to avoid per-frame allocation of the writer itself (the output
/// buffer is supplied by the caller).
#[derive(Default)]
pub struct MessageWriter;

impl MessageWriter {
    pub fn encode(&self, msg: &StreamMessage, out: &mut Vec<u8>) -> Result<(), MessageError> {
        out.clear();
        match msg {
            StreamMessage::Begin { stream_id, authorization, extension } => {
                write_u8(out, FrameType::Begin as u8);
                write_u64(out, *stream_id);
                write_u64(out, *authorization);
                write_bytes(out, extension)?;
            }
            StreamMessage::Data { stream_id, authorization, flags, group_id, padding, payload, extension } => {
                write_u8(out, FrameType::Data as u8);
                write_u64(out, *stream_id);
                write_u64(out, *authorization);
                write_u8(out, *flags);
                write_u64(out, *group_id);
                write_u16(out, *padding);
                write_bytes(out, payload)?;
                write_bytes(out, extension)?;
            }
            StreamMessage::End { stream_id, authorization, extension } => {
                write_u8(out, FrameType::End as u8);
                write_u64(out, *stream_id);
                write_u64(out, *authorization);
                write_bytes(out, extension)?;
            }
            StreamMessage::Abort { stream_id, authorization, extension } => {
                write_u8(out, FrameType::Abort as u8);
                write_u64(out, *stream_id);
                write_u64(out, *authorization);
                write_bytes(out, extension)?;
            }
            StreamMessage::Window { stream_id, credit, padding, group_id } => {
                write_u8(out, FrameType::Window as u8);
                write_u64(out, *stream_id);
                write_i32(out, *credit);
                write_i32(out, *padding);
                write_u64(out, *group_id);
            }
            StreamMessage::Reset { stream_id } => {
                write_u8(out, FrameType::Reset as u8);
                write_u64(out, *stream_id);
            }
        }
        if out.len() > MAX_FRAME_LEN {
            return Err(MessageError::TooLarge(out.len()));
        }
        Ok(())
    }
}

/// Decodes `StreamMessage`s from a byte buffer produced by [`MessageWriter`].
#[derive(Default)]
pub struct MessageReader;

impl MessageReader {
    pub fn decode(&self, mut buf: &[u8]) -> Result<StreamMessage, MessageError> {
        let tag = read_u8(&mut buf)?;
        let frame_type = FrameType::try_from(tag)?;
        Ok(match frame_type {
            FrameType::Begin => StreamMessage::Begin {
                stream_id: read_u64(&mut buf)?,
                authorization: read_u64(&mut buf)?,
                extension: read_bytes(&mut buf)?,
            },
            FrameType::Data => {
                let stream_id = read_u64(&mut buf)?;
                let authorization = read_u64(&mut buf)?;
                let flags = read_u8(&mut buf)?;
                let group_id = read_u64(&mut buf)?;
                let padding = read_u16(&mut buf)?;
                let payload = read_bytes(&mut buf)?;
                let extension = read_bytes(&mut buf)?;
                StreamMessage::Data { stream_id, authorization, flags, group_id, padding, payload, extension }
            }
            FrameType::End => StreamMessage::End {
                stream_id: read_u64(&mut buf)?,
                authorization: read_u64(&mut buf)?,
                extension: read_bytes(&mut buf)?,
            },
            FrameType::Abort => StreamMessage::Abort {
                stream_id: read_u64(&mut buf)?,
                authorization: read_u64(&mut buf)?,
                extension: read_bytes(&mut buf)?,
            },
            FrameType::Window => StreamMessage::Window {
                stream_id: read_u64(&mut buf)?,
                credit: read_i32(&mut buf)?,
                padding: read_i32(&mut buf)?,
                group_id: read_u64(&mut buf)?,
            },
            FrameType::Reset => StreamMessage::Reset { stream_id: read_u64(&mut buf)? },
        })
    }
}

fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

fn write_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), MessageError> {
    if bytes.len() > u32::MAX as usize {
        return Err(MessageError::TooLarge(bytes.len()));
    }
    write_u32(out, bytes.len() as u32);
    out.write_all(bytes)?;
    Ok(())
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, MessageError> {
    let mut b = [0u8; 1];
    buf.read_exact(&mut b).map_err(|_| MessageError::Truncated)?;
    Ok(b[0])
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, MessageError> {
    let mut b = [0u8; 2];
    buf.read_exact(&mut b).map_err(|_| MessageError::Truncated)?;
    Ok(u16::from_le_bytes(b))
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, MessageError> {
    let mut b = [0u8; 4];
    buf.read_exact(&mut b).map_err(|_| MessageError::Truncated)?;
    Ok(i32::from_le_bytes(b))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, MessageError> {
    let mut b = [0u8; 4];
    buf.read_exact(&mut b).map_err(|_| MessageError::Truncated)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, MessageError> {
    let mut b = [0u8; 8];
    buf.read_exact(&mut b).map_err(|_| MessageError::Truncated)?;
    Ok(u64::from_le_bytes(b))
}

fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, MessageError> {
    let len = read_u32(buf)? as usize;
    if len > MAX_FRAME_LEN {
        return Err(MessageError::TooLarge(len));
    }
    let mut v = vec![0u8; len];
    buf.read_exact(&mut v).map_err(|_| MessageError::Truncated)?;
    Ok(v)
}
