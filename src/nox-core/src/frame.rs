//! Length-prefixed record framing on a reliable byte stream.
//!
//! A record on the wire is a `u16` big-endian outer length followed by the
//! encoded frame:
//!
//! ```text
//! Record := u16 outerLen BE
//! Frame  := u8 version | u8 kind | u16 reserved=0 | u16 innerLen | payload
//! ```
//!
//! The outer and inner lengths redundantly describe the payload and must
//! agree on read. Records never exceed 65,535 bytes.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol version carried in every frame.
pub const VERSION: u8 = 0x02;

/// Frame header length (version, kind, reserved, inner length).
pub const HEADER_LEN: usize = 6;

/// Maximum encoded record size, bounded by the u16 outer length.
pub const MAX_RECORD: usize = u16::MAX as usize;

/// Maximum payload that fits a record once the header is accounted for.
pub const MAX_PAYLOAD: usize = MAX_RECORD - HEADER_LEN;

/// Framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Header malformed or inner/outer lengths disagree
    #[error("bad frame: {0}")]
    BadFrame(&'static str),

    /// Stream ended in the middle of a record
    #[error("short read: stream closed mid-record")]
    ShortRead,

    /// Payload exceeds what a record can carry
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// Kind byte outside the known set
    #[error("unknown frame kind: {0:#04x}")]
    UnknownKind(u8),

    /// Underlying transport error
    #[error("transport: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Control = 0x01,
    Data = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(FrameKind::Control),
            0x02 => Ok(FrameKind::Data),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A decoded wire record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Control frame at the current protocol version.
    pub fn control(payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            kind: FrameKind::Control,
            payload,
        }
    }

    /// Data frame at the current protocol version.
    pub fn data(payload: Vec<u8>) -> Self {
        Self {
            version: VERSION,
            kind: FrameKind::Data,
            payload,
        }
    }

    /// Serialize the frame header plus payload (without the outer length).
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.version);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse a frame from one length-delimited record body.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < HEADER_LEN {
            return Err(FrameError::BadFrame("record shorter than header"));
        }
        let kind = FrameKind::try_from(data[1])?;
        let inner_len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if inner_len + HEADER_LEN != data.len() {
            return Err(FrameError::BadFrame("inner length mismatch"));
        }
        Ok(Self {
            version: data[0],
            kind,
            payload: data[HEADER_LEN..].to_vec(),
        })
    }
}

fn map_eof(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ShortRead
    } else {
        FrameError::Io(e)
    }
}

/// Read one length-prefixed record, blocking until it is complete.
pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut len_buf = [0u8; 2];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(map_eof)?;
    Frame::decode(&buf)
}

/// Write one record: outer length then the encoded frame, flushed.
pub async fn write_record<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let raw = frame.encode()?;
    let mut buf = Vec::with_capacity(2 + raw.len());
    buf.extend_from_slice(&(raw.len() as u16).to_be_bytes());
    buf.extend_from_slice(&raw);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
