//! Channel framing for stream transports.
//!
//! The default TCP channel carries the session protocol in length-prefixed
//! frames:
//!
//! ```text
//! +--------------------+----------------------------------+
//! | u32 frame_len (BE) | length of bytes that follow      |
//! +--------------------+----------------------------------+
//! | u8 tag             | OPEN / TEXT / CLOSE / BINARY     |
//! +--------------------+----------------------------------+
//! | body               | per tag, see below               |
//! +--------------------+----------------------------------+
//! ```
//!
//! OPEN carries the UTF-8 handshake header and must be the first frame an
//! initiator sends. TEXT carries UTF-8 packet JSON. CLOSE carries a u16 BE
//! close code (0 = none) followed by a UTF-8 reason. BINARY is opaque and
//! ignored by the session layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Maximum frame size accepted by the decoder (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Channel frame tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    /// Handshake header frame
    Open = 0x01,
    /// UTF-8 packet text
    Text = 0x02,
    /// Close with code and reason
    Close = 0x03,
    /// Opaque binary payload
    Binary = 0x04,
}

impl TryFrom<u8> for FrameTag {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameTag::Open),
            0x02 => Ok(FrameTag::Text),
            0x03 => Ok(FrameTag::Close),
            0x04 => Ok(FrameTag::Binary),
            _ => Err(WireError::Tag(value)),
        }
    }
}

/// One decoded channel frame
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelFrame {
    /// Handshake header (encoded parameter string)
    Open(String),
    /// Packet JSON text
    Text(String),
    /// Connection close; `code` 0 on the wire maps to `None`
    Close {
        /// Close code, when the closer supplied one
        code: Option<u16>,
        /// Human-readable reason, possibly empty
        reason: String,
    },
    /// Opaque bytes, ignored by the session layer
    Binary(Bytes),
}

impl ChannelFrame {
    /// Encode to a length-prefixed buffer ready to write.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut body = BytesMut::new();
        match self {
            ChannelFrame::Open(header) => {
                body.put_u8(FrameTag::Open as u8);
                body.put_slice(header.as_bytes());
            }
            ChannelFrame::Text(text) => {
                body.put_u8(FrameTag::Text as u8);
                body.put_slice(text.as_bytes());
            }
            ChannelFrame::Close { code, reason } => {
                body.put_u8(FrameTag::Close as u8);
                body.put_u16(code.unwrap_or(0));
                body.put_slice(reason.as_bytes());
            }
            ChannelFrame::Binary(bytes) => {
                body.put_u8(FrameTag::Binary as u8);
                body.put_slice(bytes);
            }
        }

        if body.len() > DEFAULT_MAX_FRAME_SIZE {
            return Err(WireError::Size(body.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + body.len());
        buf.put_u32(body.len() as u32);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }
}

/// Incremental decoder for channel frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit.
    pub fn with_limit(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed; consumed bytes are
    /// removed from `buf` only once a whole frame is available.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ChannelFrame>, WireError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(WireError::Size(frame_len));
        }
        if frame_len == 0 {
            return Err(WireError::Truncated);
        }
        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let tag = FrameTag::try_from(frame_buf.get_u8())?;

        let frame = match tag {
            FrameTag::Open => ChannelFrame::Open(take_text(frame_buf)?),
            FrameTag::Text => ChannelFrame::Text(take_text(frame_buf)?),
            FrameTag::Close => {
                if frame_buf.len() < 2 {
                    return Err(WireError::Truncated);
                }
                let code = frame_buf.get_u16();
                ChannelFrame::Close {
                    code: if code == 0 { None } else { Some(code) },
                    reason: take_text(frame_buf)?,
                }
            }
            FrameTag::Binary => ChannelFrame::Binary(frame_buf),
        };
        Ok(Some(frame))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn take_text(bytes: Bytes) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Utf8)
}
