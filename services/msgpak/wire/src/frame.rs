//! Transport framing.
//!
//! Every transport message is a length-prefixed frame:
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len (BE)   | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 kind              | Text / Close / Auth / AuthOk|
//! +----------------------+----------------------------+
//! | payload              | variable (0..N)            |
//! +----------------------+----------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec::{DEFAULT_MAX_MESSAGE_SIZE, INFLATE_HEADROOM};
use crate::error::FrameError;

/// Maximum frame size accepted by a reader (16 MB + 1 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = DEFAULT_MAX_MESSAGE_SIZE + INFLATE_HEADROOM;

/// Length prefix plus kind byte
pub const FRAME_HEADER_SIZE: usize = 5;

/// Frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Envelope blob
    Text = 1,
    /// Connection close with UTF-8 reason
    Close = 2,
    /// Transport credential preamble
    Auth = 3,
    /// Credential preamble accepted
    AuthOk = 4,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Text),
            2 => Ok(FrameKind::Close),
            3 => Ok(FrameKind::Auth),
            4 => Ok(FrameKind::AuthOk),
            other => Err(FrameError::Type(other)),
        }
    }
}

/// Transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Kind
    pub kind: FrameKind,
    /// Payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Text frame carrying an envelope blob
    pub fn text(blob: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            payload: Bytes::from(blob.into()),
        }
    }

    /// Close frame with a reason
    pub fn close(reason: &str) -> Self {
        Self {
            kind: FrameKind::Close,
            payload: Bytes::copy_from_slice(reason.as_bytes()),
        }
    }

    /// Credential preamble, `user \n password`
    pub fn auth(user: &str, password: &str) -> Self {
        let mut buf = BytesMut::with_capacity(user.len() + password.len() + 1);
        buf.put_slice(user.as_bytes());
        buf.put_u8(b'\n');
        buf.put_slice(password.as_bytes());
        Self {
            kind: FrameKind::Auth,
            payload: buf.freeze(),
        }
    }

    /// Preamble acknowledgement
    pub fn auth_ok() -> Self {
        Self {
            kind: FrameKind::AuthOk,
            payload: Bytes::new(),
        }
    }

    /// Split an auth payload into `(user, password)`
    pub fn auth_credentials(&self) -> Result<(String, String), FrameError> {
        if self.kind != FrameKind::Auth {
            return Err(FrameError::Malformed);
        }
        let text = std::str::from_utf8(&self.payload).map_err(|_| FrameError::Malformed)?;
        let (user, password) = text.split_once('\n').ok_or(FrameError::Malformed)?;
        Ok((user.to_string(), password.to_string()))
    }

    /// Payload as UTF-8 text
    pub fn payload_text(&self) -> Result<&str, FrameError> {
        std::str::from_utf8(&self.payload).map_err(|_| FrameError::Malformed)
    }

    /// Encoded size including the header
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, FrameError> {
        let frame_len = self.encoded_size() - 4;
        if frame_len > max_frame_size {
            return Err(FrameError::Size(frame_len));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u32(frame_len as u32);
        buf.put_u8(self.kind as u8);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a decoder with a custom size cap
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from a buffer
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > self.max_frame_size {
            return Err(FrameError::Size(frame_len));
        }
        if frame_len == 0 {
            return Err(FrameError::Malformed);
        }

        if buf.len() < 4 + frame_len {
            buf.reserve(4 + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let kind = FrameKind::try_from(frame_buf.get_u8())?;

        Ok(Some(Frame {
            kind,
            payload: frame_buf,
        }))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
