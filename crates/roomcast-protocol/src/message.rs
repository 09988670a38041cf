//! Application-level messages.
//!
//! A message is what the hub fans out and what the connection pump reacts
//! to. It is always a whole message: fragments have already been reassembled
//! by the codec.

use bytes::{BufMut, Bytes, BytesMut};

use crate::frames::{Frame, OpCode};

/// Close status codes used by the server.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Endpoint going away (server shutdown, room deleted).
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol violation.
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Message too big to process.
    pub const MESSAGE_TOO_BIG: u16 = 1009;
}

/// A complete message with its opcode.
///
/// Only text, binary, ping, pong and close messages exist; continuation and
/// reserved opcodes never surface past the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    opcode: OpCode,
    payload: Bytes,
}

impl Message {
    /// Create a text message.
    #[must_use]
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            opcode: OpCode::Text,
            payload: Bytes::from(payload.into()),
        }
    }

    /// Create a binary message.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Create a ping message.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Ping,
            payload: payload.into(),
        }
    }

    /// Create a pong message.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self {
            opcode: OpCode::Pong,
            payload: payload.into(),
        }
    }

    /// Create a close message with a status code and reason.
    #[must_use]
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.extend_from_slice(reason.as_bytes());
        Self {
            opcode: OpCode::Close,
            payload: payload.freeze(),
        }
    }

    /// Create a close message without a status code.
    #[must_use]
    pub fn close_empty() -> Self {
        Self {
            opcode: OpCode::Close,
            payload: Bytes::new(),
        }
    }

    /// Build a message from an already validated opcode and payload.
    pub(crate) fn from_parts(opcode: OpCode, payload: Bytes) -> Self {
        debug_assert!(matches!(
            opcode,
            OpCode::Text | OpCode::Binary | OpCode::Ping | OpCode::Pong | OpCode::Close
        ));
        Self { opcode, payload }
    }

    /// Get the opcode.
    #[must_use]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload as text, if this is a text message.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self.opcode {
            OpCode::Text => std::str::from_utf8(&self.payload).ok(),
            _ => None,
        }
    }

    /// Check if this is a control message (ping, pong or close).
    #[must_use]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Check if this is a close message.
    #[must_use]
    pub fn is_close(&self) -> bool {
        self.opcode == OpCode::Close
    }

    /// Get the status code of a close message, if it carries one.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }

    /// Convert into a single final frame.
    #[must_use]
    pub fn into_frame(self) -> Frame {
        Frame::new(self.opcode, self.payload)
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
