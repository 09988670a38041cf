//! Codec for encoding and decoding WebSocket frames.
//!
//! Frames are read incrementally from a `BytesMut` read buffer: a decode call
//! either yields a complete frame (advancing the buffer) or `None` when more
//! bytes are needed. [`FrameCodec`] layers message reassembly on top.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frames::{apply_mask, Frame, OpCode};
use crate::message::Message;

/// Default maximum frame payload size (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Default maximum reassembled message size (64 KiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Maximum payload of a control frame.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible frame header: 2 bytes + 8 byte length + 4 byte mask.
pub const MAX_HEADER_SIZE: usize = 14;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: u64, max: usize },

    /// Reassembled message exceeds maximum size.
    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    /// RSV1-3 set without a negotiated extension.
    #[error("Reserved header bits set")]
    ReservedBits,

    /// Control frame without the FIN bit.
    #[error("Fragmented control frame")]
    FragmentedControl,

    /// Control frame payload above 125 bytes.
    #[error("Control frame payload of {0} bytes exceeds {MAX_CONTROL_PAYLOAD}")]
    ControlTooLarge(u64),

    /// Frame from a client was not masked.
    #[error("Unmasked client frame")]
    UnmaskedFrame,

    /// Frame from a server was masked.
    #[error("Masked server frame")]
    UnexpectedMask,

    /// Continuation frame with no message in progress.
    #[error("Continuation frame without a started message")]
    UnexpectedContinuation,

    /// New data frame while a fragmented message is still open.
    #[error("Data frame received before the previous message finished")]
    UnfinishedMessage,

    /// Text message is not valid UTF-8.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Close payload is one byte long or carries a non UTF-8 reason.
    #[error("Invalid close frame payload")]
    InvalidClosePayload,

    /// Attempt to encode a reserved opcode.
    #[error("Cannot encode reserved opcode {0:#x}")]
    ReservedOpcode(u8),
}

/// Which side of the connection the codec serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Decodes masked frames, encodes unmasked frames.
    Server,
    /// Decodes unmasked frames, encodes masked frames.
    Client,
}

/// Encode a frame into a buffer.
///
/// The header uses the shortest length encoding; if the frame carries a mask
/// the payload is masked while being copied.
///
/// # Errors
///
/// Returns an error for reserved opcodes and malformed control frames.
pub fn encode_frame(frame: &Frame, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    if let OpCode::Reserved(bits) = frame.opcode {
        return Err(ProtocolError::ReservedOpcode(bits));
    }

    let len = frame.payload.len();
    if frame.opcode.is_control() {
        if !frame.fin {
            return Err(ProtocolError::FragmentedControl);
        }
        if len > MAX_CONTROL_PAYLOAD {
            return Err(ProtocolError::ControlTooLarge(len as u64));
        }
    }

    buf.reserve(MAX_HEADER_SIZE + len);

    let fin_bit = if frame.fin { 0x80 } else { 0x00 };
    buf.put_u8(fin_bit | u8::from(frame.opcode));

    let mask_bit = if frame.mask.is_some() { 0x80 } else { 0x00 };
    if len < 126 {
        buf.put_u8(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }

    match frame.mask {
        Some(key) => {
            buf.extend_from_slice(&key);
            let start = buf.len();
            buf.extend_from_slice(&frame.payload);
            apply_mask(&mut buf[start..], key);
        }
        None => buf.extend_from_slice(&frame.payload),
    }

    Ok(())
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(frame))` if a complete frame was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error. The size
/// limit is checked against the declared length, before the payload is
/// buffered.
///
/// # Errors
///
/// Returns an error if the frame is too large or malformed.
pub fn decode_frame(
    buf: &mut BytesMut,
    role: Role,
    max_frame_size: usize,
) -> Result<Option<Frame>, ProtocolError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];

    if first & 0x70 != 0 {
        return Err(ProtocolError::ReservedBits);
    }

    let fin = first & 0x80 != 0;
    let opcode = OpCode::from(first);
    let masked = second & 0x80 != 0;

    let (length, mut offset) = match second & 0x7F {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        n => (u64::from(n), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(ProtocolError::FragmentedControl);
        }
        if length > MAX_CONTROL_PAYLOAD as u64 {
            return Err(ProtocolError::ControlTooLarge(length));
        }
    }

    if length > max_frame_size as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: max_frame_size,
        });
    }

    match (role, masked) {
        (Role::Server, false) => return Err(ProtocolError::UnmaskedFrame),
        (Role::Client, true) => return Err(ProtocolError::UnexpectedMask),
        _ => {}
    }

    let length = length as usize;
    let mask_len = if masked { 4 } else { 0 };
    let total_size = offset + mask_len + length;
    if buf.len() < total_size {
        buf.reserve(total_size - buf.len());
        return Ok(None);
    }

    let mask = if masked {
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    buf.advance(offset);
    let mut payload = buf.split_to(length);
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        fin,
        opcode,
        mask,
        payload: payload.freeze(),
    }))
}

/// A data message whose final fragment has not arrived yet.
#[derive(Debug)]
struct Partial {
    opcode: OpCode,
    data: BytesMut,
}

/// Message-level codec.
///
/// Reassembles fragmented data messages, passes control messages through as
/// soon as they arrive (even between fragments) and drops frames with
/// reserved opcodes.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    max_frame_size: usize,
    max_message_size: usize,
    partial: Option<Partial>,
}

impl FrameCodec {
    /// Create a codec with default limits.
    #[must_use]
    pub fn new(role: Role) -> Self {
        Self::with_limits(role, DEFAULT_MAX_FRAME_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a server-side codec with default limits.
    #[must_use]
    pub fn server() -> Self {
        Self::new(Role::Server)
    }

    /// Create a client-side codec with default limits.
    #[must_use]
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Create a codec with explicit frame and message limits.
    #[must_use]
    pub fn with_limits(role: Role, max_frame_size: usize, max_message_size: usize) -> Self {
        Self {
            role,
            max_frame_size,
            max_message_size,
            partial: None,
        }
    }

    /// Get the codec role.
    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Get the maximum frame payload size.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Get the maximum reassembled message size.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a message as a single final frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload exceeds the frame limit or the message
    /// is a control message with more than 125 bytes of payload.
    pub fn encode(&self, message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        if message.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: message.len() as u64,
                max: self.max_frame_size,
            });
        }

        let mut frame = message.clone().into_frame();
        if self.role == Role::Client {
            frame = frame.masked(mask_key());
        }
        encode_frame(&frame, buf)
    }

    /// Encode a message into a fresh buffer.
    ///
    /// # Errors
    ///
    /// See [`FrameCodec::encode`].
    pub fn encode_to_bytes(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(MAX_HEADER_SIZE + message.len());
        self.encode(message, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Try to decode the next complete message from a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error on any protocol violation; the codec should not be
    /// used afterwards.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        loop {
            let Some(frame) = decode_frame(buf, self.role, self.max_frame_size)? else {
                return Ok(None);
            };

            match frame.opcode {
                OpCode::Reserved(_) => continue,
                OpCode::Close => {
                    validate_close_payload(&frame.payload)?;
                    return Ok(Some(Message::from_parts(OpCode::Close, frame.payload)));
                }
                OpCode::Ping | OpCode::Pong => {
                    return Ok(Some(Message::from_parts(frame.opcode, frame.payload)));
                }
                OpCode::Text | OpCode::Binary => {
                    if self.partial.is_some() {
                        return Err(ProtocolError::UnfinishedMessage);
                    }
                    self.check_message_size(frame.payload.len())?;

                    if frame.fin {
                        return finish(frame.opcode, frame.payload).map(Some);
                    }
                    self.partial = Some(Partial {
                        opcode: frame.opcode,
                        data: BytesMut::from(&frame.payload[..]),
                    });
                }
                OpCode::Continuation => {
                    let Some(partial) = self.partial.as_mut() else {
                        return Err(ProtocolError::UnexpectedContinuation);
                    };

                    let size = partial.data.len() + frame.payload.len();
                    if size > self.max_message_size {
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            max: self.max_message_size,
                        });
                    }
                    partial.data.extend_from_slice(&frame.payload);

                    if frame.fin {
                        if let Some(done) = self.partial.take() {
                            return finish(done.opcode, done.data.freeze()).map(Some);
                        }
                    }
                }
            }
        }
    }

    fn check_message_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::server()
    }
}

fn finish(opcode: OpCode, payload: Bytes) -> Result<Message, ProtocolError> {
    if opcode == OpCode::Text && std::str::from_utf8(&payload).is_err() {
        return Err(ProtocolError::InvalidUtf8);
    }
    Ok(Message::from_parts(opcode, payload))
}

fn validate_close_payload(payload: &[u8]) -> Result<(), ProtocolError> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(ProtocolError::InvalidClosePayload),
        _ => {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if !is_valid_close_code(code) {
                return Err(ProtocolError::InvalidClosePayload);
            }
            std::str::from_utf8(&payload[2..])
                .map(|_| ())
                .map_err(|_| ProtocolError::InvalidClosePayload)
        }
    }
}

/// Status codes a peer may put on the wire.
///
/// 1005, 1006 and 1015 are reserved for local reporting only.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Generate a masking key for client frames.
fn mask_key() -> [u8; 4] {
    rand::random()
}
