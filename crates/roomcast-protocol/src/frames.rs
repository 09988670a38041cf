//! Frame types for the WebSocket wire protocol.
//!
//! A frame is the unit the codec reads and writes. Data messages may span
//! several frames (a text or binary frame followed by continuations); control
//! frames always stand alone.

use bytes::Bytes;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented data message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
    /// Opcode reserved for future extensions.
    Reserved(u8),
}

impl OpCode {
    /// Check if this is a control opcode (close, ping, pong or a reserved
    /// control opcode).
    #[must_use]
    pub fn is_control(self) -> bool {
        u8::from(self) & 0x08 != 0
    }

    /// Check if this opcode carries application data.
    #[must_use]
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Continuation | OpCode::Text | OpCode::Binary)
    }

    /// Check if this opcode is reserved.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        matches!(self, OpCode::Reserved(_))
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        match op {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(bits) => bits & 0x0F,
        }
    }
}

impl From<u8> for OpCode {
    fn from(value: u8) -> Self {
        match value & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            bits => OpCode::Reserved(bits),
        }
    }
}

/// A single WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Masking key. Client-to-server frames are always masked.
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a final, unmasked frame.
    #[must_use]
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame.
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, payload)
    }

    /// Create a binary frame.
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, payload)
    }

    /// Create a continuation frame.
    #[must_use]
    pub fn continuation(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Continuation, payload)
    }

    /// Create a ping frame.
    #[must_use]
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, payload)
    }

    /// Create a pong frame.
    #[must_use]
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, payload)
    }

    /// Set the FIN bit.
    #[must_use]
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Mask the frame with the given key when encoded.
    #[must_use]
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }
}

/// XOR `data` in place with the masking key, starting at key offset 0.
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_classification() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(OpCode::Reserved(0xB).is_control());

        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert!(!OpCode::Reserved(0x3).is_control());
        assert!(!OpCode::Reserved(0x3).is_data());
    }

    #[test]
    fn test_opcode_conversion() {
        assert_eq!(OpCode::from(0x1), OpCode::Text);
        assert_eq!(OpCode::from(0xA), OpCode::Pong);
        assert_eq!(OpCode::from(0x3), OpCode::Reserved(0x3));
        assert_eq!(u8::from(OpCode::Close), 0x8);
        assert_eq!(u8::from(OpCode::Reserved(0xF)), 0xF);
    }

    #[test]
    fn test_mask_is_involution() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut data = b"Hello".to_vec();
        apply_mask(&mut data, key);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
        apply_mask(&mut data, key);
        assert_eq!(data, b"Hello");
    }
}
