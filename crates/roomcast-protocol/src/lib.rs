//! # roomcast-protocol
//!
//! WebSocket framing for the Roomcast fanout engine.
//!
//! This crate turns bytes read from an upgraded connection into whole
//! messages and back. It knows nothing about rooms or hubs.
//!
//! ## Opcodes
//!
//! - `Text` / `Binary` - Application data, forwarded to the room
//! - `Ping` / `Pong` / `Close` - Control frames, handled by the connection
//! - Reserved opcodes - Skipped
//!
//! ## Example
//!
//! ```rust
//! use bytes::BytesMut;
//! use roomcast_protocol::{FrameCodec, Message};
//!
//! // A client masks what it sends, the server unmasks it
//! let client = FrameCodec::client();
//! let mut buf = BytesMut::new();
//! client.encode(&Message::text("Hello, room!"), &mut buf).unwrap();
//!
//! let mut server = FrameCodec::server();
//! let decoded = server.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded.as_text(), Some("Hello, room!"));
//! ```

pub mod codec;
pub mod frames;
pub mod message;

pub use codec::{decode_frame, encode_frame, FrameCodec, ProtocolError, Role};
pub use frames::{Frame, OpCode};
pub use message::{close_code, Message};
