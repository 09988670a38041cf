//! # roomcast-transport
//!
//! Connection handling for the Roomcast realtime engine.
//!
//! This crate sits between an upgraded byte stream and a room hub:
//!
//! - **Handshake** - Validates upgrade requests and computes the accept key
//! - **Connection** - Read and write pumps with keepalive deadlines
//! - **Join** - Registers a stream with a room and spawns its pumps
//!
//! The pumps are generic over any `AsyncRead + AsyncWrite` stream, so tests
//! drive them with in-memory duplex pipes.
//!
//! ```rust,ignore
//! use roomcast_transport::{join_room, ConnectionConfig};
//!
//! async fn on_upgrade(registry: &Registry, room: RoomId, stream: TokioIo<Upgraded>) {
//!     let joined = join_room(registry, room, stream, &ConnectionConfig::default()).await?;
//!     tracing::info!("{} joined {}", joined.id, joined.room);
//! }
//! ```

pub mod connection;
pub mod error;
pub mod handshake;
pub mod join;

pub use connection::{Connection, ConnectionConfig};
pub use error::{HandshakeError, TransportError};
pub use handshake::accept_key;
pub use join::{join_room, Joined};
