//! # roomcast-core
//!
//! Rooms, hubs and fan-out for the Roomcast realtime engine.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Room** - Room and connection identifiers
//! - **Hub** - Per-room actor that owns membership and fans messages out
//! - **Registry** - Concurrent map from room ID to its hub
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  broadcast  ┌─────────────┐  try_send  ┌─────────────┐
//! │  Connection │────────────▶│     Hub     │───────────▶│  Outbound   │
//! └─────────────┘             └─────────────┘            │  queues     │
//!        │                           ▲                   └─────────────┘
//!        │ get_or_create             │
//!        ▼                           │
//! ┌─────────────┐                    │
//! │  Registry   │────────────────────┘
//! └─────────────┘
//! ```

pub mod hub;
pub mod registry;
pub mod room;

pub use hub::{Hub, HubConfig, HubError, HubStats, Member, Outbound};
pub use registry::{Registry, RegistryConfig, RegistryError, RegistryStats};
pub use room::{ConnectionId, RoomId};
