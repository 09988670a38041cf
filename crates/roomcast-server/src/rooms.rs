//! In-memory room directory.
//!
//! Records which rooms exist. A room's hub is only spawned once the first
//! client joins, so a room can be known here without being live in the
//! registry.

use dashmap::DashMap;
use roomcast_core::RoomId;
use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// A created room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoomRecord {
    /// Room ID.
    pub id: RoomId,
    /// Creation time in seconds since the Unix epoch.
    pub created_at: u64,
}

/// Directory of created rooms.
#[derive(Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomId, RoomRecord>,
}

impl RoomDirectory {
    /// Create an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room with a fresh ID.
    pub fn create(&self) -> RoomRecord {
        let record = RoomRecord {
            id: RoomId::new(),
            created_at: unix_now(),
        };
        self.rooms.insert(record.id, record);
        record
    }

    /// Look up a room.
    #[must_use]
    pub fn get(&self, id: RoomId) -> Option<RoomRecord> {
        self.rooms.get(&id).map(|entry| *entry.value())
    }

    /// List all rooms, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<RoomRecord> {
        let mut rooms: Vec<RoomRecord> = self.rooms.iter().map(|entry| *entry.value()).collect();
        rooms.sort_by_key(|record| (record.created_at, record.id));
        rooms
    }

    /// Remove a room, returning its record if it existed.
    pub fn remove(&self, id: RoomId) -> Option<RoomRecord> {
        self.rooms.remove(&id).map(|(_, record)| record)
    }

    /// Get the number of rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rooms.len()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
