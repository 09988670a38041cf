//! Room registry for Roomcast.
//!
//! The registry maps room IDs to running hubs. Lookups and creation are safe
//! from any number of tasks: concurrent `get_or_create` calls for the same
//! room always resolve to the same hub.

use crate::hub::{Hub, HubConfig};
use crate::room::RoomId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Creating the room would exceed the configured limit.
    #[error("Maximum number of rooms reached ({0})")]
    RoomLimitReached(usize),

    /// No Tokio runtime is available to run a new hub.
    #[error("No async runtime available for room hub")]
    NoRuntime,
}

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live rooms.
    pub max_rooms: usize,
    /// Configuration applied to every new hub.
    pub hub: HubConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            hub: HubConfig::default(),
        }
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Live rooms.
    pub rooms: usize,
    /// Hubs spawned since the registry was created.
    pub hubs_created: u64,
}

/// Room registry.
pub struct Registry {
    rooms: DashMap<RoomId, Hub>,
    room_count: AtomicUsize,
    hubs_created: AtomicU64,
    config: RegistryConfig,
}

impl Registry {
    /// Create a new registry with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration.
    #[must_use]
    pub fn with_config(config: RegistryConfig) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            rooms: DashMap::new(),
            room_count: AtomicUsize::new(0),
            hubs_created: AtomicU64::new(0),
            config,
        }
    }

    /// Get the registry configuration.
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Return the room's hub, spawning it if the room has none.
    ///
    /// The check and the insert happen under the same map entry lock, so
    /// concurrent callers for one room never spawn two hubs.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::RoomLimitReached`] when a new room would
    /// exceed `max_rooms`, and [`RegistryError::NoRuntime`] when called
    /// outside a Tokio runtime. The registry is left unchanged on error.
    pub fn get_or_create(&self, room: RoomId) -> Result<Hub, RegistryError> {
        match self.rooms.entry(room) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    return Ok(entry.get().clone());
                }
                // The hub stopped without being deleted; replace it in place
                let hub = self.spawn_hub(room)?;
                entry.insert(hub.clone());
                Ok(hub)
            }
            Entry::Vacant(entry) => {
                let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;

                let max = self.config.max_rooms;
                self.room_count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                        (count < max).then_some(count + 1)
                    })
                    .map_err(|_| RegistryError::RoomLimitReached(max))?;

                let hub = Hub::spawn_on(room, self.config.hub.clone(), &runtime);
                self.hubs_created.fetch_add(1, Ordering::Relaxed);
                debug!(room = %room, "Created room hub");

                Ok(entry.insert(hub).clone())
            }
        }
    }

    fn spawn_hub(&self, room: RoomId) -> Result<Hub, RegistryError> {
        let runtime = Handle::try_current().map_err(|_| RegistryError::NoRuntime)?;
        let hub = Hub::spawn_on(room, self.config.hub.clone(), &runtime);
        self.hubs_created.fetch_add(1, Ordering::Relaxed);
        debug!(room = %room, "Respawned room hub");
        Ok(hub)
    }

    /// Return the room's hub without creating one.
    #[must_use]
    pub fn load(&self, room: RoomId) -> Option<Hub> {
        self.rooms.get(&room).map(|entry| entry.value().clone())
    }

    /// Check whether a room has a hub.
    #[must_use]
    pub fn contains(&self, room: RoomId) -> bool {
        self.rooms.contains_key(&room)
    }

    /// Remove a room and close its hub.
    ///
    /// Members of the room see their outbound queues close. Returns `false`
    /// if the room had no hub.
    pub async fn delete(&self, room: RoomId) -> bool {
        let Some((_, hub)) = self.rooms.remove(&room) else {
            return false;
        };
        self.room_count.fetch_sub(1, Ordering::AcqRel);

        // Already stopped is fine, the queues are closed either way
        let _ = hub.close().await;
        debug!(room = %room, "Deleted room hub");
        true
    }

    /// Close every hub. Used on shutdown.
    pub async fn close_all(&self) {
        let rooms = self.room_ids();
        let count = rooms.len();
        for room in rooms {
            self.delete(room).await;
        }
        info!(rooms = count, "Closed all room hubs");
    }

    /// Get the number of live rooms.
    #[must_use]
    pub fn len(&self) -> usize {
        self.room_count.load(Ordering::Acquire)
    }

    /// Check whether the registry has no rooms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// List the IDs of all live rooms.
    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    /// Get registry statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            rooms: self.len(),
            hubs_created: self.hubs_created.load(Ordering::Relaxed),
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Member;
    use crate::room::ConnectionId;
    use roomcast_protocol::Message;
    use std::sync::Arc;
    use tokio::sync::Barrier;

    #[tokio::test]
    async fn test_get_or_create_returns_same_hub() {
        let registry = Registry::new();
        let room = RoomId::new();

        let a = registry.get_or_create(room).unwrap();
        let b = registry.get_or_create(room).unwrap();

        assert!(a.same_hub(&b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().hubs_created, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_or_create_single_hub() {
        let registry = Arc::new(Registry::new());
        let room = RoomId::new();
        let barrier = Arc::new(Barrier::new(2));

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.get_or_create(room).unwrap()
                })
            })
            .collect();

        let mut hubs = Vec::new();
        for task in tasks {
            hubs.push(task.await.unwrap());
        }

        assert!(hubs[0].same_hub(&hubs[1]));
        assert_eq!(registry.stats().hubs_created, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_tasks_many_rooms() {
        let registry = Arc::new(Registry::new());
        let rooms: Vec<RoomId> = (0..4).map(|_| RoomId::new()).collect();
        let barrier = Arc::new(Barrier::new(32));

        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                let room = rooms[i % rooms.len()];
                tokio::spawn(async move {
                    barrier.wait().await;
                    registry.get_or_create(room).unwrap()
                })
            })
            .collect();

        let mut hubs = Vec::new();
        for task in tasks {
            hubs.push(task.await.unwrap());
        }

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.stats().hubs_created, 4);
        for hub in &hubs {
            let canonical = registry.load(hub.room()).unwrap();
            assert!(hub.same_hub(&canonical));
        }
    }

    #[tokio::test]
    async fn test_room_limit() {
        let registry = Registry::with_config(RegistryConfig {
            max_rooms: 2,
            ..Default::default()
        });
        let r1 = RoomId::new();
        let r2 = RoomId::new();

        registry.get_or_create(r1).unwrap();
        registry.get_or_create(r2).unwrap();

        let r3 = RoomId::new();
        assert_eq!(
            registry.get_or_create(r3).unwrap_err(),
            RegistryError::RoomLimitReached(2)
        );
        assert!(registry.load(r3).is_none());
        assert_eq!(registry.len(), 2);

        // Existing rooms are still served at the limit
        assert!(registry.get_or_create(r1).is_ok());

        // Deleting frees a slot
        assert!(registry.delete(r2).await);
        assert!(registry.get_or_create(r3).is_ok());
    }

    #[test]
    fn test_get_or_create_without_runtime() {
        let registry = Registry::new();
        assert_eq!(
            registry.get_or_create(RoomId::new()).unwrap_err(),
            RegistryError::NoRuntime
        );
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_load_does_not_create() {
        let registry = Registry::new();
        assert!(registry.load(RoomId::new()).is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.stats().hubs_created, 0);
    }

    #[tokio::test]
    async fn test_delete_closes_hub() {
        let registry = Registry::new();
        let room = RoomId::new();
        let hub = registry.get_or_create(room).unwrap();

        let (member, mut rx) = Member::channel(ConnectionId::next(), 4);
        hub.register(member).await.unwrap();

        assert!(registry.delete(room).await);
        assert!(!registry.delete(room).await);
        assert!(registry.load(room).is_none());

        assert!(rx.recv().await.is_none());
        hub.closed().await;
        assert!(hub.broadcast(Message::text("late")).await.is_err());

        // A later lookup gets a fresh hub
        let fresh = registry.get_or_create(room).unwrap();
        assert!(!fresh.same_hub(&hub));
        assert_eq!(registry.stats().hubs_created, 2);
    }

    #[tokio::test]
    async fn test_stopped_hub_is_replaced_in_place() {
        let registry = Registry::new();
        let room = RoomId::new();
        let stale = registry.get_or_create(room).unwrap();

        stale.close().await.unwrap();
        stale.closed().await;

        let fresh = registry.get_or_create(room).unwrap();
        assert!(!fresh.same_hub(&stale));
        assert!(!fresh.is_closed());
        assert!(registry.load(room).unwrap().same_hub(&fresh));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().hubs_created, 2);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = Registry::new();
        let hubs: Vec<Hub> = (0..3)
            .map(|_| registry.get_or_create(RoomId::new()).unwrap())
            .collect();

        registry.close_all().await;

        assert!(registry.is_empty());
        assert!(registry.room_ids().is_empty());
        for hub in &hubs {
            hub.closed().await;
        }
    }
}
