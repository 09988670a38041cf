//! Per-room broadcast hub.
//!
//! A hub is an actor: one task owns the membership map and applies register,
//! unregister and broadcast events strictly in arrival order. [`Hub`] is the
//! cheap, cloneable handle used to send it events.
//!
//! Fan-out never waits on a member. Each member has a bounded outbound queue
//! and the hub only ever calls `try_send` on it; a full queue gets the member
//! evicted and its queue closed in the same pass.

use crate::room::{ConnectionId, RoomId};
use roomcast_protocol::Message;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Default hub inbox capacity.
pub const DEFAULT_INBOX_CAPACITY: usize = 1024;

/// Default per-member outbound queue capacity.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Receiving end of a member's outbound queue.
pub type Outbound = mpsc::Receiver<Arc<Message>>;

/// Hub errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The hub's event loop has stopped.
    #[error("Room hub is closed")]
    Closed,
}

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Capacity of the hub's event inbox.
    pub inbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
        }
    }
}

/// A connection's entry in a hub: its identity and the sending end of its
/// outbound queue.
#[derive(Debug)]
pub struct Member {
    id: ConnectionId,
    outbound: mpsc::Sender<Arc<Message>>,
}

impl Member {
    /// Create a member around an existing outbound sender.
    ///
    /// The hub must hold the only sender: the queue is closed by dropping it.
    #[must_use]
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Arc<Message>>) -> Self {
        Self { id, outbound }
    }

    /// Create a member with a fresh bounded outbound queue.
    #[must_use]
    pub fn channel(id: ConnectionId, capacity: usize) -> (Self, Outbound) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(id, tx), rx)
    }

    /// Get the member's connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    /// Currently registered members.
    pub members: usize,
    /// Messages broadcast since the hub started.
    pub broadcasts: u64,
    /// Successful enqueues across all members.
    pub deliveries: u64,
    /// Members evicted for a full outbound queue.
    pub evictions: u64,
}

enum HubEvent {
    Register(Member),
    Unregister(ConnectionId),
    Broadcast(Arc<Message>),
    Stats(oneshot::Sender<HubStats>),
    Close,
}

/// Handle to a running room hub.
#[derive(Debug, Clone)]
pub struct Hub {
    room: RoomId,
    inbox: mpsc::Sender<HubEvent>,
}

impl Hub {
    /// Spawn a hub on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime. Use [`Hub::spawn_on`] with
    /// an explicit handle otherwise.
    #[must_use]
    pub fn spawn(room: RoomId, config: HubConfig) -> Self {
        Self::spawn_on(room, config, &Handle::current())
    }

    /// Spawn a hub on the given runtime.
    #[must_use]
    pub fn spawn_on(room: RoomId, config: HubConfig, runtime: &Handle) -> Self {
        let (tx, rx) = mpsc::channel(config.inbox_capacity.max(1));
        let event_loop = HubLoop {
            room,
            inbox: rx,
            members: HashMap::new(),
            stats: HubStats::default(),
        };
        runtime.spawn(event_loop.run());
        Self { room, inbox: tx }
    }

    /// Get the room this hub serves.
    #[must_use]
    pub fn room(&self) -> RoomId {
        self.room
    }

    /// Check whether two handles point at the same hub.
    #[must_use]
    pub fn same_hub(&self, other: &Hub) -> bool {
        self.inbox.same_channel(&other.inbox)
    }

    /// Check whether the hub has stopped accepting events.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }

    /// Wait until the hub has stopped.
    pub async fn closed(&self) {
        self.inbox.closed().await;
    }

    /// Add a member to the room.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn register(&self, member: Member) -> Result<(), HubError> {
        self.send(HubEvent::Register(member)).await
    }

    /// Remove a member and close its outbound queue. Unknown IDs are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), HubError> {
        self.send(HubEvent::Unregister(id)).await
    }

    /// Fan a message out to every member.
    ///
    /// Waits only for room in the hub's inbox, never for members.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn broadcast(&self, message: impl Into<Arc<Message>>) -> Result<(), HubError> {
        self.send(HubEvent::Broadcast(message.into())).await
    }

    /// Get a snapshot of the hub's statistics.
    ///
    /// The snapshot reflects every event sent through this handle before the
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn stats(&self) -> Result<HubStats, HubError> {
        let (tx, rx) = oneshot::channel();
        self.send(HubEvent::Stats(tx)).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    /// Get the number of registered members.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub has stopped.
    pub async fn member_count(&self) -> Result<usize, HubError> {
        Ok(self.stats().await?.members)
    }

    /// Stop the hub, closing every member's outbound queue.
    ///
    /// Events queued behind the close are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the hub had already stopped.
    pub async fn close(&self) -> Result<(), HubError> {
        self.send(HubEvent::Close).await
    }

    async fn send(&self, event: HubEvent) -> Result<(), HubError> {
        self.inbox.send(event).await.map_err(|_| HubError::Closed)
    }
}

/// The hub's event loop state. Owned by exactly one task.
struct HubLoop {
    room: RoomId,
    inbox: mpsc::Receiver<HubEvent>,
    members: HashMap<ConnectionId, mpsc::Sender<Arc<Message>>>,
    stats: HubStats,
}

impl HubLoop {
    async fn run(mut self) {
        info!(room = %self.room, "Room hub started");

        while let Some(event) = self.inbox.recv().await {
            match event {
                HubEvent::Register(member) => self.register(member),
                HubEvent::Unregister(id) => self.unregister(id),
                HubEvent::Broadcast(message) => self.broadcast(&message),
                HubEvent::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                HubEvent::Close => {
                    self.inbox.close();
                    break;
                }
            }
        }

        let remaining = self.members.len();
        // Dropping the senders closes every outbound queue
        self.members.clear();
        info!(room = %self.room, remaining, "Room hub stopped");
    }

    fn register(&mut self, member: Member) {
        self.members.insert(member.id, member.outbound);
        debug!(
            room = %self.room,
            connection = %member.id,
            members = self.members.len(),
            "Member registered"
        );
    }

    fn unregister(&mut self, id: ConnectionId) {
        if self.members.remove(&id).is_some() {
            debug!(
                room = %self.room,
                connection = %id,
                members = self.members.len(),
                "Member unregistered"
            );
        }
    }

    fn broadcast(&mut self, message: &Arc<Message>) {
        let room = self.room;
        let mut delivered = 0u64;
        let mut evicted = 0u64;

        self.members
            .retain(|id, outbound| match outbound.try_send(Arc::clone(message)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    warn!(room = %room, connection = %id, "Slow consumer evicted");
                    evicted += 1;
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(room = %room, connection = %id, "Dropping member with closed queue");
                    false
                }
            });

        self.stats.broadcasts += 1;
        self.stats.deliveries += delivered;
        self.stats.evictions += evicted;

        trace!(room = %room, recipients = delivered, "Broadcast message");
    }

    fn snapshot(&self) -> HubStats {
        HubStats {
            members: self.members.len(),
            ..self.stats
        }
    }
}
