//! Joining an upgraded stream to a room.

use roomcast_core::{ConnectionId, Member, Registry, RoomId};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::{Connection, ConnectionConfig};
use crate::error::TransportError;

/// A connection that has joined a room and is being pumped.
#[derive(Debug)]
pub struct Joined {
    /// The connection's ID.
    pub id: ConnectionId,
    /// The room it joined.
    pub room: RoomId,
    /// The pump task. Resolves once the connection is torn down.
    pub task: JoinHandle<Result<(), TransportError>>,
}

/// Join `stream` to `room`, creating the room's hub if needed.
///
/// The stream must already have completed the WebSocket upgrade. The
/// connection is registered before this returns, so it receives every
/// broadcast issued afterwards.
///
/// # Errors
///
/// Returns [`TransportError::Registry`] if the hub cannot be created and
/// [`TransportError::Hub`] if it closed before the connection registered.
/// The stream is dropped in both cases.
pub async fn join_room<S>(
    registry: &Registry,
    room: RoomId,
    stream: S,
    config: &ConnectionConfig,
) -> Result<Joined, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hub = registry.get_or_create(room)?;

    let id = ConnectionId::next();
    let (member, outbound) = Member::channel(id, config.outbound_capacity);
    hub.register(member).await?;
    debug!(room = %room, connection = %id, "Connection joined room");

    let connection = Connection::new(id, hub, stream, outbound, config.clone());
    let task = tokio::spawn(connection.run());

    Ok(Joined { id, room, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use roomcast_core::RegistryConfig;
    use roomcast_protocol::{FrameCodec, Message};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn recv(stream: &mut DuplexStream, codec: &mut FrameCodec, buf: &mut BytesMut) -> Message {
        loop {
            if let Some(message) = codec.decode(buf).unwrap() {
                return message;
            }
            assert_ne!(stream.read_buf(buf).await.unwrap(), 0, "stream ended");
        }
    }

    #[tokio::test]
    async fn test_two_peers_share_a_room() {
        let registry = Registry::new();
        let room = RoomId::new();
        let config = ConnectionConfig::default();

        let (mut alice, server_a) = tokio::io::duplex(16 * 1024);
        let (mut bob, server_b) = tokio::io::duplex(16 * 1024);
        let joined_a = join_room(&registry, room, server_a, &config).await.unwrap();
        let joined_b = join_room(&registry, room, server_b, &config).await.unwrap();

        assert_ne!(joined_a.id, joined_b.id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().hubs_created, 1);

        let client = FrameCodec::client();
        let frame = client.encode_to_bytes(&Message::text("hi bob")).unwrap();
        alice.write_all(&frame).await.unwrap();

        let mut codec = FrameCodec::client();
        let mut buf = BytesMut::new();
        let message = recv(&mut bob, &mut codec, &mut buf).await;
        assert_eq!(message.as_text(), Some("hi bob"));
    }

    #[tokio::test]
    async fn test_delete_room_closes_peers() {
        let registry = Registry::new();
        let room = RoomId::new();

        let (mut peer, server) = tokio::io::duplex(16 * 1024);
        let joined = join_room(&registry, room, server, &ConnectionConfig::default())
            .await
            .unwrap();

        assert!(registry.delete(room).await);

        let mut codec = FrameCodec::client();
        let mut buf = BytesMut::new();
        let message = recv(&mut peer, &mut codec, &mut buf).await;
        assert!(message.is_close());
        assert!(joined.task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_room_limit_is_reported() {
        let registry = Registry::with_config(RegistryConfig {
            max_rooms: 0,
            ..Default::default()
        });

        let (_peer, server) = tokio::io::duplex(1024);
        let err = join_room(&registry, RoomId::new(), server, &ConnectionConfig::default())
            .await
            .unwrap_err();

        assert!(matches!(err, TransportError::Registry(_)));
        assert!(registry.is_empty());
    }
}
