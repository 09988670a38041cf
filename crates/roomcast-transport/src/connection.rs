//! Connection pump: one reader and one writer per upgraded stream.
//!
//! The read pump decodes messages from the peer and hands data messages to
//! the room's hub. The write pump drains the connection's outbound queue,
//! answers control frames and sends keepalive pings. Whichever pump exits
//! first tears the connection down.

use bytes::{Bytes, BytesMut};
use roomcast_core::{ConnectionId, Hub, Outbound};
use roomcast_protocol::{close_code, FrameCodec, Message, OpCode, ProtocolError, Role};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::error::TransportError;

/// Replies queued from the read pump to the write pump.
const CONTROL_QUEUE_CAPACITY: usize = 16;

/// Bytes reserved ahead of every socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Time allowed to write one message to the peer.
    pub write_wait: Duration,
    /// Time allowed between pongs from the peer.
    pub pong_wait: Duration,
    /// Interval between keepalive pings. Must be less than `pong_wait`.
    pub ping_period: Duration,
    /// Capacity of the outbound queue.
    pub outbound_capacity: usize,
    /// Maximum frame payload accepted from the peer.
    pub max_frame_size: usize,
    /// Maximum reassembled message accepted from the peer.
    pub max_message_size: usize,
}

impl ConnectionConfig {
    /// Set `pong_wait`, deriving `ping_period` as 90% of it.
    #[must_use]
    pub fn with_pong_wait(mut self, pong_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.ping_period = pong_wait * 9 / 10;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(10),
            pong_wait: Duration::from_secs(60),
            ping_period: Duration::from_secs(54),
            outbound_capacity: roomcast_core::hub::DEFAULT_OUTBOUND_CAPACITY,
            max_frame_size: roomcast_protocol::codec::DEFAULT_MAX_FRAME_SIZE,
            max_message_size: roomcast_protocol::codec::DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// A connection that has joined a room.
///
/// The member for `id` must already be registered with `hub`, with
/// `outbound` as its queue.
pub struct Connection<S> {
    id: ConnectionId,
    hub: Hub,
    stream: S,
    outbound: Outbound,
    config: ConnectionConfig,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Create a new connection.
    pub fn new(
        id: ConnectionId,
        hub: Hub,
        stream: S,
        outbound: Outbound,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            id,
            hub,
            stream,
            outbound,
            config,
        }
    }

    /// Get the connection ID.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Pump messages until either side gives up.
    ///
    /// On return the connection has been unregistered from its hub and the
    /// stream has been shut down.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the connection. A close handshake
    /// started by either side ends it with `Ok`.
    pub async fn run(self) -> Result<(), TransportError> {
        let Self {
            id,
            hub,
            stream,
            outbound,
            config,
        } = self;
        let room = hub.room();

        let (mut reader, mut writer) = tokio::io::split(stream);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);

        let result = {
            let read = read_pump(&mut reader, &hub, id, control_tx, &config);
            let write = write_pump(&mut writer, outbound, control_rx, &config);
            tokio::pin!(read, write);

            tokio::select! {
                result = &mut read => {
                    // Closes the outbound queue, which ends the write pump
                    let _ = hub.unregister(id).await;
                    match timeout(config.write_wait, &mut write).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!(connection = %id, error = %e, "Write pump failed during teardown"),
                        Err(_) => debug!(connection = %id, "Write pump did not finish in time"),
                    }
                    result
                }
                result = &mut write => {
                    let _ = hub.unregister(id).await;
                    result
                }
            }
        };

        let mut stream = reader.unsplit(writer);
        if let Ok(Err(e)) = timeout(config.write_wait, stream.shutdown()).await {
            trace!(connection = %id, error = %e, "Shutdown failed");
        }

        match &result {
            Ok(()) => debug!(room = %room, connection = %id, "Connection closed"),
            Err(e) => debug!(room = %room, connection = %id, error = %e, "Connection ended"),
        }
        result
    }
}

async fn read_pump<R>(
    reader: &mut R,
    hub: &Hub,
    id: ConnectionId,
    control: mpsc::Sender<Message>,
    config: &ConnectionConfig,
) -> Result<(), TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut codec = FrameCodec::with_limits(
        Role::Server,
        config.max_frame_size,
        config.max_message_size,
    );
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let mut deadline = Instant::now() + config.pong_wait;

    loop {
        let message = match codec.decode(&mut buf) {
            Ok(Some(message)) => message,
            Ok(None) => {
                buf.reserve(READ_CHUNK);
                let read = timeout_at(deadline, reader.read_buf(&mut buf))
                    .await
                    .map_err(|_| TransportError::DeadlineExceeded("read"))??;
                if read == 0 {
                    return Err(TransportError::ConnectionClosed);
                }
                continue;
            }
            Err(error) => {
                warn!(connection = %id, error = %error, "Protocol violation");
                let code = match error {
                    ProtocolError::FrameTooLarge { .. } | ProtocolError::MessageTooLarge { .. } => {
                        close_code::MESSAGE_TOO_BIG
                    }
                    _ => close_code::PROTOCOL_ERROR,
                };
                let _ = control.try_send(Message::close(code, ""));
                return Err(error.into());
            }
        };

        match message.opcode() {
            OpCode::Ping => {
                // Dropped if the writer is backed up; the peer will ping again
                let _ = control.try_send(Message::pong(message.payload().clone()));
            }
            OpCode::Pong => {
                deadline = Instant::now() + config.pong_wait;
            }
            OpCode::Close => {
                let reply = match message.close_code() {
                    Some(code) => Message::close(code, ""),
                    None => Message::close_empty(),
                };
                let _ = control.try_send(reply);
                debug!(connection = %id, code = ?message.close_code(), "Peer closed connection");
                return Ok(());
            }
            _ => {
                trace!(connection = %id, size = message.len(), "Received message");
                hub.broadcast(message).await?;
            }
        }
    }
}

async fn write_pump<W>(
    writer: &mut W,
    mut outbound: Outbound,
    mut control: mpsc::Receiver<Message>,
    config: &ConnectionConfig,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    // Outbound messages were reassembled from other peers and go out whole
    let codec = FrameCodec::with_limits(
        Role::Server,
        config.max_frame_size.max(config.max_message_size),
        config.max_message_size,
    );
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let period = config.ping_period.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            Some(reply) = control.recv() => {
                let is_close = reply.is_close();
                write_message(writer, &codec, &mut buf, &reply, config.write_wait).await?;
                if is_close {
                    return Ok(());
                }
            }
            message = outbound.recv() => match message {
                Some(message) => {
                    write_message(writer, &codec, &mut buf, &message, config.write_wait).await?;
                }
                None => {
                    let close = Message::close(close_code::NORMAL, "");
                    write_message(writer, &codec, &mut buf, &close, config.write_wait).await?;
                    return Ok(());
                }
            },
            _ = ticker.tick() => {
                write_message(writer, &codec, &mut buf, &Message::ping(Bytes::new()), config.write_wait).await?;
            }
        }
    }
}

async fn write_message<W>(
    writer: &mut W,
    codec: &FrameCodec,
    buf: &mut BytesMut,
    message: &Message,
    write_wait: Duration,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    buf.clear();
    codec.encode(message, buf)?;

    timeout(write_wait, async {
        writer.write_all(buf).await?;
        writer.flush().await
    })
    .await
    .map_err(|_| TransportError::DeadlineExceeded("write"))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use roomcast_core::{HubConfig, Member, RoomId};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    struct Peer {
        stream: DuplexStream,
        codec: FrameCodec,
        buf: BytesMut,
    }

    impl Peer {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                codec: FrameCodec::client(),
                buf: BytesMut::new(),
            }
        }

        async fn send(&mut self, message: &Message) {
            let bytes = self.codec.encode_to_bytes(message).unwrap();
            self.stream.write_all(&bytes).await.unwrap();
        }

        async fn send_raw(&mut self, bytes: &[u8]) {
            self.stream.write_all(bytes).await.unwrap();
        }

        /// Next message from the server, or `None` at end of stream.
        async fn recv(&mut self) -> Option<Message> {
            loop {
                if let Some(message) = self.codec.decode(&mut self.buf).unwrap() {
                    return Some(message);
                }
                if self.stream.read_buf(&mut self.buf).await.unwrap() == 0 {
                    return None;
                }
            }
        }
    }

    async fn start(
        hub: &Hub,
        config: ConnectionConfig,
    ) -> (Peer, JoinHandle<Result<(), TransportError>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let id = ConnectionId::next();
        let (member, outbound) = Member::channel(id, config.outbound_capacity);
        hub.register(member).await.unwrap();

        let task = tokio::spawn(Connection::new(id, hub.clone(), server, outbound, config).run());
        (Peer::new(client), task)
    }

    fn spawn_hub() -> Hub {
        Hub::spawn(RoomId::new(), HubConfig::default())
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let hub = spawn_hub();
        let (mut peer, _task) = start(&hub, ConnectionConfig::default()).await;

        peer.send(&Message::ping("are you there")).await;

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.opcode(), OpCode::Pong);
        assert_eq!(&reply.payload()[..], b"are you there");
    }

    #[tokio::test]
    async fn test_data_is_broadcast_to_room() {
        let hub = spawn_hub();
        let (observer, mut observer_rx) = Member::channel(ConnectionId::next(), 8);
        hub.register(observer).await.unwrap();

        let (mut peer, _task) = start(&hub, ConnectionConfig::default()).await;
        peer.send(&Message::text("hello")).await;

        let seen = observer_rx.recv().await.unwrap();
        assert_eq!(seen.as_text(), Some("hello"));

        // The sender is a member too
        let echoed = peer.recv().await.unwrap();
        assert_eq!(echoed.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_fragmented_message_is_broadcast_whole() {
        let hub = spawn_hub();
        let (observer, mut observer_rx) = Member::channel(ConnectionId::next(), 8);
        hub.register(observer).await.unwrap();

        let (mut peer, _task) = start(&hub, ConnectionConfig::default()).await;
        // "Hel" + "lo", masked with a zero key
        peer.send_raw(&[0x01, 0x83, 0, 0, 0, 0, b'H', b'e', b'l']).await;
        peer.send_raw(&[0x80, 0x82, 0, 0, 0, 0, b'l', b'o']).await;

        let seen = observer_rx.recv().await.unwrap();
        assert_eq!(seen.as_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn test_hub_messages_are_written() {
        let hub = spawn_hub();
        let (mut peer, _task) = start(&hub, ConnectionConfig::default()).await;

        hub.broadcast(Arc::new(Message::binary(vec![7u8; 300])))
            .await
            .unwrap();

        let message = peer.recv().await.unwrap();
        assert_eq!(message.opcode(), OpCode::Binary);
        assert_eq!(message.len(), 300);
    }

    #[tokio::test]
    async fn test_close_is_echoed() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        peer.send(&Message::close(close_code::NORMAL, "bye")).await;

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.close_code(), Some(close_code::NORMAL));
        assert!(peer.recv().await.is_none());

        assert!(task.await.unwrap().is_ok());
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reserved_close_code_is_not_echoed() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        // 1005 may never appear on the wire
        peer.send(&Message::close(1005, "")).await;

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.close_code(), Some(close_code::PROTOCOL_ERROR));
        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::Protocol(ProtocolError::InvalidClosePayload))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_writer_is_reaped() {
        let hub = spawn_hub();
        let config = ConnectionConfig::default();
        let write_wait = config.write_wait;

        // The peer never reads, so a large message can't fit the pipe
        let (client, server) = tokio::io::duplex(64);
        let id = ConnectionId::next();
        let (member, outbound) = Member::channel(id, config.outbound_capacity);
        hub.register(member).await.unwrap();
        let task = tokio::spawn(Connection::new(id, hub.clone(), server, outbound, config).run());

        let start = Instant::now();
        hub.broadcast(Message::binary(vec![0u8; 4096])).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::DeadlineExceeded("write"))
        ));
        assert!(start.elapsed() >= write_wait);
        assert_eq!(hub.member_count().await.unwrap(), 0);
        drop(client);
    }

    #[tokio::test]
    async fn test_unmasked_frame_closes_with_protocol_error() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        // Unmasked text frame "hi"
        peer.send_raw(&[0x81, 0x02, b'h', b'i']).await;

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.close_code(), Some(close_code::PROTOCOL_ERROR));
        assert!(peer.recv().await.is_none());

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(TransportError::Protocol(ProtocolError::UnmaskedFrame))
        ));
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_oversized_message_closes_with_1009() {
        let hub = spawn_hub();
        let config = ConnectionConfig {
            max_frame_size: 16,
            max_message_size: 16,
            ..Default::default()
        };
        let (mut peer, task) = start(&hub, config).await;

        peer.send(&Message::binary(vec![0u8; 17])).await;

        let reply = peer.recv().await.unwrap();
        assert_eq!(reply.close_code(), Some(close_code::MESSAGE_TOO_BIG));
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_hub_close_sends_close_frame() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        hub.close().await.unwrap();

        let reply = peer.recv().await.unwrap();
        assert!(reply.is_close());
        assert!(peer.recv().await.is_none());
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_peer_disconnect_unregisters() {
        let hub = spawn_hub();
        let (peer, task) = start(&hub, ConnectionConfig::default()).await;
        assert_eq!(hub.member_count().await.unwrap(), 1);

        drop(peer);

        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::ConnectionClosed)
        ));
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_is_reaped() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        // One keepalive ping at 54s goes unanswered
        let ping = peer.recv().await.unwrap();
        assert_eq!(ping.opcode(), OpCode::Ping);

        // The read deadline expires at 60s
        let close = peer.recv().await.unwrap();
        assert!(close.is_close());
        assert!(peer.recv().await.is_none());

        assert!(matches!(
            task.await.unwrap(),
            Err(TransportError::DeadlineExceeded("read"))
        ));
        assert_eq!(hub.member_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_peer_alive() {
        let hub = spawn_hub();
        let (mut peer, task) = start(&hub, ConnectionConfig::default()).await;

        for _ in 0..4 {
            let ping = peer.recv().await.unwrap();
            assert_eq!(ping.opcode(), OpCode::Ping);
            peer.send(&Message::pong(ping.payload().clone())).await;
        }

        // Well past several pong_wait periods
        assert!(!task.is_finished());
        assert_eq!(hub.member_count().await.unwrap(), 1);
    }

    #[test]
    fn test_with_pong_wait_derives_ping_period() {
        let config = ConnectionConfig::default().with_pong_wait(Duration::from_secs(10));
        assert_eq!(config.ping_period, Duration::from_secs(9));

        let defaults = ConnectionConfig::default();
        assert!(defaults.ping_period < defaults.pong_wait);
    }
}
