//! The server side: one socket shared by all connections, with the receive loop
//!  answering offline packets (discovery pings, the handshake) and routing everything
//!  else to the connection of the sending address.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RaknetConfig;
use crate::connection::{Connection, ConnectionState};
use crate::message_dispatcher::{ConnectionEventHandler, MessageDispatcher};
use crate::packets::{
    AlreadyConnected, IncompatibleProtocolVersion, OfflinePacket, OpenConnectionReply1,
    OpenConnectionReply2, OpenConnectionRequest1, OpenConnectionRequest2, UnconnectedPing,
    UnconnectedPong,
};
use crate::send_socket::SendSocket;

type ConnectionMap = Arc<RwLock<FxHashMap<SocketAddr, Arc<Connection>>>>;

pub struct RaknetListener {
    local_addr: SocketAddr,
    guid: u64,
    connections: ConnectionMap,
    recv_task: JoinHandle<()>,
}

impl Drop for RaknetListener {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl RaknetListener {
    pub async fn bind(
        bind_addr: SocketAddr,
        config: RaknetConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
        event_handler: Arc<dyn ConnectionEventHandler>,
    ) -> anyhow::Result<RaknetListener> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        let guid: u64 = rand::random();
        let connections: ConnectionMap = Default::default();

        info!("listening on {}", local_addr);
        let recv_task = tokio::spawn(recv_loop(ListenerActor {
            socket,
            config,
            guid,
            connections: connections.clone(),
            dispatcher,
            event_handler,
        }));

        Ok(RaknetListener {
            local_addr,
            guid,
            connections,
            recv_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub async fn connection(&self, peer_addr: SocketAddr) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&peer_addr).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Orderly shutdown: disconnect every peer, then stop receiving.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> =
            self.connections.write().await.drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.disconnect().await;
        }
        self.recv_task.abort();
    }
}

/// Removes a connection's routing entry when it reports its disconnect, then forwards
///  the event to the application. This covers every teardown path, including keepalive
///  timeouts where no further datagram from the peer ever arrives.
struct TableCleanupDispatcher {
    connections: ConnectionMap,
    delegate: Arc<dyn MessageDispatcher>,
}

#[async_trait]
impl MessageDispatcher for TableCleanupDispatcher {
    async fn on_message(&self, from: SocketAddr, data: &[u8]) {
        self.delegate.on_message(from, data).await;
    }

    async fn on_disconnect(&self, peer: SocketAddr) {
        self.connections.write().await.remove(&peer);
        self.delegate.on_disconnect(peer).await;
    }
}

struct ListenerActor {
    socket: Arc<UdpSocket>,
    config: RaknetConfig,
    guid: u64,
    connections: ConnectionMap,
    dispatcher: Arc<dyn MessageDispatcher>,
    event_handler: Arc<dyn ConnectionEventHandler>,
}

async fn recv_loop(actor: ListenerActor) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let (len, from) = match actor.socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(e) => {
                warn!("listener socket receive failed: {}", e);
                break;
            }
        };

        match OfflinePacket::decode(&buf[..len]) {
            Some(Ok(packet)) => {
                if let Err(e) = actor.handle_offline_packet(packet, from).await {
                    warn!("failed to answer offline packet from {}: {}", from, e);
                }
            }
            Some(Err(e)) => {
                debug!("discarding malformed offline packet from {}: {}", from, e);
            }
            None => {
                actor.route_to_connection(&buf[..len], from).await;
            }
        }
    }
}

impl ListenerActor {
    async fn handle_offline_packet(&self, packet: OfflinePacket, from: SocketAddr) -> anyhow::Result<()> {
        match packet {
            OfflinePacket::UnconnectedPing(ping) => self.handle_unconnected_ping(ping, from).await,
            OfflinePacket::OpenConnectionRequest1(request) => self.handle_open_request_1(request, from).await,
            OfflinePacket::OpenConnectionRequest2(request) => self.handle_open_request_2(request, from).await,
            other => {
                debug!("ignoring offline packet {:?} from {}", other, from);
                Ok(())
            }
        }
    }

    async fn handle_unconnected_ping(&self, ping: UnconnectedPing, from: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        UnconnectedPong {
            time: ping.time,
            guid: self.guid,
            advertisement: self.config.advertisement.clone(),
        }.ser(&mut buf);
        self.socket.send_datagram(from, &buf).await
    }

    async fn handle_open_request_1(&self, request: OpenConnectionRequest1, from: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        if request.protocol_version != self.config.protocol_version {
            info!("rejecting {}: peer protocol version {:#04x}, ours {:#04x}",
                from, request.protocol_version, self.config.protocol_version);
            IncompatibleProtocolVersion {
                server_protocol: self.config.protocol_version,
                server_guid: self.guid,
            }.ser(&mut buf);
        }
        else {
            OpenConnectionReply1 {
                guid: self.guid,
                mtu: u16::min(self.config.mtu, request.mtu),
            }.ser(&mut buf);
        }
        self.socket.send_datagram(from, &buf).await
    }

    async fn handle_open_request_2(&self, request: OpenConnectionRequest2, from: SocketAddr) -> anyhow::Result<()> {
        if from.is_ipv6() {
            debug!("ignoring connection attempt from IPv6 address {}", from);
            return Ok(());
        }

        let mut connections = self.connections.write().await;
        if let Some(existing) = connections.get(&from) {
            match existing.state().await {
                ConnectionState::Disconnected => {
                    connections.remove(&from);
                }
                ConnectionState::Connected => {
                    // a fully established connection from this address exists, so this
                    //  is a different instance (or an attack), not a retransmission
                    let mut buf = BytesMut::new();
                    AlreadyConnected { guid: self.guid }.ser(&mut buf);
                    return self.socket.send_datagram(from, &buf).await;
                }
                ConnectionState::OnlineRequested => {
                    // our reply 2 got lost, answer the retransmission again
                    return self.send_open_reply_2(request, from).await;
                }
            }
        }

        let mtu = u16::min(self.config.mtu, request.mtu);
        let connection = Connection::new(
            self.config.clone(),
            Arc::new(self.socket.clone()) as Arc<dyn SendSocket>,
            Arc::new(TableCleanupDispatcher {
                connections: self.connections.clone(),
                delegate: self.dispatcher.clone(),
            }),
            from,
            self.guid,
            mtu,
        );
        connections.insert(from, connection.clone());
        drop(connections);

        info!("new incoming connection from {} (MTU {})", from, mtu);
        self.send_open_reply_2(request, from).await?;
        self.event_handler.on_new_connection(connection).await;
        Ok(())
    }

    async fn send_open_reply_2(&self, request: OpenConnectionRequest2, from: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        OpenConnectionReply2 {
            guid: self.guid,
            client_address: from,
            mtu: u16::min(self.config.mtu, request.mtu),
        }.ser(&mut buf)?;
        self.socket.send_datagram(from, &buf).await
    }

    async fn route_to_connection(&self, data: &[u8], from: SocketAddr) {
        let connection = self.connections.read().await.get(&from).cloned();
        let Some(connection) = connection else {
            debug!("ignoring datagram from unknown peer {}", from);
            return;
        };

        connection.on_datagram(data).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RaknetClient;
    use crate::frame::Reliability;
    use crate::message_dispatcher::MessageDispatcher;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;

    /// records messages and disconnects, for integration-style tests over loopback
    #[derive(Default)]
    struct RecordingDispatcher {
        messages: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        disconnects: Mutex<Vec<SocketAddr>>,
    }

    #[async_trait]
    impl MessageDispatcher for RecordingDispatcher {
        async fn on_message(&self, from: SocketAddr, data: &[u8]) {
            self.messages.lock().unwrap().push((from, data.to_vec()));
        }

        async fn on_disconnect(&self, peer: SocketAddr) {
            self.disconnects.lock().unwrap().push(peer);
        }
    }

    #[derive(Default)]
    struct RecordingEventHandler {
        connections: Mutex<Vec<Arc<Connection>>>,
    }

    #[async_trait]
    impl ConnectionEventHandler for RecordingEventHandler {
        async fn on_new_connection(&self, connection: Arc<Connection>) {
            self.connections.lock().unwrap().push(connection);
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("condition was not reached in time");
    }

    async fn bind_listener(
        dispatcher: Arc<RecordingDispatcher>,
        event_handler: Arc<RecordingEventHandler>,
    ) -> RaknetListener {
        RaknetListener::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            RaknetConfig {
                advertisement: "test server".to_string(),
                ..RaknetConfig::default()
            },
            dispatcher,
            event_handler,
        ).await.unwrap()
    }

    #[tokio::test]
    async fn test_loopback_connect_and_exchange() {
        let server_dispatcher = Arc::new(RecordingDispatcher::default());
        let event_handler = Arc::new(RecordingEventHandler::default());
        let listener = bind_listener(server_dispatcher.clone(), event_handler.clone()).await;

        let client_dispatcher = Arc::new(RecordingDispatcher::default());
        let client = RaknetClient::connect(
            listener.local_addr(),
            RaknetConfig::default(),
            client_dispatcher.clone(),
        ).await.unwrap();

        assert_eq!(listener.connection_count().await, 1);
        eventually(|| !event_handler.connections.lock().unwrap().is_empty()).await;

        // client to server
        client.send(Reliability::ReliableOrdered, Bytes::from_static(&[0xfe, b'h', b'i'])).await.unwrap();
        eventually(|| !server_dispatcher.messages.lock().unwrap().is_empty()).await;
        assert_eq!(server_dispatcher.messages.lock().unwrap()[0].1, vec![0xfe, b'h', b'i']);

        // server to client, via the connection handle from the event callback
        let server_side = event_handler.connections.lock().unwrap()[0].clone();
        server_side.send(Reliability::ReliableOrdered, Bytes::from_static(&[0xfe, b'y', b'o'])).await.unwrap();
        eventually(|| !client_dispatcher.messages.lock().unwrap().is_empty()).await;
        assert_eq!(client_dispatcher.messages.lock().unwrap()[0].1, vec![0xfe, b'y', b'o']);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_loopback_fragmented_message() {
        let server_dispatcher = Arc::new(RecordingDispatcher::default());
        let event_handler = Arc::new(RecordingEventHandler::default());
        let listener = bind_listener(server_dispatcher.clone(), event_handler.clone()).await;

        let client = RaknetClient::connect(
            listener.local_addr(),
            RaknetConfig::default(),
            Arc::new(RecordingDispatcher::default()),
        ).await.unwrap();

        // far bigger than one frame at MTU 1400, forcing fragmentation and reassembly
        let mut big = vec![0xfeu8];
        big.extend((0..20_000u32).map(|i| i as u8));
        client.send(Reliability::ReliableOrdered, Bytes::from(big.clone())).await.unwrap();

        eventually(|| !server_dispatcher.messages.lock().unwrap().is_empty()).await;
        assert_eq!(server_dispatcher.messages.lock().unwrap()[0].1, big);

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_client_disconnect_reaches_server() {
        let server_dispatcher = Arc::new(RecordingDispatcher::default());
        let event_handler = Arc::new(RecordingEventHandler::default());
        let listener = bind_listener(server_dispatcher.clone(), event_handler.clone()).await;

        let client = RaknetClient::connect(
            listener.local_addr(),
            RaknetConfig::default(),
            Arc::new(RecordingDispatcher::default()),
        ).await.unwrap();

        client.disconnect().await;
        assert!(!client.is_alive().await);

        eventually(|| !server_dispatcher.disconnects.lock().unwrap().is_empty()).await;
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_silently_dead_peer_is_removed_from_routing_table() {
        let listener = RaknetListener::bind(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            RaknetConfig {
                keepalive_interval_min: Duration::from_millis(50),
                keepalive_interval_max: Duration::from_millis(60),
                max_unanswered_pings: 2,
                ..RaknetConfig::default()
            },
            Arc::new(RecordingDispatcher::default()),
            Arc::new(RecordingEventHandler::default()),
        ).await.unwrap();

        let client = RaknetClient::connect(
            listener.local_addr(),
            RaknetConfig::default(),
            Arc::new(RecordingDispatcher::default()),
        ).await.unwrap();
        assert_eq!(listener.connection_count().await, 1);

        // the client goes away without an orderly disconnect; the keepalive timeout must
        //  reap the server-side connection together with its routing entry
        drop(client);
        tokio::time::timeout(Duration::from_secs(10), async {
            while listener.connection_count().await != 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.expect("dead connection was not removed from the routing table");

        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconnected_ping_is_answered() {
        let listener = bind_listener(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(RecordingEventHandler::default()),
        ).await;

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut buf = BytesMut::new();
        UnconnectedPing { time: 1234, guid: 77 }.ser(&mut buf);
        probe.send_to(&buf, listener.local_addr()).await.unwrap();

        let mut recv_buf = vec![0u8; 64 * 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(5), probe.recv_from(&mut recv_buf))
            .await.unwrap().unwrap();
        assert_eq!(from, listener.local_addr());

        let mut read: &[u8] = &recv_buf[..len];
        let pong = UnconnectedPong::deser(&mut read).unwrap();
        assert_eq!(pong.guid, listener.guid());
        assert_eq!(pong.advertisement, "test server");
    }

    #[tokio::test]
    async fn test_incompatible_client_is_rejected() {
        let listener = bind_listener(
            Arc::new(RecordingDispatcher::default()),
            Arc::new(RecordingEventHandler::default()),
        ).await;

        let err = RaknetClient::connect(
            listener.local_addr(),
            RaknetConfig {
                protocol_version: 0x42,
                handshake_timeout: Duration::from_millis(200),
                ..RaknetConfig::default()
            },
            Arc::new(RecordingDispatcher::default()),
        ).await.unwrap_err();

        assert_eq!(
            err.downcast::<crate::error::RaknetError>().unwrap(),
            crate::error::RaknetError::IncompatibleProtocolVersion { ours: 0x42, theirs: 0xb }
        );
        assert_eq!(listener.connection_count().await, 0);
    }
}
