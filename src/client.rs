//! The client side: offline handshake (protocol version check and MTU negotiation) and
//!  the socket receive loop feeding the resulting connection.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::RaknetConfig;
use crate::connection::Connection;
use crate::error::RaknetError;
use crate::frame::Reliability;
use crate::message_dispatcher::MessageDispatcher;
use crate::packets::{OfflinePacket, OpenConnectionRequest1, OpenConnectionRequest2};
use crate::send_socket::SendSocket;

pub struct RaknetClient {
    connection: Arc<Connection>,
    recv_task: JoinHandle<()>,
}

impl Drop for RaknetClient {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

impl std::fmt::Debug for RaknetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaknetClient")
            .field("peer_addr", &self.connection.peer_addr())
            .finish_non_exhaustive()
    }
}

impl RaknetClient {
    /// Connect to a server: negotiate protocol version and MTU, then complete the online
    ///  handshake. Returns once the connection is fully established.
    pub async fn connect(
        server_addr: SocketAddr,
        config: RaknetConfig,
        dispatcher: Arc<dyn MessageDispatcher>,
    ) -> anyhow::Result<RaknetClient> {
        config.validate()?;
        if server_addr.is_ipv6() {
            bail!("IPv6 peers are not supported by the wire format");
        }

        let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        socket.connect(server_addr).await?;
        let guid: u64 = rand::random();

        let mtu = offline_handshake(&socket, server_addr, &config, guid).await?;
        info!("negotiated MTU {} with {}", mtu, server_addr);

        let connection = Connection::new(
            config.clone(),
            Arc::new(socket.clone()) as Arc<dyn SendSocket>,
            dispatcher,
            server_addr,
            guid,
            mtu,
        );

        let recv_task = tokio::spawn(recv_loop(socket, connection.clone()));

        connection.initiate_online_handshake().await?;
        connection
            .wait_until_connected(config.handshake_timeout * config.handshake_retries)
            .await?;

        Ok(RaknetClient { connection, recv_task })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    pub async fn send(&self, reliability: Reliability, payload: Bytes) -> anyhow::Result<()> {
        self.connection.send(reliability, payload).await
    }

    pub async fn is_alive(&self) -> bool {
        self.connection.is_alive().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}

/// The two offline round trips. Returns the negotiated MTU.
async fn offline_handshake(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    config: &RaknetConfig,
    guid: u64,
) -> anyhow::Result<u16> {
    // round trip 1: announce protocol version, probe the path with a padded datagram
    let mut mtu = None;
    'attempts: for attempt in 0..config.handshake_retries {
        let mut buf = BytesMut::new();
        OpenConnectionRequest1 {
            protocol_version: config.protocol_version,
            mtu: config.mtu,
        }.ser(&mut buf);
        socket.send(&buf).await?;

        let deadline = Instant::now() + config.handshake_timeout;
        while let Some(reply) = await_offline_packet(socket, server_addr, deadline).await? {
            match reply {
                OfflinePacket::OpenConnectionReply1(reply) => {
                    mtu = Some(u16::min(config.mtu, reply.mtu));
                    break 'attempts;
                }
                OfflinePacket::IncompatibleProtocolVersion(reply) => {
                    bail!(RaknetError::IncompatibleProtocolVersion {
                        ours: config.protocol_version,
                        theirs: reply.server_protocol,
                    });
                }
                OfflinePacket::AlreadyConnected(_) => {
                    bail!("server considers this address already connected");
                }
                other => debug!("ignoring unexpected handshake packet {:?}", other),
            }
        }
        debug!("no reply to connection request 1, attempt {}", attempt + 1);
    }
    let Some(mtu) = mtu else {
        bail!(RaknetError::HandshakeTimeout);
    };

    // round trip 2: commit to the negotiated parameters
    for attempt in 0..config.handshake_retries {
        let mut buf = BytesMut::new();
        OpenConnectionRequest2 {
            server_address: server_addr,
            mtu,
            guid,
        }.ser(&mut buf)?;
        socket.send(&buf).await?;

        let deadline = Instant::now() + config.handshake_timeout;
        while let Some(reply) = await_offline_packet(socket, server_addr, deadline).await? {
            match reply {
                OfflinePacket::OpenConnectionReply2(reply) => {
                    return Ok(u16::min(mtu, reply.mtu));
                }
                OfflinePacket::AlreadyConnected(_) => {
                    bail!("server considers this address already connected");
                }
                other => debug!("ignoring unexpected handshake packet {:?}", other),
            }
        }
        debug!("no reply to connection request 2, attempt {}", attempt + 1);
    }
    bail!(RaknetError::HandshakeTimeout)
}

/// The next parseable offline packet from the server, or `None` once the deadline passes.
async fn await_offline_packet(
    socket: &UdpSocket,
    server_addr: SocketAddr,
    deadline: Instant,
) -> anyhow::Result<Option<OfflinePacket>> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }

        let received = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
        let (len, from) = match received {
            Ok(result) => result?,
            Err(_) => return Ok(None),
        };
        if from != server_addr {
            continue;
        }

        match OfflinePacket::decode(&buf[..len]) {
            Some(Ok(packet)) => return Ok(Some(packet)),
            Some(Err(e)) => debug!("discarding malformed handshake packet from {}: {}", from, e),
            None => debug!("discarding unexpected datagram during handshake from {}", from),
        }
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, connection: Arc<Connection>) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if from != connection.peer_addr() {
                    continue;
                }
                connection.on_datagram(&buf[..len]).await;
                if !connection.is_alive().await {
                    break;
                }
            }
            Err(e) => {
                debug!("client socket receive failed: {}", e);
                break;
            }
        }
    }
}
