//! A single established (or establishing) connection to one peer: routing of inbound
//!  datagrams, the online part of the handshake, keepalive pings, and the periodic flush
//!  that actually puts frames, acks and nacks on the wire.
//!
//! A connection runs two background tasks, one for flushing and one for keepalive. Both
//!  are aborted when the `Connection` is dropped.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ack::{deser_ack_datagram, ser_ack_datagram};
use crate::config::RaknetConfig;
use crate::error::RaknetError;
use crate::frame::{FrameSet, Reliability, FRAME_OVERHEAD_BUDGET, FRAME_SET_ID_RANGE};
use crate::message_dispatcher::MessageDispatcher;
use crate::packets::{
    ser_disconnect, ConnectedPing, ConnectedPong, ConnectionRequest, ConnectionRequestAccepted,
    NewIncomingConnection, OnlinePacket, PacketId,
};
use crate::receive_queue::ReceiveQueue;
use crate::send_queue::SendQueue;
use crate::send_socket::SendSocket;

/// Milliseconds since the Unix epoch, the timestamp format used by ping / pong and the
///  handshake packets.
pub(crate) fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    /// offline handshake complete, waiting for the online handshake to finish
    OnlineRequested,
    Connected,
    Disconnected,
}

struct ConnectionInner {
    peer_addr: SocketAddr,
    config: RaknetConfig,
    guid: u64,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    unanswered_pings: u32,
    socket: Arc<dyn SendSocket>,
    dispatcher: Arc<dyn MessageDispatcher>,
}

impl ConnectionInner {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        let _ = self.state_tx.send(state);
    }

    fn queue_control(&mut self, reliability: Reliability, payload: Bytes) {
        if let Err(e) = self.send_queue.insert(reliability, payload) {
            warn!("failed to queue control packet for {}: {}", self.peer_addr, e);
        }
    }
}

pub struct Connection {
    peer_addr: SocketAddr,
    inner: Arc<RwLock<ConnectionInner>>,
    state_rx: watch::Receiver<ConnectionState>,
    flush_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.flush_task.abort();
        self.keepalive_task.abort();
    }
}

impl Connection {
    /// A connection whose offline handshake (MTU and version negotiation) is complete.
    ///  `mtu` is the negotiated value, not the configured one.
    pub(crate) fn new(
        config: RaknetConfig,
        socket: Arc<dyn SendSocket>,
        dispatcher: Arc<dyn MessageDispatcher>,
        peer_addr: SocketAddr,
        guid: u64,
        mtu: u16,
    ) -> Arc<Connection> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::OnlineRequested);

        let inner = Arc::new(RwLock::new(ConnectionInner {
            peer_addr,
            config: config.clone(),
            guid,
            state: ConnectionState::OnlineRequested,
            state_tx,
            send_queue: SendQueue::new(mtu as usize - FRAME_OVERHEAD_BUDGET),
            receive_queue: ReceiveQueue::new(),
            unanswered_pings: 0,
            socket,
            dispatcher,
        }));

        let flush_task = tokio::spawn(flush_loop(inner.clone(), config.flush_interval));
        let keepalive_task = tokio::spawn(keepalive_loop(inner.clone(), config));

        Arc::new(Connection {
            peer_addr,
            inner,
            state_rx,
            flush_task,
            keepalive_task,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.read().await.state
    }

    pub async fn is_alive(&self) -> bool {
        self.state().await != ConnectionState::Disconnected
    }

    /// Enqueue an application message for the peer. It goes out with the next flush.
    pub async fn send(&self, reliability: Reliability, payload: Bytes) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state == ConnectionState::Disconnected {
            bail!("connection to {} is closed", self.peer_addr);
        }
        inner.send_queue.insert(reliability, payload)
    }

    /// Block until the online handshake completes (or fails).
    pub async fn wait_until_connected(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut rx = self.state_rx.clone();
        let result = tokio::time::timeout(timeout, async move {
            loop {
                let state = *rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected => bail!("connection was torn down during the handshake"),
                    ConnectionState::OnlineRequested => {}
                }
                if rx.changed().await.is_err() {
                    bail!("connection was dropped during the handshake");
                }
            }
        }).await;

        match result {
            Ok(r) => r,
            Err(_) => bail!(RaknetError::HandshakeTimeout),
        }
    }

    /// Orderly shutdown: tell the peer, then tear down locally.
    pub async fn disconnect(&self) {
        {
            let mut inner = self.inner.write().await;
            if inner.state == ConnectionState::Disconnected {
                return;
            }
            let mut buf = BytesMut::new();
            ser_disconnect(&mut buf);
            inner.queue_control(Reliability::ReliableOrdered, buf.freeze());
        }
        if let Err(e) = flush_once(&self.inner).await {
            debug!("failed to flush disconnect notification to {}: {}", self.peer_addr, e);
        }
        teardown(&self.inner).await;
    }

    /// Client side of the online handshake: announce ourselves once the offline
    ///  handshake has negotiated the parameters.
    pub(crate) async fn initiate_online_handshake(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.write().await;
        let mut buf = BytesMut::new();
        ConnectionRequest {
            guid: inner.guid,
            timestamp: unix_millis(),
        }.ser(&mut buf);
        inner.queue_control(Reliability::ReliableOrdered, buf.freeze());
        drop(inner);

        flush_once(&self.inner).await
    }

    /// Feed a datagram received from this connection's peer. Malformed datagrams are
    ///  logged and discarded without affecting connection state.
    pub async fn on_datagram(&self, data: &[u8]) {
        if let Err(e) = self.handle_datagram(data).await {
            warn!("discarding malformed datagram from {}: {}", self.peer_addr, e);
        }
    }

    async fn handle_datagram(&self, data: &[u8]) -> anyhow::Result<()> {
        let Some(&id) = data.first() else {
            bail!("empty datagram");
        };
        if self.inner.read().await.state == ConnectionState::Disconnected {
            debug!("ignoring datagram from disconnected peer {}", self.peer_addr);
            return Ok(());
        }

        if id == PacketId::Ack as u8 {
            let ranges = deser_ack_datagram(&mut &*data)?;
            let now = Instant::now();
            let mut inner = self.inner.write().await;
            for range in ranges {
                for seq in range.start..=range.end {
                    inner.send_queue.ack(seq, now);
                }
            }
            Ok(())
        }
        else if id == PacketId::Nack as u8 {
            let ranges = deser_ack_datagram(&mut &*data)?;
            let mut inner = self.inner.write().await;
            for range in ranges {
                for seq in range.start..=range.end {
                    inner.send_queue.nack(seq);
                }
            }
            Ok(())
        }
        else if FRAME_SET_ID_RANGE.contains(&id) {
            self.handle_frame_set(data).await
        }
        else {
            bail!("unexpected datagram id {:#04x}", id);
        }
    }

    async fn handle_frame_set(&self, data: &[u8]) -> anyhow::Result<()> {
        let frame_set = FrameSet::deser(&mut &*data)?;

        let mut messages = Vec::new();
        let mut disconnect = false;
        let dispatcher = {
            let mut inner = self.inner.write().await;
            for frame in frame_set.frames {
                inner.receive_queue.insert(frame);
            }

            for frame in inner.receive_queue.flush() {
                match OnlinePacket::decode(frame.payload) {
                    Ok(packet) => handle_online_packet(&mut inner, packet, &mut messages, &mut disconnect)?,
                    Err(e) => warn!("discarding malformed frame from {}: {}", self.peer_addr, e),
                }
            }
            inner.dispatcher.clone()
        };

        for message in messages {
            dispatcher.on_message(self.peer_addr, &message).await;
        }
        if disconnect {
            teardown(&self.inner).await;
            return Ok(());
        }

        // get replies and acks on the wire right away rather than waiting for the timer
        flush_once(&self.inner).await
    }
}

fn handle_online_packet(
    inner: &mut ConnectionInner,
    packet: OnlinePacket,
    messages: &mut Vec<Bytes>,
    disconnect: &mut bool,
) -> anyhow::Result<()> {
    match packet {
        OnlinePacket::ConnectedPing(ping) => {
            let mut buf = BytesMut::new();
            ConnectedPong {
                client_timestamp: ping.client_timestamp,
                server_timestamp: unix_millis(),
            }.ser(&mut buf);
            inner.queue_control(Reliability::Unreliable, buf.freeze());
        }
        OnlinePacket::ConnectedPong(_) => {
            inner.unanswered_pings = 0;
        }
        OnlinePacket::ConnectionRequest(request) => {
            // server side: accept and consider the connection established
            let mut buf = BytesMut::new();
            ConnectionRequestAccepted {
                client_address: inner.peer_addr,
                system_index: 0,
                request_timestamp: request.timestamp,
            }.ser(&mut buf)?;
            inner.queue_control(Reliability::ReliableOrdered, buf.freeze());

            if inner.state == ConnectionState::OnlineRequested {
                info!("peer {} connected", inner.peer_addr);
                inner.set_state(ConnectionState::Connected);
            }
        }
        OnlinePacket::ConnectionRequestAccepted(accepted) => {
            // client side: confirm and consider the connection established
            let mut buf = BytesMut::new();
            NewIncomingConnection {
                server_address: inner.peer_addr,
                request_timestamp: accepted.request_timestamp,
                accepted_timestamp: unix_millis(),
            }.ser(&mut buf)?;
            inner.queue_control(Reliability::ReliableOrdered, buf.freeze());

            if inner.state == ConnectionState::OnlineRequested {
                info!("connected to {}", inner.peer_addr);
                inner.set_state(ConnectionState::Connected);
            }
        }
        OnlinePacket::NewIncomingConnection(_) => {
            // the final confirmation carries nothing the engine still needs
        }
        OnlinePacket::Disconnect => {
            *disconnect = true;
        }
        OnlinePacket::UserData(data) => {
            messages.push(data);
        }
    }
    Ok(())
}

/// Put everything that is due on the wire: frames (fresh and retransmissions), then the
///  accumulated acks and nacks.
async fn flush_once(inner: &RwLock<ConnectionInner>) -> anyhow::Result<()> {
    let (socket, peer_addr, datagrams) = {
        let mut inner = inner.write().await;

        let mut datagrams = Vec::new();
        for frame in inner.send_queue.flush(Instant::now()) {
            let mut buf = BytesMut::new();
            FrameSet::single(frame).ser(&mut buf);
            datagrams.push(buf.freeze());
        }

        let acks = inner.receive_queue.drain_ack();
        if !acks.is_empty() {
            let mut buf = BytesMut::new();
            ser_ack_datagram(PacketId::Ack, &acks, &mut buf);
            datagrams.push(buf.freeze());
        }
        let nacks = inner.receive_queue.drain_nack();
        if !nacks.is_empty() {
            let mut buf = BytesMut::new();
            ser_ack_datagram(PacketId::Nack, &nacks, &mut buf);
            datagrams.push(buf.freeze());
        }

        (inner.socket.clone(), inner.peer_addr, datagrams)
    };

    for datagram in datagrams {
        socket.send_datagram(peer_addr, &datagram).await?;
    }
    Ok(())
}

/// Tear the connection down and notify the application, exactly once. Messages that are
///  already complete in the receive queue are still delivered first.
async fn teardown(inner: &RwLock<ConnectionInner>) {
    let (dispatcher, peer_addr, messages) = {
        let mut inner = inner.write().await;
        if inner.state == ConnectionState::Disconnected {
            return;
        }
        inner.set_state(ConnectionState::Disconnected);

        let mut messages = Vec::new();
        for frame in inner.receive_queue.flush() {
            if let Ok(OnlinePacket::UserData(data)) = OnlinePacket::decode(frame.payload) {
                messages.push(data);
            }
        }
        (inner.dispatcher.clone(), inner.peer_addr, messages)
    };

    info!("connection to {} closed", peer_addr);
    for message in messages {
        dispatcher.on_message(peer_addr, &message).await;
    }
    dispatcher.on_disconnect(peer_addr).await;
}

async fn flush_loop(inner: Arc<RwLock<ConnectionInner>>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        if inner.read().await.state == ConnectionState::Disconnected {
            break;
        }
        if let Err(e) = flush_once(&inner).await {
            let peer_addr = inner.read().await.peer_addr;
            warn!("failed to send to {}: {}", peer_addr, e);
        }
    }
}

/// Ping the peer at a per-connection randomized interval; tear down once too many pings
///  in a row went unanswered.
async fn keepalive_loop(inner: Arc<RwLock<ConnectionInner>>, config: RaknetConfig) {
    let interval = rand::thread_rng().gen_range(
        config.keepalive_interval_min..=config.keepalive_interval_max);

    loop {
        tokio::time::sleep(interval).await;

        let timed_out = {
            let mut inner = inner.write().await;
            match inner.state {
                ConnectionState::Disconnected => break,
                // half-open connections must time out too, or an abandoned handshake
                //  keeps the connection (and its server-side table entry) alive forever
                ConnectionState::OnlineRequested | ConnectionState::Connected => {}
            }

            if inner.unanswered_pings >= config.max_unanswered_pings {
                warn!("peer {} stopped answering pings", inner.peer_addr);
                true
            }
            else {
                inner.unanswered_pings += 1;
                let mut buf = BytesMut::new();
                ConnectedPing { client_timestamp: unix_millis() }.ser(&mut buf);
                inner.queue_control(Reliability::Unreliable, buf.freeze());
                false
            }
        };

        if timed_out {
            teardown(&inner).await;
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_dispatcher::MockMessageDispatcher;
    use crate::send_socket::MockSendSocket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type SentDatagrams = Arc<Mutex<Vec<Vec<u8>>>>;

    fn recording_socket() -> (Arc<MockSendSocket>, SentDatagrams) {
        let sent: SentDatagrams = Default::default();
        let mut socket = MockSendSocket::new();
        let recorded = sent.clone();
        socket.expect_send_datagram()
            .returning(move |_, data| {
                recorded.lock().unwrap().push(data.to_vec());
                Ok(())
            });
        (Arc::new(socket), sent)
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 19132))
    }

    fn connection(
        socket: Arc<MockSendSocket>,
        dispatcher: MockMessageDispatcher,
    ) -> Arc<Connection> {
        Connection::new(
            RaknetConfig::default(),
            socket,
            Arc::new(dispatcher),
            peer(),
            42,
            1400,
        )
    }

    /// wrap an online packet payload in a minimal frame-set datagram
    fn frame_set_datagram(seq: u32, reliable_index: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = crate::frame::Frame::new(Reliability::Reliable, Bytes::copy_from_slice(payload));
        frame.sequence_number = seq;
        frame.reliable_index = reliable_index;
        let mut buf = BytesMut::new();
        FrameSet::single(frame).ser(&mut buf);
        buf.to_vec()
    }

    fn sent_frame_payloads(sent: &SentDatagrams) -> Vec<Bytes> {
        sent.lock().unwrap().iter()
            .filter(|d| FRAME_SET_ID_RANGE.contains(&d[0]))
            .map(|d| {
                let mut read: &[u8] = d;
                FrameSet::deser(&mut read).unwrap().frames.remove(0).payload
            })
            .collect()
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_ping_is_answered_with_pong_and_ack() {
        let (socket, sent) = recording_socket();
        let conn = connection(socket, MockMessageDispatcher::new());

        let mut ping = BytesMut::new();
        ConnectedPing { client_timestamp: 1234 }.ser(&mut ping);
        conn.on_datagram(&frame_set_datagram(0, 0, &ping)).await;

        let pongs: Vec<Bytes> = sent_frame_payloads(&sent).into_iter()
            .filter(|p| p[0] == PacketId::ConnectedPong as u8)
            .collect();
        assert_eq!(pongs.len(), 1);
        let mut read: &[u8] = &pongs[0];
        assert_eq!(ConnectedPong::deser(&mut read).unwrap().client_timestamp, 1234);

        // the frame set itself is acknowledged
        assert!(sent.lock().unwrap().iter().any(|d| d[0] == PacketId::Ack as u8));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_user_data_is_dispatched() {
        let (socket, _sent) = recording_socket();

        let received = Arc::new(Mutex::new(Vec::new()));
        let recorded = received.clone();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_message()
            .returning(move |_, data| recorded.lock().unwrap().push(data.to_vec()));

        let conn = connection(socket, dispatcher);
        conn.on_datagram(&frame_set_datagram(0, 0, &[0xfe, 1, 2, 3])).await;

        assert_eq!(*received.lock().unwrap(), vec![vec![0xfe, 1, 2, 3]]);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_server_side_online_handshake() {
        let (socket, sent) = recording_socket();
        let conn = connection(socket, MockMessageDispatcher::new());
        assert_eq!(conn.state().await, ConnectionState::OnlineRequested);

        let mut request = BytesMut::new();
        ConnectionRequest { guid: 7, timestamp: 99 }.ser(&mut request);
        conn.on_datagram(&frame_set_datagram(0, 0, &request)).await;

        assert_eq!(conn.state().await, ConnectionState::Connected);
        let accepted: Vec<Bytes> = sent_frame_payloads(&sent).into_iter()
            .filter(|p| p[0] == PacketId::ConnectionRequestAccepted as u8)
            .collect();
        assert_eq!(accepted.len(), 1);
        let mut read: &[u8] = &accepted[0];
        let accepted = ConnectionRequestAccepted::deser(&mut read).unwrap();
        assert_eq!(accepted.client_address, peer());
        assert_eq!(accepted.request_timestamp, 99);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_client_side_online_handshake() {
        let (socket, sent) = recording_socket();
        let conn = connection(socket, MockMessageDispatcher::new());
        conn.initiate_online_handshake().await.unwrap();

        assert!(sent_frame_payloads(&sent).iter()
            .any(|p| p[0] == PacketId::ConnectionRequest as u8));

        let mut accepted = BytesMut::new();
        ConnectionRequestAccepted {
            client_address: SocketAddr::from(([127, 0, 0, 1], 5000)),
            system_index: 0,
            request_timestamp: 1,
        }.ser(&mut accepted).unwrap();
        conn.on_datagram(&frame_set_datagram(0, 0, &accepted)).await;

        assert_eq!(conn.state().await, ConnectionState::Connected);
        assert!(sent_frame_payloads(&sent).iter()
            .any(|p| p[0] == PacketId::NewIncomingConnection as u8));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_peer_disconnect_notifies_once() {
        let (socket, _sent) = recording_socket();

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_disconnect()
            .returning(move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        let conn = connection(socket, dispatcher);
        conn.on_datagram(&frame_set_datagram(0, 0, &[PacketId::Disconnect as u8])).await;
        // a duplicate disconnect (e.g. retransmitted) must not notify again
        conn.on_datagram(&frame_set_datagram(1, 1, &[PacketId::Disconnect as u8])).await;

        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_keepalive_timeout_tears_down() {
        let (socket, sent) = recording_socket();

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_disconnect()
            .returning(move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        let conn = connection(socket, dispatcher);

        // complete the server-side handshake so keepalive becomes active
        let mut request = BytesMut::new();
        ConnectionRequest { guid: 7, timestamp: 99 }.ser(&mut request);
        conn.on_datagram(&frame_set_datagram(0, 0, &request)).await;
        assert_eq!(conn.state().await, ConnectionState::Connected);

        // no pongs ever arrive; 6 pings plus the final check take at most 7 * 1.5s
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        let pings = sent_frame_payloads(&sent).iter()
            .filter(|p| p[0] == PacketId::ConnectedPing as u8)
            .count();
        assert_eq!(pings, 6);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_half_open_connection_times_out() {
        let (socket, _sent) = recording_socket();

        let disconnects = Arc::new(AtomicUsize::new(0));
        let counter = disconnects.clone();
        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_disconnect()
            .returning(move |_| { counter.fetch_add(1, Ordering::SeqCst); });

        // the online handshake never completes and the peer stays silent
        let conn = connection(socket, dispatcher);
        assert_eq!(conn.state().await, ConnectionState::OnlineRequested);

        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(conn.state().await, ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_pong_resets_keepalive_counter() {
        let (socket, _sent) = recording_socket();
        let conn = connection(socket, MockMessageDispatcher::new());

        let mut request = BytesMut::new();
        ConnectionRequest { guid: 7, timestamp: 99 }.ser(&mut request);
        conn.on_datagram(&frame_set_datagram(0, 0, &request)).await;

        // answer every ping interval with a pong; the connection must stay up far beyond
        //  the unanswered-ping limit
        for i in 0..20u32 {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            let mut pong = BytesMut::new();
            ConnectedPong { client_timestamp: 0, server_timestamp: 0 }.ser(&mut pong);
            conn.on_datagram(&frame_set_datagram(1 + i, 1 + i, &pong)).await;
        }

        assert_eq!(conn.state().await, ConnectionState::Connected);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_send_on_closed_connection_fails() {
        let (socket, _sent) = recording_socket();

        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_disconnect().returning(|_| ());

        let conn = connection(socket, dispatcher);
        conn.disconnect().await;

        assert!(conn.send(Reliability::Reliable, Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_disconnect_notifies_peer() {
        let (socket, sent) = recording_socket();

        let mut dispatcher = MockMessageDispatcher::new();
        dispatcher.expect_on_disconnect().returning(|_| ());

        let conn = connection(socket, dispatcher);
        conn.disconnect().await;

        assert!(sent_frame_payloads(&sent).iter()
            .any(|p| p[0] == PacketId::Disconnect as u8));
        assert_eq!(conn.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_malformed_datagram_is_isolated() {
        let (socket, _sent) = recording_socket();
        let conn = connection(socket, MockMessageDispatcher::new());

        conn.on_datagram(&[]).await;
        conn.on_datagram(&[0x84, 1, 2]).await;
        conn.on_datagram(&[0x42, 1, 2, 3]).await;

        assert!(conn.is_alive().await);
    }
}
