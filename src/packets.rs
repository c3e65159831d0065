//! Codecs for the offline (handshake) packets and the online control packets that travel
//!  inside frames. Every packet consumes / writes its own id byte, so a serialized packet
//!  is a complete datagram body (offline) or frame payload (online).

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;

use crate::wire::{RaknetBufExt, RaknetBufMutExt};

use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketId {
    ConnectedPing = 0x00,
    UnconnectedPing1 = 0x01,
    UnconnectedPing2 = 0x02,
    ConnectedPong = 0x03,
    OpenConnectionRequest1 = 0x05,
    OpenConnectionReply1 = 0x06,
    OpenConnectionRequest2 = 0x07,
    OpenConnectionReply2 = 0x08,
    ConnectionRequest = 0x09,
    ConnectionRequestAccepted = 0x10,
    AlreadyConnected = 0x12,
    NewIncomingConnection = 0x13,
    Disconnect = 0x15,
    IncompatibleProtocolVersion = 0x19,
    UnconnectedPong = 0x1c,
    Nack = 0xa0,
    Ack = 0xc0,
}

fn expect_id(buf: &mut impl Buf, expected: PacketId) -> anyhow::Result<()> {
    let actual = buf.try_get_u8()?;
    if actual != expected as u8 {
        bail!("expected packet id {:#04x}, found {:#04x}", expected as u8, actual);
    }
    Ok(())
}

/// The number of bytes a datagram adds on top of the padded body of an offline request 1,
///  by convention of the protocol: the MTU probe declares "a datagram of my preferred MTU
///  made it through" by its sheer size.
const OPEN_REQUEST_1_OVERHEAD: usize = 28;

//------------------------------------------------------------------------------------------
// offline packets - these travel as raw datagrams, before any connection state exists
//------------------------------------------------------------------------------------------

/// An MTU probe and protocol version announcement. The requested MTU is not a field but
///  is encoded in the datagram's size: the body is zero-padded so that the datagram plus
///  lower-layer overhead adds up to the MTU the client wants to negotiate.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionRequest1 {
    pub protocol_version: u8,
    pub mtu: u16,
}

impl OpenConnectionRequest1 {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::OpenConnectionRequest1 as u8);
        buf.put_magic();
        buf.put_u8(self.protocol_version);
        let padding = self.mtu as usize - OPEN_REQUEST_1_OVERHEAD - 1 - 16 - 1;
        buf.put_bytes(0, padding);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenConnectionRequest1> {
        expect_id(buf, PacketId::OpenConnectionRequest1)?;
        buf.try_get_magic()?;
        let protocol_version = buf.try_get_u8()?;
        // the padding length determines the MTU the peer asks for
        let mtu = buf.remaining() + OPEN_REQUEST_1_OVERHEAD + 1 + 16 + 1;
        buf.advance(buf.remaining());
        Ok(OpenConnectionRequest1 {
            protocol_version,
            mtu: mtu.try_into()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionReply1 {
    pub guid: u64,
    pub mtu: u16,
}

impl OpenConnectionReply1 {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::OpenConnectionReply1 as u8);
        buf.put_magic();
        buf.put_u64(self.guid);
        buf.put_u8(0); // encryption is not supported
        buf.put_u16(self.mtu);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenConnectionReply1> {
        expect_id(buf, PacketId::OpenConnectionReply1)?;
        buf.try_get_magic()?;
        let guid = buf.try_get_u64()?;
        let _use_encryption = buf.try_get_u8()?;
        let mtu = buf.try_get_u16()?;
        Ok(OpenConnectionReply1 { guid, mtu })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionRequest2 {
    /// the server address as seen by the client
    pub server_address: SocketAddr,
    pub mtu: u16,
    pub guid: u64,
}

impl OpenConnectionRequest2 {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(PacketId::OpenConnectionRequest2 as u8);
        buf.put_magic();
        buf.put_address(self.server_address)?;
        buf.put_u16(self.mtu);
        buf.put_u64(self.guid);
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenConnectionRequest2> {
        expect_id(buf, PacketId::OpenConnectionRequest2)?;
        buf.try_get_magic()?;
        Ok(OpenConnectionRequest2 {
            server_address: buf.try_get_address()?,
            mtu: buf.try_get_u16()?,
            guid: buf.try_get_u64()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct OpenConnectionReply2 {
    pub guid: u64,
    /// the client address as seen by the server
    pub client_address: SocketAddr,
    pub mtu: u16,
}

impl OpenConnectionReply2 {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(PacketId::OpenConnectionReply2 as u8);
        buf.put_magic();
        buf.put_u64(self.guid);
        buf.put_address(self.client_address)?;
        buf.put_u16(self.mtu);
        buf.put_u8(0); // encryption is not supported
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<OpenConnectionReply2> {
        expect_id(buf, PacketId::OpenConnectionReply2)?;
        buf.try_get_magic()?;
        let result = OpenConnectionReply2 {
            guid: buf.try_get_u64()?,
            client_address: buf.try_get_address()?,
            mtu: buf.try_get_u16()?,
        };
        let _use_encryption = buf.try_get_u8()?;
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct IncompatibleProtocolVersion {
    pub server_protocol: u8,
    pub server_guid: u64,
}

impl IncompatibleProtocolVersion {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::IncompatibleProtocolVersion as u8);
        buf.put_u8(self.server_protocol);
        buf.put_magic();
        buf.put_u64(self.server_guid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<IncompatibleProtocolVersion> {
        expect_id(buf, PacketId::IncompatibleProtocolVersion)?;
        let server_protocol = buf.try_get_u8()?;
        buf.try_get_magic()?;
        let server_guid = buf.try_get_u64()?;
        Ok(IncompatibleProtocolVersion { server_protocol, server_guid })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AlreadyConnected {
    pub guid: u64,
}

impl AlreadyConnected {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::AlreadyConnected as u8);
        buf.put_magic();
        buf.put_u64(self.guid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<AlreadyConnected> {
        expect_id(buf, PacketId::AlreadyConnected)?;
        buf.try_get_magic()?;
        Ok(AlreadyConnected { guid: buf.try_get_u64()? })
    }
}

/// A server discovery probe. Two id bytes exist for historic reasons and are treated
///  identically, the reply mirrors the probe's timestamp.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnconnectedPing {
    pub time: i64,
    pub guid: u64,
}

impl UnconnectedPing {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::UnconnectedPing1 as u8);
        buf.put_i64(self.time);
        buf.put_magic();
        buf.put_u64(self.guid);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UnconnectedPing> {
        let id = buf.try_get_u8()?;
        if id != PacketId::UnconnectedPing1 as u8 && id != PacketId::UnconnectedPing2 as u8 {
            bail!("expected an unconnected ping, found id {:#04x}", id);
        }
        let time = buf.try_get_i64()?;
        buf.try_get_magic()?;
        let guid = buf.try_get_u64()?;
        Ok(UnconnectedPing { time, guid })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UnconnectedPong {
    pub time: i64,
    pub guid: u64,
    /// free-text server info, shown in server browsers
    pub advertisement: String,
}

impl UnconnectedPong {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::UnconnectedPong as u8);
        buf.put_i64(self.time);
        buf.put_u64(self.guid);
        buf.put_magic();
        buf.put_string(&self.advertisement);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<UnconnectedPong> {
        expect_id(buf, PacketId::UnconnectedPong)?;
        let time = buf.try_get_i64()?;
        let guid = buf.try_get_u64()?;
        buf.try_get_magic()?;
        let advertisement = buf.try_get_string()?;
        Ok(UnconnectedPong { time, guid, advertisement })
    }
}

/// Everything that can arrive on a socket outside an established connection, dispatched
///  on the id byte. Datagrams with ids that have no offline meaning are not represented
///  here - the caller routes those to the connection for the sender address, if any.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OfflinePacket {
    UnconnectedPing(UnconnectedPing),
    UnconnectedPong(UnconnectedPong),
    OpenConnectionRequest1(OpenConnectionRequest1),
    OpenConnectionReply1(OpenConnectionReply1),
    OpenConnectionRequest2(OpenConnectionRequest2),
    OpenConnectionReply2(OpenConnectionReply2),
    IncompatibleProtocolVersion(IncompatibleProtocolVersion),
    AlreadyConnected(AlreadyConnected),
}

impl OfflinePacket {
    /// `None` means "not an offline packet" rather than a decode failure.
    pub fn decode(data: &[u8]) -> Option<anyhow::Result<OfflinePacket>> {
        use OfflinePacket::*;

        let id = PacketId::try_from(*data.first()?).ok()?;
        let mut buf = data;
        let result = match id {
            PacketId::UnconnectedPing1 | PacketId::UnconnectedPing2 =>
                self::UnconnectedPing::deser(&mut buf).map(UnconnectedPing),
            PacketId::UnconnectedPong =>
                self::UnconnectedPong::deser(&mut buf).map(UnconnectedPong),
            PacketId::OpenConnectionRequest1 =>
                self::OpenConnectionRequest1::deser(&mut buf).map(OpenConnectionRequest1),
            PacketId::OpenConnectionReply1 =>
                self::OpenConnectionReply1::deser(&mut buf).map(OpenConnectionReply1),
            PacketId::OpenConnectionRequest2 =>
                self::OpenConnectionRequest2::deser(&mut buf).map(OpenConnectionRequest2),
            PacketId::OpenConnectionReply2 =>
                self::OpenConnectionReply2::deser(&mut buf).map(OpenConnectionReply2),
            PacketId::IncompatibleProtocolVersion =>
                self::IncompatibleProtocolVersion::deser(&mut buf).map(IncompatibleProtocolVersion),
            PacketId::AlreadyConnected =>
                self::AlreadyConnected::deser(&mut buf).map(AlreadyConnected),
            _ => return None,
        };
        Some(result)
    }
}

//------------------------------------------------------------------------------------------
// online packets - these travel as frame payloads inside an established connection
//------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectedPing {
    pub client_timestamp: i64,
}

impl ConnectedPing {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::ConnectedPing as u8);
        buf.put_i64(self.client_timestamp);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectedPing> {
        expect_id(buf, PacketId::ConnectedPing)?;
        Ok(ConnectedPing { client_timestamp: buf.try_get_i64()? })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectedPong {
    pub client_timestamp: i64,
    pub server_timestamp: i64,
}

impl ConnectedPong {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::ConnectedPong as u8);
        buf.put_i64(self.client_timestamp);
        buf.put_i64(self.server_timestamp);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectedPong> {
        expect_id(buf, PacketId::ConnectedPong)?;
        Ok(ConnectedPong {
            client_timestamp: buf.try_get_i64()?,
            server_timestamp: buf.try_get_i64()?,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionRequest {
    pub guid: u64,
    pub timestamp: i64,
}

impl ConnectionRequest {
    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u8(PacketId::ConnectionRequest as u8);
        buf.put_u64(self.guid);
        buf.put_i64(self.timestamp);
        buf.put_u8(0); // encryption is not supported
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionRequest> {
        expect_id(buf, PacketId::ConnectionRequest)?;
        let result = ConnectionRequest {
            guid: buf.try_get_u64()?,
            timestamp: buf.try_get_i64()?,
        };
        let _use_encryption = buf.try_get_u8()?;
        Ok(result)
    }
}

/// The wire format carries ten "system addresses" that nothing in this protocol family
///  actually evaluates. They are written as fixed placeholders and skipped on read.
const NUM_SYSTEM_ADDRESSES: usize = 10;

fn skip_system_addresses(buf: &mut impl Buf) -> anyhow::Result<()> {
    for _ in 0..NUM_SYSTEM_ADDRESSES {
        let _ = buf.try_get_address()?;
    }
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ConnectionRequestAccepted {
    /// the client address as seen by the server
    pub client_address: SocketAddr,
    pub system_index: u16,
    pub request_timestamp: i64,
}

impl ConnectionRequestAccepted {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(PacketId::ConnectionRequestAccepted as u8);
        buf.put_address(self.client_address)?;
        buf.put_u16(self.system_index);
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.put_address(SocketAddr::from(([255, 255, 255, 255], 19132)))?;
        }
        // the established wire format carries the request timestamp twice
        buf.put_i64(self.request_timestamp);
        buf.put_i64(self.request_timestamp);
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<ConnectionRequestAccepted> {
        expect_id(buf, PacketId::ConnectionRequestAccepted)?;
        let client_address = buf.try_get_address()?;
        let system_index = buf.try_get_u16()?;
        skip_system_addresses(buf)?;
        let request_timestamp = buf.try_get_i64()?;
        let _ = buf.try_get_i64()?;
        Ok(ConnectionRequestAccepted {
            client_address,
            system_index,
            request_timestamp,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewIncomingConnection {
    /// the server address as seen by the client
    pub server_address: SocketAddr,
    pub request_timestamp: i64,
    pub accepted_timestamp: i64,
}

impl NewIncomingConnection {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        buf.put_u8(PacketId::NewIncomingConnection as u8);
        buf.put_address(self.server_address)?;
        for _ in 0..NUM_SYSTEM_ADDRESSES {
            buf.put_address(SocketAddr::from(([0, 0, 0, 0], 0)))?;
        }
        buf.put_i64(self.request_timestamp);
        buf.put_i64(self.accepted_timestamp);
        Ok(())
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<NewIncomingConnection> {
        expect_id(buf, PacketId::NewIncomingConnection)?;
        let server_address = buf.try_get_address()?;
        skip_system_addresses(buf)?;
        Ok(NewIncomingConnection {
            server_address,
            request_timestamp: buf.try_get_i64()?,
            accepted_timestamp: buf.try_get_i64()?,
        })
    }
}

/// A control packet or user payload arriving inside a frame. Ids without an engine-level
///  meaning are user data and handed to the application verbatim.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum OnlinePacket {
    ConnectedPing(ConnectedPing),
    ConnectedPong(ConnectedPong),
    ConnectionRequest(ConnectionRequest),
    ConnectionRequestAccepted(ConnectionRequestAccepted),
    NewIncomingConnection(NewIncomingConnection),
    Disconnect,
    UserData(Bytes),
}

impl OnlinePacket {
    pub fn decode(payload: Bytes) -> anyhow::Result<OnlinePacket> {
        use OnlinePacket::*;

        let Some(&id) = payload.first() else {
            bail!("empty frame payload");
        };
        let mut buf = payload.as_ref();
        match PacketId::try_from(id) {
            Ok(PacketId::ConnectedPing) => Ok(ConnectedPing(self::ConnectedPing::deser(&mut buf)?)),
            Ok(PacketId::ConnectedPong) => Ok(ConnectedPong(self::ConnectedPong::deser(&mut buf)?)),
            Ok(PacketId::ConnectionRequest) => Ok(ConnectionRequest(self::ConnectionRequest::deser(&mut buf)?)),
            Ok(PacketId::ConnectionRequestAccepted) => Ok(ConnectionRequestAccepted(self::ConnectionRequestAccepted::deser(&mut buf)?)),
            Ok(PacketId::NewIncomingConnection) => Ok(NewIncomingConnection(self::NewIncomingConnection::deser(&mut buf)?)),
            Ok(PacketId::Disconnect) => Ok(Disconnect),
            _ => Ok(UserData(payload)),
        }
    }
}

pub fn ser_disconnect(buf: &mut BytesMut) {
    buf.put_u8(PacketId::Disconnect as u8);
}
