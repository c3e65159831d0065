//! A reliable-UDP transport engine speaking the RakNet wire protocol, bit-compatible
//!  with the implementations used by Minecraft Bedrock and other RakNet-family servers.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *messages* (defined-length chunks of data as
//!   opposed to streams of bytes), each with a per-message reliability mode:
//!   * `Unreliable`: fire and forget
//!   * `UnreliableSequenced`: fire and forget, but stale messages (overtaken by a newer
//!      one on the wire) are dropped instead of delivered late
//!   * `Reliable`: retransmitted until acknowledged, delivered in arrival order
//!   * `ReliableOrdered`: retransmitted until acknowledged, delivered in send order;
//!      the only mode that supports messages bigger than one datagram (fragmentation)
//!   * `ReliableSequenced`: retransmitted until acknowledged, stale messages dropped
//! * Wire compatibility over elegance: every quirk of the established format (bit-length
//!   fields, inverted address octets, padding-encoded MTU probes) is reproduced exactly
//! * Minimise latency on lossy networks: gaps in the datagram sequence are reported back
//!   (NACK) as soon as they are observed, triggering retransmission without waiting for
//!   the full retransmission timeout
//! * Retransmission timing adapts to the measured round trip time (EWMA smoothing with
//!   exponential backoff per retransmission)
//!
//! ## Datagram structure
//!
//! Every datagram is dispatched on its first byte:
//! ```ascii
//! 0x05..0x08  offline handshake (version check, MTU negotiation), magic-cookie guarded
//! 0x01, 0x02  unconnected ping (server discovery), answered without a connection
//! 0x80..0x8d  frame set: u24 LE sequence number, then one or more frames
//! 0xc0 / 0xa0 ACK / NACK: ranges of frame-set sequence numbers
//! ```
//!
//! Frames carry the per-mode bookkeeping (reliable / sequenced / ordered indices, all
//!  u24) and, for fragmented messages, a fragment header locating the frame in its
//!  compound. See the `frame` module for the exact layout.
//!
//! ## Connection lifecycle
//!
//! A connection is established by two offline round trips (version + MTU negotiation,
//!  guarded by a magic cookie) followed by an online handshake inside reliable frames.
//!  Established connections exchange keepalive pings; a peer that stops answering is
//!  torn down after a configurable number of unanswered pings. Either side can
//!  disconnect explicitly, which is communicated in-band and acknowledged like any
//!  other reliable frame.

mod ack;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
mod fragment;
pub mod frame;
pub mod listener;
pub mod message_dispatcher;
mod packets;
mod receive_queue;
pub mod safe_converter;
mod send_queue;
mod send_socket;
mod wire;

pub use client::RaknetClient;
pub use config::RaknetConfig;
pub use connection::{Connection, ConnectionState};
pub use error::RaknetError;
pub use frame::Reliability;
pub use listener::RaknetListener;
pub use message_dispatcher::{ConnectionEventHandler, MessageDispatcher};
