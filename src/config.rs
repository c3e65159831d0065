use std::time::Duration;

use anyhow::bail;

use crate::frame::FRAME_OVERHEAD_BUDGET;

/// Protocol version spoken by this implementation. A peer announcing a different version
///  in its offline request is rejected with an `IncompatibleProtocolVersion` reply.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 0xb;

/// The default maximum datagram size. RakNet does not do path MTU discovery beyond the
///  initial probe, so this is deliberately conservative.
pub const DEFAULT_MTU: u16 = 1400;

/// Upper bound for the configurable MTU. The frame header's length field counts payload
///  *bits* in a u16, so the per-frame payload must stay at or below 8191 bytes.
pub const MAX_MTU: u16 = 8191 + FRAME_OVERHEAD_BUDGET as u16;

#[derive(Debug, Clone)]
pub struct RaknetConfig {
    pub protocol_version: u8,

    /// The maximum datagram size this node is willing to negotiate. The effective
    ///  per-frame payload budget is `mtu - 60` (worst-case frame and datagram headers).
    ///
    /// Choosing this value too big causes datagrams to be dropped somewhere on the route;
    ///  choosing it too small wastes bandwidth on headers.
    pub mtu: u16,

    /// Free-text server info returned in unconnected pong replies.
    pub advertisement: String,

    /// Interval at which each connection drains its send queue and retransmits overdue
    ///  reliable frames. This bounds the latency added by the engine, so it should be
    ///  small compared to the retransmission timeout floor of 50ms.
    pub flush_interval: Duration,

    /// Each connection picks a fixed keepalive interval uniformly from this range, so
    ///  that many connections created together do not ping in synchronized bursts.
    pub keepalive_interval_min: Duration,
    pub keepalive_interval_max: Duration,

    /// The connection is considered dead after this many keepalive pings in a row went
    ///  unanswered.
    pub max_unanswered_pings: u32,

    /// Number of times each offline handshake request is sent before giving up, and the
    ///  time to wait for a reply per attempt.
    pub handshake_retries: u32,
    pub handshake_timeout: Duration,
}

impl Default for RaknetConfig {
    fn default() -> Self {
        RaknetConfig {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            mtu: DEFAULT_MTU,
            advertisement: String::new(),
            flush_interval: Duration::from_millis(100),
            keepalive_interval_min: Duration::from_millis(1000),
            keepalive_interval_max: Duration::from_millis(1500),
            max_unanswered_pings: 6,
            handshake_retries: 4,
            handshake_timeout: Duration::from_millis(1000),
        }
    }
}

impl RaknetConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if (self.mtu as usize) <= FRAME_OVERHEAD_BUDGET {
            bail!("MTU of {} leaves no room for frame payloads", self.mtu);
        }
        if self.mtu > MAX_MTU {
            bail!("MTU of {} exceeds the maximum of {}", self.mtu, MAX_MTU);
        }
        if self.keepalive_interval_min > self.keepalive_interval_max {
            bail!("keepalive interval range is empty");
        }
        if self.keepalive_interval_min.is_zero() {
            bail!("keepalive interval must not be zero");
        }
        if self.max_unanswered_pings == 0 {
            bail!("at least one unanswered ping must be tolerated");
        }
        if self.handshake_retries == 0 {
            bail!("at least one handshake attempt is required");
        }
        Ok(())
    }

    /// The biggest payload that fits into a single frame at the configured MTU.
    pub fn max_frame_payload(&self) -> usize {
        self.mtu as usize - FRAME_OVERHEAD_BUDGET
    }
}
