use std::fmt::{Display, Formatter};

/// The error cases that callers need to tell apart programmatically. Everything else
///  (most prominently decode errors on malformed datagrams) goes through plain `anyhow`
///  errors and is isolated to the datagram it occurred on.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RaknetError {
    /// A message for a non-fragmenting reliability mode exceeds what fits into a single
    ///  frame. This is rejected synchronously when the message is handed to the engine.
    PayloadTooLarge { len: usize, max: usize },
    /// The peer runs an incompatible protocol version. Fatal to the handshake attempt,
    ///  never retried.
    IncompatibleProtocolVersion { ours: u8, theirs: u8 },
    /// The peer did not answer any of the handshake attempts.
    HandshakeTimeout,
}

impl Display for RaknetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RaknetError::PayloadTooLarge { len, max } =>
                write!(f, "payload of {} bytes exceeds the per-frame maximum of {} bytes", len, max),
            RaknetError::IncompatibleProtocolVersion { ours, theirs } =>
                write!(f, "peer protocol version {:#04x} is incompatible with ours ({:#04x})", theirs, ours),
            RaknetError::HandshakeTimeout =>
                write!(f, "peer did not respond to the connection handshake"),
        }
    }
}

impl std::error::Error for RaknetError {}
