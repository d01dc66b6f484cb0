//! Stream connection state machine types.
//!
//! Transitions are driven by [`crate::stream`]; this module only names them.
//!
//! ```text
//!            connect(): send SYN             SYN|ACK received
//!  CLOSED ─────────────────────▶ HANDSHAKING ─────────────────▶ CONNECTED
//!    ▲  │                           ▲                               │
//!    │  │ listen()                  │ SYN on a listener             │
//!    │  ▼                           │ spawns a child here           │
//!  LISTENING ───────────────────────┘                               │
//!    ▲                                                              │
//!    └──────────── RST received / retry ceiling / close() ◀─────────┘
//! ```
//!
//! There is no graceful FIN exchange: the only way out is a reset.

use crate::error::NetError;

/// All possible states of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Fresh, or torn down.
    #[default]
    Closed,
    /// Passive socket; never becomes connected itself.
    Listening,
    /// Handshake-open sent (client) or answered (accepted child).
    Handshaking,
    /// Data may flow in both directions.
    Connected,
}

impl StreamState {
    /// Peer endpoint is fixed and segments may be exchanged.
    pub fn is_attached(self) -> bool {
        matches!(self, Self::Handshaking | Self::Connected)
    }
}

impl std::fmt::Display for StreamState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Listening => "listening",
            Self::Handshaking => "handshaking",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Why a connection ended, kept on the socket until reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Reset while still handshaking.
    Refused,
    /// Reset once connected.
    Reset,
    /// Retransmission ceiling exceeded.
    TimedOut,
}

impl From<Failure> for NetError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Refused => NetError::ConnectionRefused,
            Failure::Reset => NetError::ConnectionReset,
            Failure::TimedOut => NetError::TimedOut,
        }
    }
}
