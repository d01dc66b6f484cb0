//! Error type shared by every socket operation.

use thiserror::Error;

/// Failure of a guest-facing socket operation.
///
/// Every variant is scoped to a single socket or connection; nothing here
/// is fatal to the stack as a whole.
#[derive(Debug, Error)]
pub enum NetError {
    /// No data yet on a non-blocking or timed-out call.
    #[error("operation would block")]
    WouldBlock,
    /// Non-blocking connect started; completion is signalled by WRITE.
    #[error("operation in progress")]
    InProgress,
    #[error("address already in use")]
    AddrInUse,
    #[error("address not available")]
    AddrNotAvailable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset by peer")]
    ConnectionReset,
    /// Retransmission ceiling reached, or a blocking call hit its timeout.
    #[error("connection timed out")]
    TimedOut,
    #[error("socket is not connected")]
    NotConnected,
    #[error("socket is already connected")]
    AlreadyConnected,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("message too long")]
    MessageTooLong,
    #[error("bad socket descriptor")]
    BadDescriptor,
    #[error("operation not supported on this socket")]
    NotSupported,
    #[error("protocol not supported")]
    ProtocolNotSupported,
    #[error("address family not supported")]
    AddressFamilyNotSupported,
    /// The suspended caller was cancelled.
    #[error("interrupted")]
    Interrupted,
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetError {
    /// `true` for conditions that resolve on their own (retry later).
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::InProgress)
    }

    /// `true` when the connection itself is gone.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused | Self::ConnectionReset | Self::TimedOut
        )
    }
}

pub type NetResult<T> = Result<T, NetError>;
