//! Per-socket option cache.

use std::time::Duration;

use crate::error::{NetError, NetResult};
use crate::state::Failure;

/// Seconds + microseconds, as guests pass timeouts.  Zero means "forever".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub sec: u64,
    pub usec: u32,
}

impl Timeval {
    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: d.as_secs(),
            usec: d.subsec_micros(),
        }
    }

    /// `None` for the zero value.  Saturates at [`Duration::MAX`].
    pub fn to_duration(self) -> Option<Duration> {
        let d = Duration::from_secs(self.sec).saturating_add(Duration::from_micros(u64::from(self.usec)));
        (!d.is_zero()).then_some(d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Linger {
    pub enabled: bool,
    pub seconds: u32,
}

/// Option names accepted by `getsockopt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOptName {
    NonBlocking,
    SendTimeout,
    RecvTimeout,
    Linger,
    ReuseAddr,
    ReusePort,
    SendBuf,
    RecvBuf,
    /// Read-only; reading clears it.
    Error,
}

/// An option value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockOpt {
    NonBlocking(bool),
    SendTimeout(Timeval),
    RecvTimeout(Timeval),
    Linger(Linger),
    ReuseAddr(bool),
    ReusePort(bool),
    SendBuf(u32),
    RecvBuf(u32),
    Error(Option<Failure>),
}

impl SockOpt {
    pub fn name(&self) -> SockOptName {
        match self {
            Self::NonBlocking(_) => SockOptName::NonBlocking,
            Self::SendTimeout(_) => SockOptName::SendTimeout,
            Self::RecvTimeout(_) => SockOptName::RecvTimeout,
            Self::Linger(_) => SockOptName::Linger,
            Self::ReuseAddr(_) => SockOptName::ReuseAddr,
            Self::ReusePort(_) => SockOptName::ReusePort,
            Self::SendBuf(_) => SockOptName::SendBuf,
            Self::RecvBuf(_) => SockOptName::RecvBuf,
            Self::Error(_) => SockOptName::Error,
        }
    }
}

const DEFAULT_BUF: u32 = 65535;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub non_blocking: bool,
    pub send_timeout: Timeval,
    pub recv_timeout: Timeval,
    pub linger: Linger,
    pub reuse_addr: bool,
    pub reuse_port: bool,
    pub send_buf: u32,
    pub recv_buf: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            non_blocking: false,
            send_timeout: Timeval::default(),
            recv_timeout: Timeval::default(),
            linger: Linger::default(),
            reuse_addr: false,
            reuse_port: false,
            send_buf: DEFAULT_BUF,
            recv_buf: DEFAULT_BUF,
        }
    }
}

impl SocketOptions {
    /// Socket may share its vport with other reuse-opted sockets.
    pub fn reuse(&self) -> bool {
        self.reuse_addr || self.reuse_port
    }

    pub fn set(&mut self, opt: SockOpt) -> NetResult<()> {
        match opt {
            SockOpt::NonBlocking(v) => self.non_blocking = v,
            SockOpt::SendTimeout(tv) => self.send_timeout = validate_timeval(tv)?,
            SockOpt::RecvTimeout(tv) => self.recv_timeout = validate_timeval(tv)?,
            SockOpt::Linger(l) => self.linger = l,
            SockOpt::ReuseAddr(v) => self.reuse_addr = v,
            SockOpt::ReusePort(v) => self.reuse_port = v,
            SockOpt::SendBuf(0) | SockOpt::RecvBuf(0) => return Err(NetError::InvalidArgument),
            SockOpt::SendBuf(n) => self.send_buf = n,
            SockOpt::RecvBuf(n) => self.recv_buf = n,
            SockOpt::Error(_) => return Err(NetError::InvalidArgument),
        }
        Ok(())
    }

    /// Current value of `name`.  [`SockOptName::Error`] is answered by the
    /// socket itself and reads as "no error" here.
    pub fn get(&self, name: SockOptName) -> SockOpt {
        match name {
            SockOptName::NonBlocking => SockOpt::NonBlocking(self.non_blocking),
            SockOptName::SendTimeout => SockOpt::SendTimeout(self.send_timeout),
            SockOptName::RecvTimeout => SockOpt::RecvTimeout(self.recv_timeout),
            SockOptName::Linger => SockOpt::Linger(self.linger),
            SockOptName::ReuseAddr => SockOpt::ReuseAddr(self.reuse_addr),
            SockOptName::ReusePort => SockOpt::ReusePort(self.reuse_port),
            SockOptName::SendBuf => SockOpt::SendBuf(self.send_buf),
            SockOptName::RecvBuf => SockOpt::RecvBuf(self.recv_buf),
            SockOptName::Error => SockOpt::Error(None),
        }
    }
}

fn validate_timeval(tv: Timeval) -> NetResult<Timeval> {
    if tv.usec >= 1_000_000 {
        return Err(NetError::InvalidArgument);
    }
    Ok(tv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeval_means_forever() {
        assert_eq!(Timeval::default().to_duration(), None);
        let tv = Timeval { sec: 1, usec: 500_000 };
        assert_eq!(tv.to_duration(), Some(Duration::from_millis(1500)));
        assert_eq!(Timeval::from_duration(Duration::from_millis(1500)), tv);
    }

    #[test]
    fn huge_timeval_saturates() {
        let mut o = SocketOptions::default();
        let huge = Timeval { sec: u64::MAX, usec: 999_999 };
        o.set(SockOpt::RecvTimeout(huge)).unwrap();
        assert_eq!(o.recv_timeout.to_duration(), Some(Duration::MAX));
    }

    #[test]
    fn set_then_get() {
        let mut o = SocketOptions::default();
        o.set(SockOpt::NonBlocking(true)).unwrap();
        o.set(SockOpt::ReusePort(true)).unwrap();
        o.set(SockOpt::Linger(Linger { enabled: true, seconds: 3 })).unwrap();
        assert_eq!(o.get(SockOptName::NonBlocking), SockOpt::NonBlocking(true));
        assert_eq!(
            o.get(SockOptName::Linger),
            SockOpt::Linger(Linger { enabled: true, seconds: 3 })
        );
        assert!(o.reuse());
    }

    #[test]
    fn invalid_values_rejected() {
        let mut o = SocketOptions::default();
        let bad = Timeval { sec: 0, usec: 1_000_000 };
        assert!(matches!(o.set(SockOpt::RecvTimeout(bad)), Err(NetError::InvalidArgument)));
        assert!(matches!(o.set(SockOpt::SendBuf(0)), Err(NetError::InvalidArgument)));
        assert!(matches!(o.set(SockOpt::Error(None)), Err(NetError::InvalidArgument)));
        assert_eq!(o.send_buf, DEFAULT_BUF);
    }
}
