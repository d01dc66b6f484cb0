//! Virtual socket kinds and the socket table.
//!
//! A [`VirtualSocket`] is one of:
//! - [`DatagramSocket`]: connectionless, multiplexed by vport;
//! - [`StreamSocket`]: the reliable byte stream tunnelled in UDP.
//!
//! Both implement [`SocketOps`], the capability set every kind offers.
//! Pass-through sockets backed directly by host sockets are not virtual and
//! are refused by [`SocketKind::from_triple`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::datagram::DatagramSocket;
use crate::error::{NetError, NetResult};
use crate::options::{SockOpt, SockOptName};
use crate::stack::StackInner;
use crate::stream::StreamSocket;
use crate::waiters::{CallerId, PollEvents, WakeTx};

pub const AF_UNSPEC: i32 = 0;
pub const AF_INET: i32 = 2;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;
pub const SOCK_DGRAM_P2P: i32 = 6;
pub const SOCK_STREAM_P2P: i32 = 10;

/// Handle of a virtual socket in the socket table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub(crate) u32);

impl std::fmt::Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Real UDP endpoint plus the virtual port behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualAddr {
    pub addr: SocketAddr,
    pub vport: u16,
}

impl VirtualAddr {
    pub fn new(addr: SocketAddr, vport: u16) -> Self {
        Self { addr, vport }
    }
}

impl std::fmt::Display for VirtualAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.vport)
    }
}

bitflags! {
    /// Per-call receive flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecvFlags: u8 {
        /// Leave the data queued.
        const PEEK = 1 << 0;
        /// Behave as non-blocking for this call only.
        const DONT_WAIT = 1 << 1;
    }
}

/// Which virtual implementation a `(family, type, protocol)` triple maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Datagram,
    Stream,
}

impl SocketKind {
    pub fn from_triple(family: i32, ty: i32, protocol: i32) -> NetResult<Self> {
        if family != AF_INET && family != AF_UNSPEC {
            log::debug!("socket(): unsupported family {family}");
            return Err(NetError::AddressFamilyNotSupported);
        }
        match ty {
            SOCK_DGRAM_P2P => Ok(Self::Datagram),
            SOCK_STREAM_P2P => Ok(Self::Stream),
            SOCK_STREAM | SOCK_DGRAM | SOCK_RAW => {
                log::debug!("socket(): type {ty} (protocol {protocol}) is not virtualised");
                Err(NetError::ProtocolNotSupported)
            }
            _ => Err(NetError::ProtocolNotSupported),
        }
    }
}

/// Capability set shared by every virtual socket kind.
pub(crate) trait SocketOps {
    fn bind(&self, stack: &StackInner, addr: VirtualAddr) -> NetResult<()>;
    async fn connect(&self, stack: &StackInner, caller: CallerId, addr: VirtualAddr) -> NetResult<()>;
    fn send_to(&self, stack: &StackInner, data: &[u8], dest: Option<VirtualAddr>) -> NetResult<usize>;
    async fn recv_from(
        &self,
        stack: &StackInner,
        caller: CallerId,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> NetResult<(usize, VirtualAddr)>;
    fn getsockopt(&self, name: SockOptName) -> NetResult<SockOpt>;
    fn setsockopt(&self, opt: SockOpt) -> NetResult<()>;
    fn local_addr(&self) -> NetResult<VirtualAddr>;
    fn peer_addr(&self) -> NetResult<VirtualAddr>;
    /// Events that are ready right now.
    fn poll_ready(&self) -> PollEvents;
    fn register_waiter(&self, caller: CallerId, interest: PollEvents, tx: WakeTx);
    fn remove_caller(&self, caller: CallerId) -> usize;
    fn signal(&self, events: PollEvents);
    /// Tear down immediately: deregister, drop waiters, leave the table.
    fn release(&self, stack: &StackInner);
    /// [`SocketOps::release`] after any lingering the options ask for.
    async fn close(&self, stack: &StackInner);
}

/// Tagged union of the virtual socket kinds.
#[derive(Debug)]
pub enum VirtualSocket {
    Datagram(DatagramSocket),
    Stream(StreamSocket),
}

macro_rules! each_kind {
    ($sock:expr, $s:ident => $body:expr) => {
        match $sock {
            VirtualSocket::Datagram($s) => $body,
            VirtualSocket::Stream($s) => $body,
        }
    };
}

impl VirtualSocket {
    pub fn kind(&self) -> SocketKind {
        match self {
            Self::Datagram(_) => SocketKind::Datagram,
            Self::Stream(_) => SocketKind::Stream,
        }
    }

    pub(crate) fn as_stream(&self) -> Option<&StreamSocket> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Datagram(_) => None,
        }
    }

    pub(crate) fn as_datagram(&self) -> Option<&DatagramSocket> {
        match self {
            Self::Datagram(d) => Some(d),
            Self::Stream(_) => None,
        }
    }
}

impl SocketOps for VirtualSocket {
    fn bind(&self, stack: &StackInner, addr: VirtualAddr) -> NetResult<()> {
        each_kind!(self, s => s.bind(stack, addr))
    }

    async fn connect(&self, stack: &StackInner, caller: CallerId, addr: VirtualAddr) -> NetResult<()> {
        each_kind!(self, s => s.connect(stack, caller, addr).await)
    }

    fn send_to(&self, stack: &StackInner, data: &[u8], dest: Option<VirtualAddr>) -> NetResult<usize> {
        each_kind!(self, s => s.send_to(stack, data, dest))
    }

    async fn recv_from(
        &self,
        stack: &StackInner,
        caller: CallerId,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> NetResult<(usize, VirtualAddr)> {
        each_kind!(self, s => s.recv_from(stack, caller, buf, flags).await)
    }

    fn getsockopt(&self, name: SockOptName) -> NetResult<SockOpt> {
        each_kind!(self, s => s.getsockopt(name))
    }

    fn setsockopt(&self, opt: SockOpt) -> NetResult<()> {
        each_kind!(self, s => s.setsockopt(opt))
    }

    fn local_addr(&self) -> NetResult<VirtualAddr> {
        each_kind!(self, s => s.local_addr())
    }

    fn peer_addr(&self) -> NetResult<VirtualAddr> {
        each_kind!(self, s => s.peer_addr())
    }

    fn poll_ready(&self) -> PollEvents {
        each_kind!(self, s => s.poll_ready())
    }

    fn register_waiter(&self, caller: CallerId, interest: PollEvents, tx: WakeTx) {
        each_kind!(self, s => s.register_waiter(caller, interest, tx))
    }

    fn remove_caller(&self, caller: CallerId) -> usize {
        each_kind!(self, s => s.remove_caller(caller))
    }

    fn signal(&self, events: PollEvents) {
        each_kind!(self, s => s.signal(events))
    }

    fn release(&self, stack: &StackInner) {
        each_kind!(self, s => s.release(stack))
    }

    async fn close(&self, stack: &StackInner) {
        each_kind!(self, s => s.close(stack).await)
    }
}

/// Socket id table: the single owner of every live virtual socket.
#[derive(Debug)]
pub struct SocketTable {
    next_id: AtomicU32,
    sockets: Mutex<HashMap<SocketId, Arc<VirtualSocket>>>,
}

impl Default for SocketTable {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            sockets: Mutex::new(HashMap::new()),
        }
    }
}

impl SocketTable {
    pub fn allocate_id(&self) -> SocketId {
        SocketId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn insert(&self, sock: VirtualSocket) -> SocketId {
        let id = sock_id(&sock);
        lock(&self.sockets).insert(id, Arc::new(sock));
        id
    }

    pub fn get(&self, id: SocketId) -> Option<Arc<VirtualSocket>> {
        lock(&self.sockets).get(&id).cloned()
    }

    pub fn remove(&self, id: SocketId) -> Option<Arc<VirtualSocket>> {
        lock(&self.sockets).remove(&id)
    }

    /// Snapshot of every live socket, taken without holding the table lock
    /// while the caller works on them.
    pub fn all(&self) -> Vec<Arc<VirtualSocket>> {
        lock(&self.sockets).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.sockets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sock_id(sock: &VirtualSocket) -> SocketId {
    match sock {
        VirtualSocket::Datagram(d) => d.id(),
        VirtualSocket::Stream(s) => s.id(),
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
