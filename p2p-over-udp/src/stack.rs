//! The network subsystem context.
//!
//! [`NetStack`] owns the port registry, the socket table, the retransmission
//! monitor and the background tasks.  It is cheap to clone; every clone
//! refers to the same stack.  Callers identify themselves with a
//! [`CallerId`] on every operation that may block, which lets
//! [`NetStack::cancel_caller`] interrupt them.
//!
//! ```ignore
//! let stack = NetStack::start(NetConfig::default());
//! let me = CallerId::next();
//! let id = stack.socket(AF_INET, SOCK_DGRAM_P2P, 0)?;
//! stack.bind(id, VirtualAddr::new("0.0.0.0:3658".parse()?, 100))?;
//! let mut buf = [0u8; 1500];
//! let (n, from) = stack.recv_from(me, id, &mut buf, RecvFlags::empty()).await?;
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::NetConfig;
use crate::datagram::DatagramSocket;
use crate::dispatch::dispatch_loop;
use crate::error::{NetError, NetResult};
use crate::options::{SockOpt, SockOptName};
use crate::registry::PortRegistry;
use crate::retransmit::RetransmitMonitor;
use crate::socket::{lock, RecvFlags, SocketId, SocketKind, SocketOps, SocketTable, VirtualAddr, VirtualSocket};
use crate::stream::StreamSocket;
use crate::waiters::{deadline_after, wait, CallerId, PollEvents, WaitOutcome};

/// One entry of a [`NetStack::poll`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollFd {
    pub id: SocketId,
    /// Events the caller is interested in.
    pub events: PollEvents,
    /// Events found ready; filled in by `poll`.
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(id: SocketId, events: PollEvents) -> Self {
        Self {
            id,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Shared state behind every [`NetStack`] handle.
#[derive(Debug)]
pub struct StackInner {
    pub(crate) config: NetConfig,
    pub(crate) registry: PortRegistry,
    pub(crate) sockets: SocketTable,
    pub(crate) monitor: Arc<RetransmitMonitor>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for StackInner {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetStack {
    inner: Arc<StackInner>,
}

impl NetStack {
    /// Build the subsystem and spawn its background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: NetConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (failure_tx, failure_rx) = mpsc::unbounded_channel();

        let registry = PortRegistry::new(
            config.bind_ip,
            config.default_port,
            config.vport_base,
            config.faults.clone(),
            inbound_tx,
        );
        let monitor = Arc::new(RetransmitMonitor::new(config.retransmit.clone(), failure_tx));
        let batch = config.dispatch_batch;

        let inner = Arc::new(StackInner {
            config,
            registry,
            sockets: SocketTable::default(),
            monitor: Arc::clone(&monitor),
            tasks: Mutex::new(Vec::new()),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::downgrade(&inner), inbound_rx, failure_rx, batch));
        let retransmitter = tokio::spawn(monitor.run());
        lock(&inner.tasks).extend([dispatcher, retransmitter]);

        log::debug!("network stack started (bind ip {})", inner.config.bind_ip);
        Self { inner }
    }

    pub fn config(&self) -> &NetConfig {
        &self.inner.config
    }

    fn get(&self, id: SocketId) -> NetResult<Arc<VirtualSocket>> {
        self.inner.sockets.get(id).ok_or(NetError::BadDescriptor)
    }

    /// Open a virtual socket for `(family, type, protocol)`.
    pub fn socket(&self, family: i32, ty: i32, protocol: i32) -> NetResult<SocketId> {
        let id = self.inner.sockets.allocate_id();
        let sock = match SocketKind::from_triple(family, ty, protocol)? {
            SocketKind::Datagram => VirtualSocket::Datagram(DatagramSocket::new(id)),
            SocketKind::Stream => VirtualSocket::Stream(StreamSocket::new(id)),
        };
        log::debug!("socket {id}: opened as {:?}", sock.kind());
        Ok(self.inner.sockets.insert(sock))
    }

    pub fn bind(&self, id: SocketId, addr: VirtualAddr) -> NetResult<()> {
        self.get(id)?.bind(&self.inner, addr)
    }

    pub async fn connect(&self, caller: CallerId, id: SocketId, addr: VirtualAddr) -> NetResult<()> {
        self.get(id)?.connect(&self.inner, caller, addr).await
    }

    pub fn listen(&self, id: SocketId, backlog: usize) -> NetResult<()> {
        let sock = self.get(id)?;
        let stream = sock.as_stream().ok_or(NetError::NotSupported)?;
        stream.listen(&self.inner, backlog)
    }

    pub async fn accept(&self, caller: CallerId, id: SocketId) -> NetResult<(SocketId, VirtualAddr)> {
        let sock = self.get(id)?;
        let stream = sock.as_stream().ok_or(NetError::NotSupported)?;
        stream.accept(&self.inner, caller).await
    }

    pub fn send(&self, id: SocketId, data: &[u8]) -> NetResult<usize> {
        self.send_to(id, data, None)
    }

    pub fn send_to(&self, id: SocketId, data: &[u8], dest: Option<VirtualAddr>) -> NetResult<usize> {
        self.get(id)?.send_to(&self.inner, data, dest)
    }

    pub async fn recv(&self, caller: CallerId, id: SocketId, buf: &mut [u8], flags: RecvFlags) -> NetResult<usize> {
        self.recv_from(caller, id, buf, flags).await.map(|(n, _)| n)
    }

    pub async fn recv_from(
        &self,
        caller: CallerId,
        id: SocketId,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> NetResult<(usize, VirtualAddr)> {
        self.get(id)?.recv_from(&self.inner, caller, buf, flags).await
    }

    pub fn getsockopt(&self, id: SocketId, name: SockOptName) -> NetResult<SockOpt> {
        self.get(id)?.getsockopt(name)
    }

    pub fn setsockopt(&self, id: SocketId, opt: SockOpt) -> NetResult<()> {
        self.get(id)?.setsockopt(opt)
    }

    pub fn getsockname(&self, id: SocketId) -> NetResult<VirtualAddr> {
        self.get(id)?.local_addr()
    }

    pub fn getpeername(&self, id: SocketId) -> NetResult<VirtualAddr> {
        self.get(id)?.peer_addr()
    }

    /// Wait until at least one of `fds` is ready, the timeout passes, or the
    /// caller is cancelled.  Returns the number of entries with `revents`.
    ///
    /// `Some(Duration::ZERO)` checks once without waiting; `None` waits
    /// forever.
    pub async fn poll(&self, caller: CallerId, fds: &mut [PollFd], timeout: Option<Duration>) -> NetResult<usize> {
        let deadline = deadline_after(timeout);
        if fds.is_empty() {
            return match deadline {
                Some(at) => {
                    tokio::time::sleep_until(at).await;
                    Ok(0)
                }
                None => Err(NetError::InvalidArgument),
            };
        }

        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut ready = 0;
            let mut watched = Vec::with_capacity(fds.len());
            for fd in fds.iter_mut() {
                fd.revents = PollEvents::empty();
                let Some(sock) = self.inner.sockets.get(fd.id) else {
                    fd.revents = PollEvents::INVALID;
                    ready += 1;
                    continue;
                };
                let interest = fd.events | PollEvents::ERROR;
                // Register before checking so a wakeup in between is not lost.
                sock.register_waiter(caller, interest, tx.clone());
                let events = sock.poll_ready() & interest;
                if !events.is_empty() {
                    fd.revents = events;
                    ready += 1;
                }
                watched.push(sock);
            }
            drop(tx);

            if ready > 0 || timeout == Some(Duration::ZERO) {
                for sock in &watched {
                    sock.remove_caller(caller);
                }
                return Ok(ready);
            }
            match wait(&mut rx, deadline).await {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => {
                    for sock in &watched {
                        sock.remove_caller(caller);
                    }
                    return Ok(0);
                }
                WaitOutcome::Cancelled => return Err(NetError::Interrupted),
            }
        }
    }

    /// Close `id`, lingering first if its options ask for it.
    pub async fn close(&self, id: SocketId) -> NetResult<()> {
        self.get(id)?.close(&self.inner).await;
        Ok(())
    }

    /// Remove every waiter `caller` registered anywhere; its suspended call
    /// returns [`NetError::Interrupted`].
    pub fn cancel_caller(&self, caller: CallerId) -> usize {
        let removed: usize = self
            .inner
            .sockets
            .all()
            .iter()
            .map(|sock| sock.remove_caller(caller))
            .sum();
        log::debug!("cancelled {caller:?}: {removed} waiter(s) removed");
        removed
    }

    /// Stop the background tasks and close every socket without lingering.
    pub fn shutdown(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        self.inner.registry.stop_readers();
        for sock in self.inner.sockets.all() {
            sock.release(&self.inner);
        }
        log::debug!("network stack shut down");
    }

    /// Live virtual sockets.
    pub fn socket_count(&self) -> usize {
        self.inner.sockets.len()
    }

    /// Unacknowledged stream segments of `id`.
    pub fn unacked(&self, id: SocketId) -> usize {
        self.inner.monitor.pending(id)
    }
}
