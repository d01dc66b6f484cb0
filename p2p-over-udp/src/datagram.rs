//! Connectionless virtual sockets multiplexed by vport.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::error::{NetError, NetResult};
use crate::options::{SockOpt, SockOptName, SocketOptions};
use crate::packet::{MuxHeader, MAX_DATAGRAM_PAYLOAD};
use crate::registry::LogicalPort;
use crate::socket::{lock, RecvFlags, SocketId, SocketOps, VirtualAddr};
use crate::stack::StackInner;
use crate::waiters::{deadline_after, wait, CallerId, PollEvents, WaitOutcome, WaitQueue, WakeTx, Woken};

#[derive(Debug)]
struct Queued {
    from: VirtualAddr,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct DatagramInner {
    options: SocketOptions,
    port: Option<Weak<LogicalPort>>,
    vport: u16,
    /// Default destination set by `connect`.
    peer: Option<VirtualAddr>,
    queue: VecDeque<Queued>,
    queued_bytes: usize,
    waiters: WaitQueue,
    released: bool,
}

impl DatagramInner {
    fn port(&self) -> Option<Arc<LogicalPort>> {
        self.port.as_ref().and_then(Weak::upgrade)
    }

    /// Bound logical port, binding the default port and a fresh vport first
    /// if needed.
    fn ensure_bound(&mut self, id: SocketId, stack: &StackInner) -> NetResult<Arc<LogicalPort>> {
        if let Some(port) = self.port() {
            return Ok(port);
        }
        let port = stack.registry.bind_port(0)?;
        let vport = port.allocate_vport()?;
        port.register_datagram(vport, id, self.options.reuse())?;
        self.port = Some(Arc::downgrade(&port));
        self.vport = vport;
        log::debug!("dgram {id}: implicitly bound to {}/{vport}", port.local_addr());
        Ok(port)
    }
}

#[derive(Debug)]
pub struct DatagramSocket {
    id: SocketId,
    inner: Mutex<DatagramInner>,
}

impl DatagramSocket {
    pub(crate) fn new(id: SocketId) -> Self {
        Self {
            id,
            inner: Mutex::new(DatagramInner::default()),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue one inbound payload, dropping it if the receive buffer is full.
    pub(crate) fn on_datagram(&self, from: SocketAddr, src_vport: u16, payload: &[u8], woken: &mut Woken) {
        let mut inner = lock(&self.inner);
        if inner.released {
            return;
        }
        if inner.queued_bytes + payload.len() > inner.options.recv_buf as usize {
            log::trace!("dgram {}: receive buffer full, dropping {} bytes", self.id, payload.len());
            return;
        }
        inner.queued_bytes += payload.len();
        inner.queue.push_back(Queued {
            from: VirtualAddr::new(from, src_vport),
            payload: payload.to_vec(),
        });
        woken.mark(self.id, PollEvents::READ);
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner).queue.len()
    }
}

impl SocketOps for DatagramSocket {
    fn bind(&self, stack: &StackInner, addr: VirtualAddr) -> NetResult<()> {
        let mut inner = lock(&self.inner);
        if inner.port.is_some() {
            return Err(NetError::InvalidArgument);
        }
        let port = stack.registry.bind_port(addr.addr.port())?;
        let vport = match addr.vport {
            0 => port.allocate_vport()?,
            v => v,
        };
        port.register_datagram(vport, self.id, inner.options.reuse())?;
        inner.port = Some(Arc::downgrade(&port));
        inner.vport = vport;
        log::debug!("dgram {}: bound {}/{vport}", self.id, port.local_addr());
        Ok(())
    }

    async fn connect(&self, stack: &StackInner, _caller: CallerId, addr: VirtualAddr) -> NetResult<()> {
        let mut inner = lock(&self.inner);
        inner.ensure_bound(self.id, stack)?;
        inner.peer = Some(addr);
        Ok(())
    }

    fn send_to(&self, stack: &StackInner, data: &[u8], dest: Option<VirtualAddr>) -> NetResult<usize> {
        if data.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(NetError::MessageTooLong);
        }
        let mut inner = lock(&self.inner);
        let dest = dest.or(inner.peer).ok_or(NetError::NotConnected)?;
        let port = inner.ensure_bound(self.id, stack)?;
        let framed = MuxHeader::datagram(dest.vport, inner.vport).frame(data);
        port.transmit(dest.addr, &framed)?;
        log::trace!("dgram {}: → {} bytes to {dest}", self.id, data.len());
        Ok(data.len())
    }

    async fn recv_from(
        &self,
        _stack: &StackInner,
        caller: CallerId,
        buf: &mut [u8],
        flags: RecvFlags,
    ) -> NetResult<(usize, VirtualAddr)> {
        let mut deadline = None;
        let mut first = true;
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut inner = lock(&self.inner);
                if inner.released {
                    return Err(NetError::BadDescriptor);
                }
                if flags.contains(RecvFlags::PEEK) {
                    if let Some(q) = inner.queue.front() {
                        let n = buf.len().min(q.payload.len());
                        buf[..n].copy_from_slice(&q.payload[..n]);
                        return Ok((n, q.from));
                    }
                } else if let Some(q) = inner.queue.pop_front() {
                    inner.queued_bytes -= q.payload.len();
                    let n = buf.len().min(q.payload.len());
                    buf[..n].copy_from_slice(&q.payload[..n]);
                    return Ok((n, q.from));
                }
                if inner.options.non_blocking || flags.contains(RecvFlags::DONT_WAIT) {
                    return Err(NetError::WouldBlock);
                }
                if first {
                    deadline = deadline_after(inner.options.recv_timeout.to_duration());
                    first = false;
                }
                inner.waiters.register(caller, PollEvents::READ, tx);
            }
            match wait(&mut rx, deadline).await {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(NetError::WouldBlock),
                WaitOutcome::Cancelled => {
                    return Err(if lock(&self.inner).released {
                        NetError::BadDescriptor
                    } else {
                        NetError::Interrupted
                    })
                }
            }
        }
    }

    fn getsockopt(&self, name: SockOptName) -> NetResult<SockOpt> {
        Ok(lock(&self.inner).options.get(name))
    }

    fn setsockopt(&self, opt: SockOpt) -> NetResult<()> {
        lock(&self.inner).options.set(opt)
    }

    fn local_addr(&self) -> NetResult<VirtualAddr> {
        let inner = lock(&self.inner);
        Ok(match inner.port() {
            Some(port) => VirtualAddr::new(port.local_addr(), inner.vport),
            None => VirtualAddr::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0),
        })
    }

    fn peer_addr(&self) -> NetResult<VirtualAddr> {
        lock(&self.inner).peer.ok_or(NetError::NotConnected)
    }

    fn poll_ready(&self) -> PollEvents {
        let inner = lock(&self.inner);
        let mut ready = PollEvents::WRITE;
        if !inner.queue.is_empty() {
            ready |= PollEvents::READ;
        }
        ready
    }

    fn register_waiter(&self, caller: CallerId, interest: PollEvents, tx: WakeTx) {
        lock(&self.inner).waiters.register(caller, interest, tx);
    }

    fn remove_caller(&self, caller: CallerId) -> usize {
        lock(&self.inner).waiters.remove_caller(caller)
    }

    fn signal(&self, events: PollEvents) {
        lock(&self.inner).waiters.signal(self.id, events);
    }

    fn release(&self, stack: &StackInner) {
        {
            let mut inner = lock(&self.inner);
            if let Some(port) = inner.port() {
                port.unregister_datagram(inner.vport, self.id);
            }
            inner.released = true;
            inner.queue.clear();
            inner.queued_bytes = 0;
            inner.waiters.clear();
        }
        stack.sockets.remove(self.id);
        log::debug!("dgram {}: closed", self.id);
    }

    async fn close(&self, stack: &StackInner) {
        self.release(stack);
    }
}
