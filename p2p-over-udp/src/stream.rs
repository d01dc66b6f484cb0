//! Reliable, ordered byte streams tunnelled through logical ports.
//!
//! # Handshake
//!
//! ```text
//!  client                                     listener
//!    │ ── SYN seq=x ─────────────────────────▶ │ spawn child (handshaking),
//!    │                                         │ push onto backlog
//!    │ ◀──────────────── SYN|ACK seq=y ack=x+1 │
//!  connected                                   │
//!    │ ── ACK / data  seq=x+1 ack=y+1 ───────▶ child: connected
//! ```
//!
//! A listener whose backlog is full answers the SYN with a reset, and the
//! client's `connect` fails with [`NetError::ConnectionRefused`].
//!
//! # Data
//!
//! Outbound data is sliced into segments of at most [`MAX_SEGMENT_PAYLOAD`]
//! bytes.  Each one is handed to the [`crate::retransmit::RetransmitMonitor`]
//! before it is sent.  Every inbound data segment is answered with a
//! cumulative ACK, even when it was a duplicate, so a lost ACK is repaired by
//! the next retransmission.
//!
//! # Teardown
//!
//! There is no FIN exchange.  `close` resets a live connection; a reset from
//! the peer or the retry ceiling closes it with a pending error.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{NetError, NetResult};
use crate::options::{SockOpt, SockOptName, SocketOptions};
use crate::packet::{flags, MuxHeader, Segment, MAX_SEGMENT_PAYLOAD};
use crate::receiver::ReceiveBuffer;
use crate::registry::{ConnKey, LogicalPort};
use crate::sender::Sender;
use crate::socket::{lock, RecvFlags, SocketId, SocketOps, VirtualAddr, VirtualSocket};
use crate::stack::StackInner;
use crate::state::{Failure, StreamState};
use crate::waiters::{deadline_after, wait, CallerId, PollEvents, WaitOutcome, WaitQueue, WakeTx, Woken};

/// How often a lingering close re-checks for unacknowledged data.
const LINGER_POLL: Duration = Duration::from_millis(10);

const ALL_EVENTS: PollEvents = PollEvents::READ.union(PollEvents::WRITE).union(PollEvents::ERROR);

#[derive(Debug, Default)]
struct StreamInner {
    state: StreamState,
    options: SocketOptions,
    port: Option<Weak<LogicalPort>>,
    local_vport: u16,
    peer: Option<VirtualAddr>,
    /// Present once a handshake has started.
    sender: Option<Sender>,
    receive: ReceiveBuffer,
    /// Children not yet claimed by `accept`.
    backlog: VecDeque<(SocketId, VirtualAddr)>,
    max_backlog: usize,
    /// Kept until reported through `SO_ERROR` or a failed `connect`.
    failure: Option<Failure>,
    /// Spawned by a listener rather than by `connect`.
    is_child: bool,
    waiters: WaitQueue,
    released: bool,
}

impl StreamInner {
    fn port(&self) -> Option<Arc<LogicalPort>> {
        self.port.as_ref().and_then(Weak::upgrade)
    }

    fn conn_key(&self) -> Option<ConnKey> {
        self.peer.map(|peer| ConnKey {
            peer: peer.addr,
            local_vport: self.local_vport,
            peer_vport: peer.vport,
        })
    }

    fn ensure_bound(&mut self, id: SocketId, stack: &StackInner) -> NetResult<Arc<LogicalPort>> {
        if let Some(port) = self.port() {
            return Ok(port);
        }
        let port = stack.registry.bind_port(0)?;
        self.local_vport = port.allocate_vport()?;
        self.port = Some(Arc::downgrade(&port));
        log::debug!("stream {id}: implicitly bound to {}/{}", port.local_addr(), self.local_vport);
        Ok(port)
    }

    /// Frame `seg` for the peer and send it once, without tracking.
    fn send_control(&self, port: &LogicalPort, seg: &Segment) {
        let Some(peer) = self.peer else { return };
        let bytes = seg.encapsulate(peer.vport, self.local_vport);
        if let Err(e) = port.transmit(peer.addr, &bytes) {
            log::debug!("control segment to {peer} failed: {e}");
        }
    }

    /// Frame `seg`, track it for retransmission, and send it.
    fn send_tracked(&self, id: SocketId, stack: &StackInner, port: &Arc<LogicalPort>, seg: &Segment) {
        let Some(peer) = self.peer else { return };
        let bytes = seg.encapsulate(peer.vport, self.local_vport);
        stack.monitor.track(id, port, peer.addr, seg.header.seq, bytes.clone());
        if let Err(e) = port.transmit(peer.addr, &bytes) {
            log::debug!("segment seq={} to {peer} failed: {e}", seg.header.seq);
        }
    }

    fn isn(&self) -> Option<u64> {
        self.sender.as_ref().map(Sender::isn)
    }

    /// Acknowledge everything received so far.
    fn send_ack(&self, port: &LogicalPort) {
        if let Some(sender) = &self.sender {
            self.send_control(port, &sender.ack(self.receive.ack_number()));
        }
    }

    /// Drop every registration and retransmission of a live connection.
    fn teardown(&mut self, id: SocketId, stack: &StackInner, failure: Option<Failure>) {
        stack.monitor.purge(id);
        if let (Some(port), Some(key)) = (self.port(), self.conn_key()) {
            port.unregister_stream_connection(&key, id);
        }
        self.state = StreamState::Closed;
        if failure.is_some() {
            self.failure = failure;
        }
    }
}

#[derive(Debug)]
pub struct StreamSocket {
    id: SocketId,
    inner: Mutex<StreamInner>,
}

impl StreamSocket {
    pub(crate) fn new(id: SocketId) -> Self {
        Self {
            id,
            inner: Mutex::new(StreamInner::default()),
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        lock(&self.inner).state
    }

    /// Children waiting for `accept`.
    pub fn backlog_len(&self) -> usize {
        lock(&self.inner).backlog.len()
    }

    fn cancelled(&self) -> NetError {
        if lock(&self.inner).released {
            NetError::BadDescriptor
        } else {
            NetError::Interrupted
        }
    }

    pub(crate) fn listen(&self, stack: &StackInner, backlog: usize) -> NetResult<()> {
        let mut inner = lock(&self.inner);
        let max_backlog = backlog.clamp(1, stack.config.max_backlog.max(1));
        match inner.state {
            StreamState::Listening => {
                inner.max_backlog = max_backlog;
                return Ok(());
            }
            StreamState::Closed if !inner.released => {}
            _ => return Err(NetError::InvalidArgument),
        }
        let port = inner.ensure_bound(self.id, stack)?;
        port.register_stream_listener(inner.local_vport, self.id, inner.options.reuse())?;
        inner.state = StreamState::Listening;
        inner.max_backlog = max_backlog;
        inner.failure = None;
        log::debug!(
            "stream {}: listening on {}/{} (backlog {max_backlog})",
            self.id,
            port.local_addr(),
            inner.local_vport
        );
        Ok(())
    }

    /// Claim the oldest live backlog child.
    ///
    /// Children reset or timed out before being claimed are released, not
    /// handed out.
    pub(crate) async fn accept(&self, stack: &StackInner, caller: CallerId) -> NetResult<(SocketId, VirtualAddr)> {
        let mut deadline = None;
        let mut first = true;
        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let mut dead = Vec::new();
            let step = {
                let mut inner = lock(&self.inner);
                if inner.released {
                    return Err(NetError::BadDescriptor);
                }
                if inner.state != StreamState::Listening {
                    return Err(NetError::InvalidArgument);
                }
                match pop_live_child(stack, &mut inner.backlog, &mut dead) {
                    Some(child) => Ok(Some(child)),
                    None if inner.options.non_blocking => Err(NetError::WouldBlock),
                    None => {
                        if first {
                            deadline = deadline_after(inner.options.recv_timeout.to_duration());
                            first = false;
                        }
                        inner.waiters.register(caller, PollEvents::READ, tx);
                        Ok(None)
                    }
                }
            };
            for child in dead {
                if let Some(sock) = stack.sockets.get(child) {
                    sock.release(stack);
                }
            }
            if let Some(child) = step? {
                log::debug!("stream {}: accepted {} from {}", self.id, child.0, child.1);
                return Ok(child);
            }
            match wait(&mut rx, deadline).await {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(NetError::WouldBlock),
                WaitOutcome::Cancelled => return Err(self.cancelled()),
            }
        }
    }

    /// Start an active open: register the connection and send the SYN.
    fn start_connect(&self, inner: &mut StreamInner, stack: &StackInner, addr: VirtualAddr) -> NetResult<()> {
        let port = inner.ensure_bound(self.id, stack)?;
        let key = ConnKey {
            peer: addr.addr,
            local_vport: inner.local_vport,
            peer_vport: addr.vport,
        };
        port.register_stream_connection(key, self.id)?;

        let sender = Sender::new(inner.local_vport, addr.vport);
        let syn = sender.syn();
        inner.sender = Some(sender);
        inner.peer = Some(addr);
        inner.receive = ReceiveBuffer::default();
        inner.failure = None;
        inner.state = StreamState::Handshaking;
        inner.send_tracked(self.id, stack, &port, &syn);
        log::debug!(
            "stream {}: connecting {}/{} → {addr}",
            self.id,
            port.local_addr(),
            inner.local_vport
        );
        Ok(())
    }

    /// Listener side of a fresh SYN: spawn a child or refuse with a reset.
    pub(crate) fn on_syn(
        &self,
        stack: &StackInner,
        port: &Arc<LogicalPort>,
        from: SocketAddr,
        mux: &MuxHeader,
        seg: &Segment,
        woken: &mut Woken,
    ) {
        let mut inner = lock(&self.inner);
        if inner.state != StreamState::Listening || inner.released {
            drop(inner);
            reply_reset(port, from, mux, seg);
            return;
        }
        let Some(peer_next) = seg.header.seq.checked_add(1) else {
            log::trace!("stream {}: SYN seq {} leaves no sequence space", self.id, seg.header.seq);
            return;
        };
        if inner.backlog.len() >= inner.max_backlog {
            log::debug!(
                "stream {}: backlog full ({}), refusing {from}/{}",
                self.id,
                inner.max_backlog,
                mux.src_vport
            );
            drop(inner);
            reply_reset(port, from, mux, seg);
            return;
        }

        let child_id = stack.sockets.allocate_id();
        let peer = VirtualAddr::new(from, mux.src_vport);
        let key = ConnKey {
            peer: from,
            local_vport: mux.dst_vport,
            peer_vport: mux.src_vport,
        };
        if port.register_stream_connection(key, child_id).is_err() {
            return;
        }

        let sender = Sender::new(mux.dst_vport, mux.src_vport);
        let syn_ack = sender.syn_ack(peer_next);
        let child = StreamInner {
            state: StreamState::Handshaking,
            options: inner.options.clone(),
            port: Some(Arc::downgrade(port)),
            local_vport: mux.dst_vport,
            peer: Some(peer),
            sender: Some(sender),
            receive: ReceiveBuffer::new(peer_next),
            is_child: true,
            ..StreamInner::default()
        };
        child.send_tracked(child_id, stack, port, &syn_ack);
        stack.sockets.insert(VirtualSocket::Stream(StreamSocket {
            id: child_id,
            inner: Mutex::new(child),
        }));

        inner.backlog.push_back((child_id, peer));
        woken.mark(self.id, PollEvents::READ);
        log::debug!("stream {}: SYN from {peer}, spawned {child_id}", self.id);
    }

    /// Handle a segment addressed to this connection.
    pub(crate) fn on_segment(&self, stack: &StackInner, port: &Arc<LogicalPort>, seg: &Segment, woken: &mut Woken) {
        let mut inner = lock(&self.inner);
        if !inner.state.is_attached() {
            return;
        }

        if seg.has(flags::RST) {
            let failure = if inner.state == StreamState::Handshaking && !inner.is_child {
                Failure::Refused
            } else {
                Failure::Reset
            };
            log::debug!("stream {}: reset by peer while {}", self.id, inner.state);
            inner.teardown(self.id, stack, Some(failure));
            woken.mark(self.id, ALL_EVENTS);
            return;
        }

        if seg.has(flags::ACK) {
            stack.monitor.confirm(self.id, seg.header.ack);
        }

        let Some(isn) = inner.isn() else { return };
        match (inner.state, inner.is_child) {
            (StreamState::Handshaking, false) => {
                if !(seg.has(flags::SYN) && seg.has(flags::ACK) && seg.header.ack == isn + 1) {
                    return;
                }
                if let Some(peer_next) = seg.header.seq.checked_add(1) {
                    inner.receive = ReceiveBuffer::new(peer_next);
                    inner.state = StreamState::Connected;
                    inner.send_ack(port);
                    woken.mark(self.id, PollEvents::WRITE);
                    log::debug!("stream {}: connected to {:?}", self.id, inner.peer);
                }
                return;
            }
            (StreamState::Handshaking, true) => {
                if seg.has(flags::SYN) {
                    // Our SYN|ACK was lost; the client is still asking.
                    if let Some(sender) = &inner.sender {
                        inner.send_control(port, &sender.syn_ack(inner.receive.ack_number()));
                    }
                    return;
                }
                if !(seg.has(flags::ACK) && seg.header.ack > isn) {
                    return;
                }
                inner.state = StreamState::Connected;
                woken.mark(self.id, PollEvents::WRITE);
                log::debug!("stream {}: handshake complete with {:?}", self.id, inner.peer);
            }
            (StreamState::Connected, is_child) if seg.has(flags::SYN) => {
                // Client: our ACK of the SYN|ACK was lost.
                if !is_child {
                    inner.send_ack(port);
                }
                return;
            }
            _ => {}
        }

        if inner.state != StreamState::Connected || seg.payload.is_empty() {
            return;
        }
        let window_end = inner.receive.base().saturating_add(u64::from(inner.options.recv_buf));
        let fresh = if seg.header.seq >= window_end {
            log::trace!("stream {}: seq {} beyond receive window", self.id, seg.header.seq);
            0
        } else if seg.header.seq.checked_add(seg.payload.len() as u64).is_none() {
            log::trace!("stream {}: seq {} runs past sequence space", self.id, seg.header.seq);
            0
        } else {
            inner.receive.on_segment(seg.header.seq, &seg.payload)
        };
        inner.send_ack(port);
        if fresh > 0 {
            woken.mark(self.id, PollEvents::READ);
        }
    }

    /// Close the connection with `failure` (retry ceiling reached).
    pub(crate) fn fail(&self, stack: &StackInner, failure: Failure, woken: &mut Woken) {
        let mut inner = lock(&self.inner);
        if !inner.state.is_attached() {
            return;
        }
        log::debug!("stream {}: failed while {}: {failure:?}", self.id, inner.state);
        inner.teardown(self.id, stack, Some(failure));
        woken.mark(self.id, ALL_EVENTS);
    }
}

/// Pop backlog entries until one is still a live connection; the rest go
/// to `dead`.
fn pop_live_child(
    stack: &StackInner,
    backlog: &mut VecDeque<(SocketId, VirtualAddr)>,
    dead: &mut Vec<SocketId>,
) -> Option<(SocketId, VirtualAddr)> {
    while let Some((child, peer)) = backlog.pop_front() {
        let live = stack
            .sockets
            .get(child)
            .and_then(|sock| sock.as_stream().map(|s| s.state() != StreamState::Closed))
            .unwrap_or(false);
        if live {
            return Some((child, peer));
        }
        log::debug!("dropping dead backlog child {child} from {peer}");
        dead.push(child);
    }
    None
}

/// Answer a segment nobody owns with a reset, unless it is one itself.
pub(crate) fn reply_reset(port: &LogicalPort, from: SocketAddr, mux: &MuxHeader, seg: &Segment) {
    if seg.has(flags::RST) {
        return;
    }
    let rst = Segment::new(
        seg.header.ack,
        seg.header.seq.wrapping_add(seg.seq_len()),
        seg.header.dst_port,
        seg.header.src_port,
        flags::RST | flags::ACK,
        Vec::new(),
    );
    log::trace!("port {}: reset to {from}/{}", port.port(), mux.src_vport);
    if let Err(e) = port.transmit(from, &rst.encapsulate(mux.src_vport, mux.dst_vport)) {
        log::debug!("reset to {from} failed: {e}");
    }
}

impl SocketOps for StreamSocket {
    fn bind(&self, stack: &StackInner, addr: VirtualAddr) -> NetResult<()> {
        let mut inner = lock(&self.inner);
        if inner.port.is_some() || inner.state != StreamState::Closed {
            return Err(NetError::InvalidArgument);
        }
        let port = stack.registry.bind_port(addr.addr.port())?;
        let vport = match addr.vport {
            0 => port.allocate_vport()?,
            v => {
                port.check_stream_vport(v, inner.options.reuse())?;
                v
            }
        };
        inner.port = Some(Arc::downgrade(&port));
        inner.local_vport = vport;
        log::debug!("stream {}: bound {}/{vport}", self.id, port.local_addr());
        Ok(())
    }

    async fn connect(&self, stack: &StackInner, caller: CallerId, addr: VirtualAddr) -> NetResult<()> {
        let deadline = {
            let mut inner = lock(&self.inner);
            if inner.released {
                return Err(NetError::BadDescriptor);
            }
            match inner.state {
                StreamState::Connected => return Err(NetError::AlreadyConnected),
                StreamState::Listening => return Err(NetError::InvalidArgument),
                StreamState::Handshaking if inner.is_child => return Err(NetError::AlreadyConnected),
                StreamState::Handshaking => {}
                StreamState::Closed => self.start_connect(&mut inner, stack, addr)?,
            }
            if inner.options.non_blocking {
                return Err(NetError::InProgress);
            }
            deadline_after(inner.options.send_timeout.to_duration())
        };

        loop {
            let (tx, mut rx) = mpsc::unbounded_channel();
            {
                let mut inner = lock(&self.inner);
                if inner.released {
                    return Err(NetError::BadDescriptor);
                }
                match inner.state {
                    StreamState::Connected => return Ok(()),
                    StreamState::Closed => {
                        let failure = inner.failure.take();
                        return Err(failure.map_or(NetError::ConnectionRefused, NetError::from));
                    }
                    _ => {}
                }
                inner.waiters.register(caller, PollEvents::WRITE, tx);
            }
            match wait(&mut rx, deadline).await {
                WaitOutcome::Woken => continue,
                WaitOutcome::TimedOut => return Err(NetError::TimedOut),
                WaitOutcome::Cancelled => return Err(self.cancelled()),
            }
        }
    }

    fn send_to(&self, stack: &StackInner, data: &[u8], _dest: Option<VirtualAddr>) -> NetResult<usize> {
        let mut inner = lock(&self.inner);
        if let Some(failure) = inner.failure {
            return Err(failure.into());
        }
        let writable = match inner.state {
            StreamState::Connected => true,
            StreamState::Handshaking => inner.is_child,
            _ => false,
        };
        if !writable {
            return Err(NetError::NotConnected);
        }
        if data.len() > inner.options.send_buf as usize {
            return Err(NetError::MessageTooLong);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let port = inner.port().ok_or(NetError::NotConnected)?;
        let ack = inner.receive.ack_number();
        let Some(sender) = inner.sender.as_mut() else {
            return Err(NetError::NotConnected);
        };
        let segments = sender.data_segments(data, ack, MAX_SEGMENT_PAYLOAD);
        for seg in &segments {
            inner.send_tracked(self.id, stack, &port, seg);
        }
        log::trace!("stream {}: → {} bytes in {} segment(s)", self.id, data.len(), segments.len());
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
                if inner.state == StreamState::Listening {
                    return Err(NetError::NotConnected);
                }
                let peer = inner.peer.ok_or(NetError::NotConnected)?;
                if inner.receive.available() > 0 {
                    let n = inner.receive.read(buf, flags.contains(RecvFlags::PEEK));
                    return Ok((n, peer));
                }
                if let Some(failure) = inner.failure {
                    return Err(failure.into());
                }
                if !inner.state.is_attached() {
                    return Err(NetError::NotConnected);
                }
                if buf.is_empty() {
                    return Ok((0, peer));
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
                WaitOutcome::Cancelled => return Err(self.cancelled()),
            }
        }
    }

    fn getsockopt(&self, name: SockOptName) -> NetResult<SockOpt> {
        let mut inner = lock(&self.inner);
        Ok(match name {
            SockOptName::Error => SockOpt::Error(inner.failure.take()),
            other => inner.options.get(other),
        })
    }

    fn setsockopt(&self, opt: SockOpt) -> NetResult<()> {
        lock(&self.inner).options.set(opt)
    }

    fn local_addr(&self) -> NetResult<VirtualAddr> {
        let inner = lock(&self.inner);
        Ok(match inner.port() {
            Some(port) => VirtualAddr::new(port.local_addr(), inner.local_vport),
            None => VirtualAddr::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 0),
        })
    }

    fn peer_addr(&self) -> NetResult<VirtualAddr> {
        let inner = lock(&self.inner);
        match inner.peer {
            Some(peer) if inner.state.is_attached() => Ok(peer),
            _ => Err(NetError::NotConnected),
        }
    }

    fn poll_ready(&self) -> PollEvents {
        let inner = lock(&self.inner);
        let mut ready = PollEvents::empty();
        let closed_with_error = inner.state == StreamState::Closed && inner.failure.is_some();
        if inner.receive.available() > 0 || !inner.backlog.is_empty() || closed_with_error {
            ready |= PollEvents::READ;
        }
        let writable = match inner.state {
            StreamState::Connected => true,
            StreamState::Handshaking => inner.is_child,
            _ => false,
        };
        if writable {
            ready |= PollEvents::WRITE;
        }
        if inner.failure.is_some() {
            ready |= PollEvents::ERROR;
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
        let children: Vec<SocketId> = {
            let mut inner = lock(&self.inner);
            match inner.state {
                StreamState::Handshaking | StreamState::Connected => {
                    if let (Some(port), Some(sender)) = (inner.port(), inner.sender.as_ref()) {
                        inner.send_control(&port, &sender.rst(inner.receive.ack_number()));
                    }
                    inner.teardown(self.id, stack, None);
                }
                StreamState::Listening => {
                    if let Some(port) = inner.port() {
                        port.unregister_stream_listener(inner.local_vport, self.id);
                    }
                    inner.state = StreamState::Closed;
                }
                StreamState::Closed => {
                    stack.monitor.purge(self.id);
                }
            }
            inner.released = true;
            inner.waiters.clear();
            inner.backlog.drain(..).map(|(child, _)| child).collect()
        };
        stack.sockets.remove(self.id);
        for child in children {
            if let Some(sock) = stack.sockets.get(child) {
                sock.release(stack);
            }
        }
        log::debug!("stream {}: closed", self.id);
    }

    async fn close(&self, stack: &StackInner) {
        let (linger, connected) = {
            let inner = lock(&self.inner);
            (inner.options.linger, inner.state == StreamState::Connected)
        };
        if linger.enabled && linger.seconds > 0 && connected {
            let until = Instant::now() + Duration::from_secs(u64::from(linger.seconds));
            while stack.monitor.pending(self.id) > 0 && Instant::now() < until {
                tokio::time::sleep(LINGER_POLL).await;
            }
        }
        self.release(stack);
    }
}
