//! Real UDP sockets and the vport tables multiplexed over them.
//!
//! ```text
//!          PortRegistry (one per NetStack)
//!     ┌──────────────────────────────────────┐
//!     │ 3658 ─▶ LogicalPort ─┬─ UdpSocket    │◀── reader task
//!     │ 40001 ─▶ LogicalPort │  datagrams    │
//!     │  ...                 │  listeners    │
//!     │                      └─ streams      │
//!     └──────────────────────────────────────┘
//! ```
//!
//! A [`LogicalPort`] is created lazily the first time a socket binds,
//! connects or sends on its real port, and lives until the stack shuts down.
//! Sockets only hold a `Weak` back-reference to it.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::dispatch::{reader_loop, Inbound};
use crate::error::{NetError, NetResult};
use crate::packet::{flags, MuxHeader, Segment};
use crate::simulator::{Fate, FaultConfig, FaultInjector};
use crate::socket::{lock, SocketId};
use crate::stack::StackInner;
use crate::stream;
use crate::waiters::Woken;

/// Identity of one established stream connection on a logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    /// Real address of the remote endpoint.
    pub peer: SocketAddr,
    pub local_vport: u16,
    pub peer_vport: u16,
}

/// Owners of one vport: socket id → whether it opted into reuse.
type Owners = BTreeMap<SocketId, bool>;

#[derive(Debug)]
struct PortMaps {
    datagrams: HashMap<u16, Owners>,
    listeners: HashMap<u16, Owners>,
    streams: HashMap<ConnKey, SocketId>,
    next_vport: u16,
}

impl PortMaps {
    fn is_claimed(&self, vport: u16) -> bool {
        self.datagrams.contains_key(&vport)
            || self.listeners.contains_key(&vport)
            || self.streams.keys().any(|k| k.local_vport == vport)
    }
}

/// Add `id` to `owners`, refusing if anyone involved is exclusive.
fn claim(table: &mut HashMap<u16, Owners>, vport: u16, id: SocketId, reuse: bool) -> NetResult<()> {
    if let Some(owners) = table.get(&vport) {
        let shared = reuse && owners.values().all(|&r| r);
        if !owners.is_empty() && !owners.contains_key(&id) && !shared {
            return Err(NetError::AddrInUse);
        }
    }
    table.entry(vport).or_default().insert(id, reuse);
    Ok(())
}

fn release(table: &mut HashMap<u16, Owners>, vport: u16, id: SocketId) {
    if let Some(owners) = table.get_mut(&vport) {
        owners.remove(&id);
        if owners.is_empty() {
            table.remove(&vport);
        }
    }
}

/// One bound real UDP socket and everything multiplexed over it.
#[derive(Debug)]
pub struct LogicalPort {
    port: u16,
    local_addr: SocketAddr,
    socket: Arc<UdpSocket>,
    vport_base: u16,
    maps: Mutex<PortMaps>,
    faults: Option<Mutex<FaultInjector>>,
}

impl LogicalPort {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Next vport not claimed by anything on this port, wrapping back to
    /// the base after `u16::MAX`.
    pub fn allocate_vport(&self) -> NetResult<u16> {
        let mut maps = lock(&self.maps);
        let span = u32::from(u16::MAX - self.vport_base) + 1;
        for _ in 0..span {
            let candidate = maps.next_vport;
            maps.next_vport = if candidate == u16::MAX {
                self.vport_base
            } else {
                candidate + 1
            };
            if !maps.is_claimed(candidate) {
                return Ok(candidate);
            }
        }
        Err(NetError::AddrNotAvailable)
    }

    pub fn register_datagram(&self, vport: u16, id: SocketId, reuse: bool) -> NetResult<()> {
        claim(&mut lock(&self.maps).datagrams, vport, id, reuse)
    }

    pub fn unregister_datagram(&self, vport: u16, id: SocketId) {
        release(&mut lock(&self.maps).datagrams, vport, id);
    }

    pub fn datagram_owners(&self, vport: u16) -> Vec<SocketId> {
        lock(&self.maps)
            .datagrams
            .get(&vport)
            .map(|owners| owners.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Whether a stream socket may bind `vport` without listening yet.
    pub fn check_stream_vport(&self, vport: u16, reuse: bool) -> NetResult<()> {
        let maps = lock(&self.maps);
        match maps.listeners.get(&vport) {
            Some(owners) if !(reuse && owners.values().all(|&r| r)) => Err(NetError::AddrInUse),
            _ => Ok(()),
        }
    }

    pub fn register_stream_listener(&self, vport: u16, id: SocketId, reuse: bool) -> NetResult<()> {
        claim(&mut lock(&self.maps).listeners, vport, id, reuse)
    }

    pub fn unregister_stream_listener(&self, vport: u16, id: SocketId) {
        release(&mut lock(&self.maps).listeners, vport, id);
    }

    /// The listener that should receive a fresh SYN for `vport`.
    pub fn listener_for(&self, vport: u16) -> Option<SocketId> {
        lock(&self.maps)
            .listeners
            .get(&vport)
            .and_then(|owners| owners.keys().next().copied())
    }

    pub fn register_stream_connection(&self, key: ConnKey, id: SocketId) -> NetResult<()> {
        let mut maps = lock(&self.maps);
        match maps.streams.get(&key) {
            Some(&owner) if owner != id => Err(NetError::AddrInUse),
            _ => {
                maps.streams.insert(key, id);
                Ok(())
            }
        }
    }

    /// Remove `key` only if it still belongs to `id`.
    pub fn unregister_stream_connection(&self, key: &ConnKey, id: SocketId) {
        let mut maps = lock(&self.maps);
        if maps.streams.get(key) == Some(&id) {
            maps.streams.remove(key);
        }
    }

    pub fn stream_for(&self, key: &ConnKey) -> Option<SocketId> {
        lock(&self.maps).streams.get(key).copied()
    }

    /// Send one framed datagram, subject to fault injection.
    ///
    /// A full kernel buffer counts as loss: the datagram is dropped and the
    /// call succeeds.
    pub fn transmit(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
        let fate = match &self.faults {
            Some(faults) => lock(faults).decide(),
            None => Fate::Deliver,
        };
        match fate {
            Fate::Deliver => self.send_now(to, bytes),
            Fate::Drop => {
                log::trace!("port {}: fault drop of {} bytes to {to}", self.port, bytes.len());
                Ok(())
            }
            Fate::Duplicate => {
                self.send_now(to, bytes)?;
                self.send_now(to, bytes)
            }
            Fate::Delay(delay) => {
                let Ok(handle) = tokio::runtime::Handle::try_current() else {
                    return self.send_now(to, bytes);
                };
                let socket = Arc::clone(&self.socket);
                let bytes = bytes.to_vec();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = socket.send_to(&bytes, to).await {
                        log::debug!("delayed send to {to} failed: {e}");
                    }
                });
                Ok(())
            }
        }
    }

    fn send_now(&self, to: SocketAddr, bytes: &[u8]) -> io::Result<()> {
        match self.socket.try_send_to(bytes, to) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("port {}: send buffer full, dropping datagram to {to}", self.port);
                Ok(())
            }
            Err(e) => {
                log::warn!("port {}: send to {to} failed: {e}", self.port);
                Err(e)
            }
        }
    }
}

#[derive(Debug, Default)]
struct PortTable {
    by_port: HashMap<u16, Arc<LogicalPort>>,
    /// Actual port picked by the OS when the configured default is 0.
    ephemeral_default: Option<u16>,
}

/// Table of every logical port owned by one stack.
#[derive(Debug)]
pub struct PortRegistry {
    bind_ip: IpAddr,
    default_port: u16,
    vport_base: u16,
    faults: Option<FaultConfig>,
    ports: Mutex<PortTable>,
    inbound: mpsc::UnboundedSender<Inbound>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl PortRegistry {
    pub(crate) fn new(
        bind_ip: IpAddr,
        default_port: u16,
        vport_base: u16,
        faults: Option<FaultConfig>,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Self {
        Self {
            bind_ip,
            default_port,
            vport_base: vport_base.max(1),
            faults,
            ports: Mutex::new(PortTable::default()),
            inbound,
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Logical port for real port `port`, binding it on first use.
    ///
    /// Port 0 stands for the stack's default port.  Must be called from
    /// within a tokio runtime.
    pub fn bind_port(&self, port: u16) -> NetResult<Arc<LogicalPort>> {
        let mut table = lock(&self.ports);
        let wanted = if port == 0 { self.default_port } else { port };

        if wanted == 0 {
            if let Some(existing) = table.ephemeral_default.and_then(|p| table.by_port.get(&p)) {
                return Ok(Arc::clone(existing));
            }
            let lp = self.open(0)?;
            table.ephemeral_default = Some(lp.port);
            table.by_port.insert(lp.port, Arc::clone(&lp));
            return Ok(lp);
        }

        if let Some(existing) = table.by_port.get(&wanted) {
            return Ok(Arc::clone(existing));
        }
        let lp = self.open(wanted)?;
        table.by_port.insert(wanted, Arc::clone(&lp));
        Ok(lp)
    }

    pub fn get(&self, port: u16) -> Option<Arc<LogicalPort>> {
        lock(&self.ports).by_port.get(&port).cloned()
    }

    pub fn ports(&self) -> Vec<u16> {
        lock(&self.ports).by_port.keys().copied().collect()
    }

    fn open(&self, port: u16) -> NetResult<Arc<LogicalPort>> {
        let std_socket = std::net::UdpSocket::bind(SocketAddr::new(self.bind_ip, port))?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        let local_addr = socket.local_addr()?;

        let lp = Arc::new(LogicalPort {
            port: local_addr.port(),
            local_addr,
            socket: Arc::new(socket),
            vport_base: self.vport_base,
            maps: Mutex::new(PortMaps {
                datagrams: HashMap::new(),
                listeners: HashMap::new(),
                streams: HashMap::new(),
                next_vport: self.vport_base,
            }),
            faults: self.faults.clone().map(|c| Mutex::new(FaultInjector::new(c))),
        });
        log::debug!("bound logical port {local_addr}");

        let reader = tokio::spawn(reader_loop(Arc::clone(&lp), self.inbound.clone()));
        lock(&self.readers).push(reader);
        Ok(lp)
    }

    pub(crate) fn stop_readers(&self) {
        for reader in lock(&self.readers).drain(..) {
            reader.abort();
        }
    }

    /// Route one inbound datagram to the socket(s) it is addressed to.
    ///
    /// Datagrams for unknown vports are dropped; stream segments for unknown
    /// connections are answered with a reset.
    pub(crate) fn deliver(&self, stack: &StackInner, inbound: Inbound, woken: &mut Woken) {
        let Inbound { port, from, bytes } = inbound;
        let (mux, body) = match MuxHeader::decode(&bytes) {
            Ok(split) => split,
            Err(e) => {
                log::trace!("port {}: dropping datagram from {from}: {e}", port.port);
                return;
            }
        };

        if !mux.is_stream() {
            let owners = port.datagram_owners(mux.dst_vport);
            if owners.is_empty() {
                log::trace!("port {}: no datagram socket on vport {}", port.port, mux.dst_vport);
                return;
            }
            for id in owners {
                if let Some(sock) = stack.sockets.get(id) {
                    if let Some(dgram) = sock.as_datagram() {
                        dgram.on_datagram(from, mux.src_vport, body, woken);
                    }
                }
            }
            return;
        }

        let seg = match Segment::decode(body) {
            Ok(seg) => seg,
            Err(e) => {
                log::trace!("port {}: invalid segment from {from}: {e}", port.port);
                return;
            }
        };
        log::trace!(
            "port {}: ← seq={} ack={} flags={:#04x} len={} from {from}/{}",
            port.port,
            seg.header.seq,
            seg.header.ack,
            seg.header.flags,
            seg.payload.len(),
            mux.src_vport
        );

        let key = ConnKey {
            peer: from,
            local_vport: mux.dst_vport,
            peer_vport: mux.src_vport,
        };
        let conn = port
            .stream_for(&key)
            .and_then(|id| stack.sockets.get(id));
        if let Some(stream) = conn.as_deref().and_then(|s| s.as_stream()) {
            stream.on_segment(stack, &port, &seg, woken);
            return;
        }

        if seg.has(flags::SYN) && !seg.has(flags::ACK) {
            let listener = port
                .listener_for(mux.dst_vport)
                .and_then(|id| stack.sockets.get(id));
            if let Some(listener) = listener.as_deref().and_then(|s| s.as_stream()) {
                listener.on_syn(stack, &port, from, &mux, &seg, woken);
                return;
            }
        }

        stream::reply_reset(&port, from, &mux, &seg);
    }
}

impl Drop for PortRegistry {
    fn drop(&mut self) {
        self.stop_readers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn registry(default_port: u16) -> PortRegistry {
        let (tx, _rx) = mpsc::unbounded_channel();
        PortRegistry::new(IpAddr::V4(Ipv4Addr::LOCALHOST), default_port, 30000, None, tx)
    }

    #[tokio::test]
    async fn bind_port_is_idempotent() {
        let reg = registry(0);
        let a = reg.bind_port(0).unwrap();
        let b = reg.bind_port(0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = reg.bind_port(a.port()).unwrap();
        assert!(Arc::ptr_eq(&a, &c));
        assert_eq!(reg.ports(), vec![a.port()]);
    }

    #[tokio::test]
    async fn exclusive_datagram_vport() {
        let reg = registry(0);
        let lp = reg.bind_port(0).unwrap();
        lp.register_datagram(100, SocketId(1), false).unwrap();
        assert!(matches!(
            lp.register_datagram(100, SocketId(2), false),
            Err(NetError::AddrInUse)
        ));
        assert!(matches!(
            lp.register_datagram(100, SocketId(3), true),
            Err(NetError::AddrInUse)
        ));
        lp.unregister_datagram(100, SocketId(1));
        lp.register_datagram(100, SocketId(2), false).unwrap();
    }

    #[tokio::test]
    async fn reuse_requires_everyone_to_opt_in() {
        let reg = registry(0);
        let lp = reg.bind_port(0).unwrap();
        lp.register_datagram(7, SocketId(1), true).unwrap();
        lp.register_datagram(7, SocketId(2), true).unwrap();
        assert!(lp.register_datagram(7, SocketId(3), false).is_err());
        assert_eq!(lp.datagram_owners(7), vec![SocketId(1), SocketId(2)]);
    }

    #[tokio::test]
    async fn allocation_skips_claimed_vports() {
        let reg = registry(0);
        let lp = reg.bind_port(0).unwrap();
        lp.register_datagram(30000, SocketId(1), false).unwrap();
        lp.register_stream_listener(30001, SocketId(2), false).unwrap();
        assert_eq!(lp.allocate_vport().unwrap(), 30002);
        assert_eq!(lp.allocate_vport().unwrap(), 30003);
    }

    #[tokio::test]
    async fn connection_keys_are_unique() {
        let reg = registry(0);
        let lp = reg.bind_port(0).unwrap();
        let key = ConnKey {
            peer: "127.0.0.1:9".parse().unwrap(),
            local_vport: 1,
            peer_vport: 2,
        };
        lp.register_stream_connection(key, SocketId(1)).unwrap();
        assert!(lp.register_stream_connection(key, SocketId(2)).is_err());
        lp.unregister_stream_connection(&key, SocketId(2));
        assert_eq!(lp.stream_for(&key), Some(SocketId(1)));
        lp.unregister_stream_connection(&key, SocketId(1));
        assert_eq!(lp.stream_for(&key), None);
    }
}
