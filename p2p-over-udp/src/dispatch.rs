//! Background delivery loops.
//!
//! ```text
//!  reader task (per LogicalPort) ──Inbound──▶ dispatcher ──deliver()──▶ sockets
//!                                                 ▲                      │
//!  retransmission task ─────── failed SocketId ───┘       Woken::flush ◀─┘
//! ```
//!
//! Readers never touch socket state.  The dispatcher is the only task that
//! routes inbound traffic, and it wakes blocked callers once per batch.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use tokio::sync::mpsc;

use crate::registry::LogicalPort;
use crate::socket::SocketId;
use crate::stack::StackInner;
use crate::state::Failure;
use crate::waiters::Woken;

/// Largest datagram the reader accepts from the kernel.
const MAX_UDP_DATAGRAM: usize = 65_535;

/// One datagram read from a real socket.
#[derive(Debug)]
pub(crate) struct Inbound {
    pub port: Arc<LogicalPort>,
    pub from: SocketAddr,
    pub bytes: Vec<u8>,
}

/// Pull datagrams off one real socket until it fails or nobody listens.
pub(crate) async fn reader_loop(port: Arc<LogicalPort>, tx: mpsc::UnboundedSender<Inbound>) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM];
    loop {
        match port.socket().recv_from(&mut buf).await {
            Ok((n, from)) => {
                let inbound = Inbound {
                    port: Arc::clone(&port),
                    from,
                    bytes: buf[..n].to_vec(),
                };
                if tx.send(inbound).is_err() {
                    break;
                }
            }
            // ICMP unreachable from an earlier send surfaces here on some
            // platforms; it says nothing about this socket.
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                log::trace!("port {}: ignoring {e}", port.port());
            }
            Err(e) => {
                log::warn!("port {}: reader stopped: {e}", port.port());
                break;
            }
        }
    }
}

/// Route inbound datagrams and apply connection failures.
pub(crate) async fn dispatch_loop(
    stack: Weak<StackInner>,
    mut inbound: mpsc::UnboundedReceiver<Inbound>,
    mut failures: mpsc::UnboundedReceiver<SocketId>,
    batch: usize,
) {
    let batch = batch.max(1);
    let mut pending = Vec::with_capacity(batch);
    loop {
        tokio::select! {
            n = inbound.recv_many(&mut pending, batch) => {
                if n == 0 {
                    break;
                }
                let Some(stack) = stack.upgrade() else { break };
                let mut woken = Woken::default();
                for datagram in pending.drain(..) {
                    stack.registry.deliver(&stack, datagram, &mut woken);
                }
                woken.flush(&stack.sockets);
            }
            Some(id) = failures.recv() => {
                let Some(stack) = stack.upgrade() else { break };
                let mut woken = Woken::default();
                if let Some(sock) = stack.sockets.get(id) {
                    if let Some(stream) = sock.as_stream() {
                        stream.fail(&stack, Failure::TimedOut, &mut woken);
                    }
                }
                woken.flush(&stack.sockets);
            }
        }
    }
    log::debug!("dispatcher stopped");
}
