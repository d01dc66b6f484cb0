//! Blocked-caller bookkeeping.
//!
//! A caller that has to wait registers a [`Waiter`] on the socket: its
//! identity, the events it cares about, and the sending half of a channel.
//! Whoever makes the socket ready signals the queue, which sends a
//! [`Wakeup`] down every matching channel and forgets those waiters.  The
//! caller then re-takes the socket lock and re-checks.
//!
//! Dropping the sending half (cancellation, socket close) ends the caller's
//! wait with [`WaitOutcome::Cancelled`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::socket::{SocketId, SocketOps, SocketTable};

bitflags! {
    /// Readiness events of a virtual socket.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollEvents: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Pending connection error.  Wakes every waiter.
        const ERROR = 1 << 2;
        /// Reported by poll for an unknown socket id.
        const INVALID = 1 << 3;
    }
}

/// Identity of one guest caller (thread).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallerId(u64);

impl CallerId {
    /// Allocate a fresh, process-unique caller identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Notification delivered to a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wakeup {
    pub socket: SocketId,
    pub events: PollEvents,
}

pub type WakeTx = mpsc::UnboundedSender<Wakeup>;
pub type WakeRx = mpsc::UnboundedReceiver<Wakeup>;

#[derive(Debug)]
struct Waiter {
    caller: CallerId,
    interest: PollEvents,
    tx: WakeTx,
}

/// Per-socket queue of suspended callers.
#[derive(Debug, Default)]
pub struct WaitQueue {
    waiters: Vec<Waiter>,
}

impl WaitQueue {
    pub fn register(&mut self, caller: CallerId, interest: PollEvents, tx: WakeTx) {
        self.waiters.push(Waiter {
            caller,
            interest,
            tx,
        });
    }

    /// Union of the events live waiters are interested in.
    #[cfg(test)]
    pub fn armed(&self) -> PollEvents {
        self.waiters
            .iter()
            .filter(|w| !w.tx.is_closed())
            .fold(PollEvents::empty(), |acc, w| acc | w.interest)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Wake and forget every waiter interested in `events`.
    ///
    /// Waiters whose caller already gave up are pruned on the way.
    pub fn signal(&mut self, socket: SocketId, events: PollEvents) -> usize {
        let mut woken = 0;
        self.waiters.retain(|w| {
            if w.tx.is_closed() {
                return false;
            }
            if !(w.interest.intersects(events) || events.contains(PollEvents::ERROR)) {
                return true;
            }
            if w.tx.send(Wakeup { socket, events }).is_ok() {
                woken += 1;
            }
            false
        });
        woken
    }

    /// Forget every waiter registered by `caller`.
    pub fn remove_caller(&mut self, caller: CallerId) -> usize {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.caller != caller);
        before - self.waiters.len()
    }

    /// Drop every waiter; their callers observe a cancelled wait.
    pub fn clear(&mut self) {
        self.waiters.clear();
    }
}

/// How a suspended caller came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Woken,
    TimedOut,
    Cancelled,
}

/// Suspend until a wakeup arrives, every sender is gone, or `deadline`.
pub async fn wait(rx: &mut WakeRx, deadline: Option<Instant>) -> WaitOutcome {
    let recv = rx.recv();
    let got = match deadline {
        Some(at) => match tokio::time::timeout_at(at, recv).await {
            Ok(got) => got,
            Err(_) => return WaitOutcome::TimedOut,
        },
        None => recv.await,
    };
    match got {
        Some(_) => WaitOutcome::Woken,
        None => WaitOutcome::Cancelled,
    }
}

/// Absolute deadline for an optional relative timeout.
///
/// A timeout too large to represent as an instant waits forever.
pub fn deadline_after(timeout: Option<Duration>) -> Option<Instant> {
    timeout.and_then(|t| Instant::now().checked_add(t))
}

/// Sockets touched by one dispatch batch, woken together afterwards.
#[derive(Debug, Default)]
pub struct Woken {
    pending: HashMap<SocketId, PollEvents>,
}

impl Woken {
    pub fn mark(&mut self, socket: SocketId, events: PollEvents) {
        *self.pending.entry(socket).or_default() |= events;
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Signal every marked socket that still exists.
    pub fn flush(&mut self, sockets: &SocketTable) {
        for (id, events) in self.pending.drain() {
            if let Some(sock) = sockets.get(id) {
                sock.signal(events);
            }
        }
    }
}
