//! Shared retransmission scheduler for every stream connection.
//!
//! The monitor keeps the exact bytes of each unacknowledged segment together
//! with its resend deadline.  It knows nothing about segment contents or
//! connection state:
//!
//! - [`RetransmitMonitor::track`] schedules a segment at `now + rto`;
//! - [`RetransmitMonitor::confirm`] drops everything a cumulative ACK covers;
//! - [`RetransmitMonitor::run`] resends expired segments and, once a
//!   connection's oldest segment has been resent `max_retries` times without
//!   progress, reports the connection as failed to the dispatcher.
//!
//! Only the oldest outstanding segment of a connection counts toward the
//! retry ceiling and grows the timeout.  Later segments stuck behind it are
//! resent on the same schedule without being charged.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::config::RetransmitConfig;
use crate::registry::LogicalPort;
use crate::socket::{lock, SocketId};
use crate::timer::RetryState;

#[derive(Debug)]
struct Pending {
    port: Weak<LogicalPort>,
    to: SocketAddr,
    bytes: Vec<u8>,
    first_sent: Instant,
    deadline: Instant,
    resent: bool,
}

#[derive(Debug)]
struct ConnEntries {
    retry: RetryState,
    pending: BTreeMap<u64, Pending>,
}

#[derive(Debug, Default)]
struct MonitorState {
    conns: HashMap<SocketId, ConnEntries>,
    /// `(deadline, connection, seq)` ordered by deadline.
    deadlines: BTreeSet<(Instant, SocketId, u64)>,
}

impl MonitorState {
    fn purge(&mut self, conn: SocketId) -> usize {
        let Some(entries) = self.conns.remove(&conn) else {
            return 0;
        };
        for (seq, p) in &entries.pending {
            self.deadlines.remove(&(p.deadline, conn, *seq));
        }
        entries.pending.len()
    }
}

/// A resend decided under the lock and performed after releasing it.
struct Resend {
    port: Weak<LogicalPort>,
    to: SocketAddr,
    bytes: Vec<u8>,
}

#[derive(Debug)]
pub struct RetransmitMonitor {
    config: RetransmitConfig,
    state: Mutex<MonitorState>,
    wake: Notify,
    failures: mpsc::UnboundedSender<SocketId>,
}

impl RetransmitMonitor {
    pub(crate) fn new(config: RetransmitConfig, failures: mpsc::UnboundedSender<SocketId>) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
            wake: Notify::new(),
            failures,
        }
    }

    /// Schedule `bytes` (already framed for `to`) for resending until a
    /// cumulative ACK beyond `seq` confirms it.
    pub fn track(&self, conn: SocketId, port: &Arc<LogicalPort>, to: SocketAddr, seq: u64, bytes: Vec<u8>) {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let entries = state.conns.entry(conn).or_insert_with(|| ConnEntries {
            retry: RetryState::new(&self.config),
            pending: BTreeMap::new(),
        });
        let deadline = now + entries.retry.rto;
        let previous = entries.pending.insert(
            seq,
            Pending {
                port: Arc::downgrade(port),
                to,
                bytes,
                first_sent: now,
                deadline,
                resent: false,
            },
        );
        if let Some(old) = previous {
            state.deadlines.remove(&(old.deadline, conn, seq));
        }
        state.deadlines.insert((deadline, conn, seq));

        let earliest = state.deadlines.first().map(|&(at, _, _)| at) == Some(deadline);
        drop(state);
        if earliest {
            self.wake.notify_one();
        }
    }

    /// Drop every entry of `conn` with a sequence number below `ack`.
    ///
    /// Returns how many entries were confirmed.
    pub fn confirm(&self, conn: SocketId, ack: u64) -> usize {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let MonitorState { conns, deadlines } = &mut *state;
        let Some(entries) = conns.get_mut(&conn) else {
            return 0;
        };

        let still_pending = entries.pending.split_off(&ack);
        let acked = std::mem::replace(&mut entries.pending, still_pending);
        if acked.is_empty() {
            return 0;
        }

        let mut sample = None;
        for (seq, p) in &acked {
            deadlines.remove(&(p.deadline, conn, *seq));
            if !p.resent {
                sample = Some(now.duration_since(p.first_sent));
            }
        }
        entries.retry.reset_retries();
        if let Some(rtt) = sample {
            entries.retry.record_rtt_sample(rtt);
        }
        log::trace!(
            "conn {conn}: ack {ack} confirmed {} segment(s), rto {:?}",
            acked.len(),
            entries.retry.rto
        );
        acked.len()
    }

    /// Forget every entry of `conn`.
    pub fn purge(&self, conn: SocketId) -> usize {
        lock(&self.state).purge(conn)
    }

    /// Unacknowledged segments of `conn`.
    pub fn pending(&self, conn: SocketId) -> usize {
        lock(&self.state)
            .conns
            .get(&conn)
            .map_or(0, |entries| entries.pending.len())
    }

    /// Retries charged to `conn` since its last progress.
    pub fn retries(&self, conn: SocketId) -> u32 {
        lock(&self.state)
            .conns
            .get(&conn)
            .map_or(0, |entries| entries.retry.retries)
    }

    fn next_deadline(&self) -> Option<Instant> {
        lock(&self.state).deadlines.first().map(|&(at, _, _)| at)
    }

    /// Timer loop.  Runs until the task is aborted.
    pub(crate) async fn run(self: Arc<Self>) {
        loop {
            match self.next_deadline() {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.wake.notified() => continue,
                    }
                }
                None => {
                    self.wake.notified().await;
                    continue;
                }
            }
            self.fire_expired(Instant::now());
        }
    }

    fn fire_expired(&self, now: Instant) {
        let mut resends = Vec::new();
        let mut failed = Vec::new();
        {
            let mut state = lock(&self.state);
            while let Some(&(at, conn, seq)) = state.deadlines.first() {
                if at > now {
                    break;
                }
                state.deadlines.pop_first();

                let Some(entries) = state.conns.get_mut(&conn) else {
                    continue;
                };
                let oldest = entries.pending.keys().next() == Some(&seq);
                if oldest && entries.retry.retries >= self.config.max_retries {
                    failed.push(conn);
                    state.purge(conn);
                    continue;
                }
                if oldest {
                    entries.retry.back_off();
                }
                let rto = entries.retry.rto;
                let Some(p) = entries.pending.get_mut(&seq) else {
                    continue;
                };
                p.resent = true;
                p.deadline = now + rto;
                resends.push(Resend {
                    port: p.port.clone(),
                    to: p.to,
                    bytes: p.bytes.clone(),
                });
                let deadline = p.deadline;
                state.deadlines.insert((deadline, conn, seq));
            }
        }

        for resend in resends {
            let Some(port) = resend.port.upgrade() else {
                continue;
            };
            log::trace!("port {}: resending {} bytes to {}", port.port(), resend.bytes.len(), resend.to);
            if let Err(e) = port.transmit(resend.to, &resend.bytes) {
                log::debug!("resend to {} failed: {e}", resend.to);
            }
        }
        for conn in failed {
            log::warn!("conn {conn}: retransmission limit reached, giving up");
            // The dispatcher is gone only during shutdown.
            let _ = self.failures.send(conn);
        }
    }
}
