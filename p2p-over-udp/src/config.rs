//! Tunable parameters for a [`crate::stack::NetStack`].
//!
//! Every field has a sensible default; the binary overrides a subset from
//! CLI flags and tests shrink the timers so failure paths finish quickly.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::simulator::FaultConfig;

/// Retransmission timing.
#[derive(Debug, Clone)]
pub struct RetransmitConfig {
    /// Timeout used before any round-trip sample is available.
    pub initial_rto: Duration,
    /// Smoothing never drives the timeout below this.
    pub min_rto: Duration,
    /// Back-off never grows the timeout beyond this.
    pub max_rto: Duration,
    /// Resends allowed per connection before it is declared failed.
    pub max_retries: u32,
    /// Growth of the timeout on each expiry, in percent.
    pub backoff_percent: u32,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            min_rto: Duration::from_millis(20),
            max_rto: Duration::from_secs(10),
            max_retries: 10,
            backoff_percent: 10,
        }
    }
}

/// Stack-wide configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Host address every real UDP socket binds to.
    pub bind_ip: IpAddr,
    /// Real port used when a socket sends or connects before binding.
    /// `0` lets the OS pick one, once, for the whole stack.
    pub default_port: u16,
    /// First vport handed out by automatic allocation.
    pub vport_base: u16,
    /// Upper bound for any listener's backlog.
    pub max_backlog: usize,
    /// Datagrams the dispatcher routes before waking callers.
    pub dispatch_batch: usize,
    pub retransmit: RetransmitConfig,
    /// Fault injection on every transmitted datagram (tests only).
    pub faults: Option<FaultConfig>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            default_port: 3658,
            vport_base: 30000,
            max_backlog: 64,
            dispatch_batch: 64,
            retransmit: RetransmitConfig::default(),
            faults: None,
        }
    }
}

impl NetConfig {
    /// Loopback-only configuration with an OS-chosen default port.
    pub fn loopback() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            default_port: 0,
            ..Self::default()
        }
    }
}
