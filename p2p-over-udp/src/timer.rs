//! Per-connection retransmit timeout estimation.
//!
//! [`RetryState`] is the retry/back-off record the retransmission monitor
//! keeps for each connection:
//! - a clean acknowledgement averages the timeout with the observed RTT
//!   (`rto = (rto + rtt) / 2`), floored at `min_rto`;
//! - an expiry grows the timeout by `backoff_percent`, capped at `max_rto`,
//!   and counts one retry.
//!
//! This module only computes values; scheduling lives in
//! [`crate::retransmit`].

use std::time::Duration;

use crate::config::RetransmitConfig;

/// Retry counter and current timeout for one connection.
#[derive(Debug, Clone)]
pub struct RetryState {
    /// Resends since the last acknowledgement that made progress.
    pub retries: u32,
    /// Timeout applied to the next (re)transmission.
    pub rto: Duration,
    min_rto: Duration,
    max_rto: Duration,
    backoff_percent: u32,
}

impl RetryState {
    pub fn new(config: &RetransmitConfig) -> Self {
        Self {
            retries: 0,
            rto: config.initial_rto,
            min_rto: config.min_rto,
            max_rto: config.max_rto,
            backoff_percent: config.backoff_percent,
        }
    }

    /// Shrink the timeout toward an RTT observed on a segment that never
    /// missed its deadline.
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.rto = ((self.rto + sample) / 2).max(self.min_rto);
    }

    /// Account for one expiry: count the retry and grow the timeout.
    pub fn back_off(&mut self) {
        self.retries += 1;
        let grown = self.rto + self.rto * self.backoff_percent / 100;
        // Make sure tiny timeouts still grow.
        let grown = grown.max(self.rto + Duration::from_millis(1));
        self.rto = grown.min(self.max_rto);
    }

    /// Progress was made: the peer is alive again.
    pub fn reset_retries(&mut self) {
        self.retries = 0;
    }
}
