//! Optional fault injection on the transmit path.
//!
//! Real networks drop, reorder, and duplicate packets.  To exercise the
//! reliability mechanisms without depending on actual network conditions,
//! every datagram a [`crate::registry::LogicalPort`] sends can be passed
//! through a [`FaultInjector`] first:
//!
//! | Fault       | Description                                          |
//! |-------------|------------------------------------------------------|
//! | Loss        | Drop the datagram with probability `loss_rate`.      |
//! | Duplication | Send the datagram twice.                             |
//! | Reordering  | Delay the datagram by `reorder_delay`, letting later |
//! |             | datagrams overtake it.                               |
//!
//! Decisions come from a seeded RNG so a failing test can be replayed.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    pub reorder_rate: f64,
    /// Fixed delay applied to reordered datagrams.
    pub reorder_delay: Duration,
    pub seed: u64,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            reorder_rate: 0.0,
            reorder_delay: Duration::ZERO,
            seed: 0,
        }
    }
}

/// What happens to one outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Deliver,
    Drop,
    Duplicate,
    Delay(Duration),
}

/// Seeded fault model shared by every send on one logical port.
#[derive(Debug)]
pub struct FaultInjector {
    config: FaultConfig,
    rng: StdRng,
}

impl FaultInjector {
    pub fn new(config: FaultConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self { config, rng }
    }

    /// Roll the dice for the next datagram.
    pub fn decide(&mut self) -> Fate {
        if self.roll(self.config.loss_rate) {
            Fate::Drop
        } else if self.roll(self.config.duplicate_rate) {
            Fate::Duplicate
        } else if self.roll(self.config.reorder_rate) {
            Fate::Delay(self.config.reorder_delay)
        } else {
            Fate::Deliver
        }
    }

    fn roll(&mut self, rate: f64) -> bool {
        rate > 0.0 && self.rng.gen::<f64>() < rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_always_delivers() {
        let mut f = FaultInjector::new(FaultConfig::default());
        assert!((0..1000).all(|_| f.decide() == Fate::Deliver));
    }

    #[test]
    fn full_loss_always_drops() {
        let mut f = FaultInjector::new(FaultConfig {
            loss_rate: 1.0,
            ..FaultConfig::default()
        });
        assert!((0..100).all(|_| f.decide() == Fate::Drop));
    }

    #[test]
    fn same_seed_same_decisions() {
        let config = FaultConfig {
            loss_rate: 0.3,
            duplicate_rate: 0.3,
            reorder_rate: 0.3,
            reorder_delay: Duration::from_millis(5),
            seed: 42,
        };
        let mut a = FaultInjector::new(config.clone());
        let mut b = FaultInjector::new(config);
        let xs: Vec<Fate> = (0..64).map(|_| a.decide()).collect();
        let ys: Vec<Fate> = (0..64).map(|_| b.decide()).collect();
        assert_eq!(xs, ys);
        assert!(xs.contains(&Fate::Drop));
        assert!(xs.contains(&Fate::Delay(Duration::from_millis(5))));
    }
}
