//! # Fault Injection
//!
//! Byzantine behavior on demand. A lying node substitutes a faulty value
//! for the honest one on some fraction of its outgoing edges, which is how
//! the rest of the fleet gets exercised against equivocation.
//!
//! The injector is consulted once per outgoing edge, never once per
//! instance: a liar may tell every recipient a different story within the
//! same consensus round.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config;

/// How a lying node picks the value it substitutes for the honest one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStyle {
    /// A random entry from the decoy set, drawn independently per edge.
    /// Distinct recipients can receive distinct values, the textbook
    /// Byzantine equivocation.
    Decoy,
    /// The fixed sentinel on every faulted edge. Predictable, which makes
    /// traffic captures easier to read.
    Sentinel,
}

/// Per-node fault injection state. Off until an operator enables it.
pub struct FaultInjector {
    lying: bool,
    rate: f64,
    style: FaultStyle,
}

impl FaultInjector {
    /// Creates a truthful injector with the given style armed for later.
    pub fn new(style: FaultStyle) -> Self {
        Self {
            lying: false,
            rate: 1.0,
            style,
        }
    }

    /// Enables lying at the given rate, clamped to `[0, 1]`. Returns the
    /// rate actually applied.
    pub fn enable(&mut self, rate: f64) -> f64 {
        self.rate = rate.clamp(0.0, 1.0);
        self.lying = true;
        self.rate
    }

    /// Back to honesty.
    pub fn disable(&mut self) {
        self.lying = false;
    }

    /// Whether the node is currently lying.
    pub fn is_lying(&self) -> bool {
        self.lying
    }

    /// The current lie rate.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Picks the value carried on one outgoing edge. Call once per
    /// recipient: each edge rolls independently.
    pub fn choose(&self, honest: &str) -> String {
        if !self.lying {
            return honest.to_string();
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() <= self.rate {
            match self.style {
                FaultStyle::Sentinel => config::FAULT_SENTINEL.to_string(),
                FaultStyle::Decoy => config::FAULT_DECOYS
                    .choose(&mut rng)
                    .copied()
                    .unwrap_or(config::FAULT_SENTINEL)
                    .to_string(),
            }
        } else {
            honest.to_string()
        }
    }
}
