//! Point-to-point link model used for transaction and block propagation
//!
//! The network is a full mesh of deliver-at-time-t links. Each directed link
//! gets a bandwidth drawn once at construction; delivery delay is the fixed
//! per-hop propagation time plus the transmission time of the payload.

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::{node::NodeId, scheduler::SimTime};

/// Lowest bandwidth a link can be assigned, in bytes per second. Keeps badly
/// seeded draws from producing zero or negative throughput.
const MIN_THROUGHPUT: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct Network {
    propagation_delay: SimTime,
    /// Bytes per second for each directed link, indexed `[from][to]`.
    throughput: Vec<Vec<f64>>,
}

impl Network {
    /// Builds the link mesh for `num_nodes` nodes, sampling each directed
    /// link's bandwidth from Normal(`throughput_mean`, `throughput_sd`).
    pub fn new<R: Rng>(
        num_nodes: usize,
        propagation_delay: SimTime,
        throughput_mean: f64,
        throughput_sd: f64,
        rng: &mut R,
    ) -> Self {
        let dist = Normal::new(throughput_mean, throughput_sd.max(0.0))
            .unwrap_or_else(|_| {
                Normal::new(MIN_THROUGHPUT, 0.0).expect("zero spread is valid")
            });

        let throughput = (0..num_nodes)
            .map(|_| {
                (0..num_nodes)
                    .map(|_| dist.sample(rng).max(MIN_THROUGHPUT))
                    .collect()
            })
            .collect();

        Network {
            propagation_delay,
            throughput,
        }
    }

    /// Delivery delay for a payload of `size` bytes sent from `from` to
    /// `to`: per-hop propagation time plus transmission time on the link.
    pub fn delay(&self, from: NodeId, to: NodeId, size: u64) -> SimTime {
        let bandwidth = self.throughput[from.0][to.0];
        let transmission_ms = size as f64 / bandwidth * 1_000.0;
        self.propagation_delay + transmission_ms.round() as SimTime
    }
}
