//! Client transaction workload generation
//!
//! Arrivals form a Poisson process (exponential inter-arrival gaps at the
//! configured rate), sizes and fee values are Normal draws clamped positive,
//! and each transaction lands on a uniformly chosen node. The conflict
//! generator pairs a fresh transaction with an earlier one inside a
//! dispersion window, producing the double-spend pairs the attack studies
//! need.

use rand::Rng;
use rand_distr::{Distribution, Exp, Normal};

use crate::{
    node::NodeId,
    scheduler::SimTime,
    simulation::IdAllocator,
    transaction::{Transaction, TxId},
};

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Transaction arrival rate, in transactions per second.
    pub lambda: f64,
    pub num_transactions: usize,
    pub tx_size_mean: f64,
    pub tx_size_sd: f64,
    pub tx_fee_mean: f64,
    pub tx_fee_sd: f64,
    pub has_conflicts: bool,
    /// How far back (in transactions) a conflict peer may sit.
    pub conflict_dispersion: usize,
    /// Probability that a transaction conflicts with an earlier one.
    pub conflict_likelihood: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        WorkloadConfig {
            lambda: 2.0,
            num_transactions: 100,
            tx_size_mean: 250.0,
            tx_size_sd: 50.0,
            tx_fee_mean: 100.0,
            tx_fee_sd: 20.0,
            has_conflicts: false,
            conflict_dispersion: 10,
            conflict_likelihood: 0.1,
        }
    }
}

/// Generates the arrival schedule for one simulation run. IDs come from the
/// simulation's allocator so explicitly scheduled transactions and generated
/// ones never collide.
pub fn generate<R: Rng>(
    config: &WorkloadConfig,
    num_nodes: usize,
    ids: &mut IdAllocator,
    rng: &mut R,
) -> Vec<(SimTime, NodeId, Transaction)> {
    if num_nodes == 0 || config.num_transactions == 0 {
        return Vec::new();
    }

    let gap = Exp::new(config.lambda.max(f64::MIN_POSITIVE))
        .expect("positive arrival rate");
    let size = Normal::new(config.tx_size_mean, config.tx_size_sd.max(0.0))
        .expect("valid size distribution");
    let fee = Normal::new(config.tx_fee_mean, config.tx_fee_sd.max(0.0))
        .expect("valid fee distribution");

    let mut arrivals = Vec::with_capacity(config.num_transactions);
    let mut at: SimTime = 0;
    for _ in 0..config.num_transactions {
        let gap_ms = (gap.sample(rng) * 1_000.0).max(1.0) as SimTime;
        at += gap_ms;

        let tx = Transaction::new(
            ids.next_tx_id(),
            size.sample(rng).max(1.0) as u64,
            fee.sample(rng).max(1.0) as u64,
        );
        let node = NodeId(rng.gen_range(0..num_nodes));
        arrivals.push((at, node, tx));
    }

    if config.has_conflicts {
        assign_conflicts(config, &mut arrivals, rng);
    }

    arrivals
}

/// Pairs transactions into conflicts. Each transaction rolls once against
/// the likelihood; on success it conflicts with a uniformly chosen earlier
/// transaction from the dispersion window that is still unpaired.
fn assign_conflicts<R: Rng>(
    config: &WorkloadConfig,
    arrivals: &mut [(SimTime, NodeId, Transaction)],
    rng: &mut R,
) {
    for i in 1..arrivals.len() {
        if arrivals[i].2.conflicts_with.is_some() {
            continue;
        }
        if !rng.gen_bool(config.conflict_likelihood.clamp(0.0, 1.0)) {
            continue;
        }

        let window_start = i.saturating_sub(config.conflict_dispersion.max(1));
        let peer_index = rng.gen_range(window_start..i);
        if arrivals[peer_index].2.conflicts_with.is_some() {
            continue;
        }

        let (peer_id, own_id) = (arrivals[peer_index].2.id, arrivals[i].2.id);
        arrivals[i].2.conflicts_with = Some(peer_id);
        arrivals[peer_index].2.conflicts_with = Some(own_id);
    }
}

/// A conflict peer named on a transaction, for direct scheduling in tests
/// and programmatic workloads.
pub fn conflicting_pair(
    first: TxId,
    second: TxId,
    size: u64,
    fee: u64,
) -> (Transaction, Transaction) {
    (
        Transaction::with_conflict(first, size, fee, second),
        Transaction::with_conflict(second, size, fee, first),
    )
}
