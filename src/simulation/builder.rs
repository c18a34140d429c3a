use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::{
    behavior::{
        AlwaysSatisfied, Behavior, BehaviorKind, BehaviorSwitch, DependencyRegistry,
        Honest, Malicious, MaliciousConfig,
    },
    behavior::malicious::{DEFAULT_MAX_CHAIN_LENGTH, DEFAULT_MIN_CHAIN_LENGTH},
    config::{Config, HashPowerChange},
    network::Network,
    node::{Node, NodeCore, NodeId},
    report::{ReportFlags, Reporter},
    scheduler::{EventKind, Scheduler, SimTime},
    transaction::{Transaction, TxId},
    workload::{self, WorkloadConfig},
};

use super::{
    AttackMetrics, IdAllocator, ProtocolParams, SimCtx, Simulation,
};

#[derive(Debug, Clone)]
struct NodeSpec {
    kind: BehaviorKind,
    /// Explicit hash rate; sampled from the configured distribution when
    /// absent.
    hash_power: Option<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationBuildError {
    #[error("no nodes were added")]
    NoNodes,
    #[error("simulation terminate time must be greater than 0")]
    NoTerminateTime,
    #[error("a malicious node requires a target transaction")]
    NoTargetTransaction,
}

/// Builds a [`Simulation`].
#[derive(Debug, Clone)]
pub struct SimulationBuilder {
    sim_id: u32,
    seed: u64,
    nodes: Vec<NodeSpec>,
    pow_difficulty: f64,
    hash_power_mean: f64,
    hash_power_sd: f64,
    max_block_size: u64,
    min_size_to_mine: u64,
    min_value_to_mine: u64,
    terminate_at: Option<SimTime>,
    max_events: u64,
    target_tx: Option<TxId>,
    required_confirmations: u32,
    min_chain_length: u64,
    max_chain_length: u64,
    propagation_delay: SimTime,
    throughput_mean: f64,
    throughput_sd: f64,
    arrivals: Vec<(SimTime, NodeId, Transaction)>,
    workload: Option<WorkloadConfig>,
    hash_power_changes: Vec<HashPowerChange>,
    behavior_changes: Vec<(SimTime, NodeId, BehaviorSwitch)>,
    flags: ReportFlags,
    deps: Arc<dyn DependencyRegistry>,
}

impl Default for SimulationBuilder {
    fn default() -> Self {
        SimulationBuilder {
            sim_id: 1,
            seed: 0,
            nodes: Vec::new(),
            pow_difficulty: 1.0e13,
            hash_power_mean: 2.5e10,
            hash_power_sd: 0.0,
            max_block_size: 1_000_000,
            min_size_to_mine: 0,
            min_value_to_mine: 0,
            terminate_at: None,
            max_events: 10_000_000,
            target_tx: None,
            required_confirmations: 0,
            min_chain_length: DEFAULT_MIN_CHAIN_LENGTH,
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            propagation_delay: 10,
            throughput_mean: 1.0e6,
            throughput_sd: 0.0,
            arrivals: Vec::new(),
            workload: None,
            hash_power_changes: Vec::new(),
            behavior_changes: Vec::new(),
            flags: ReportFlags::default(),
            deps: Arc::new(AlwaysSatisfied),
        }
    }
}

impl SimulationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derives a builder from a parsed configuration file: honest nodes
    /// first, then malicious ones, with hash rates sampled per node at
    /// build time.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new()
            .pow_difficulty(config.pow_difficulty)
            .hash_power_distribution(config.hash_power_mean, config.hash_power_sd)
            .max_block_size(config.max_block_size)
            .min_size_to_mine(config.min_size_to_mine)
            .min_value_to_mine(config.min_value_to_mine)
            .terminate_at(config.terminate_at)
            .required_confirmations(config.required_confirmations)
            .reveal_thresholds(config.min_chain_length, config.max_chain_length)
            .propagation_delay(config.propagation_time)
            .throughput(config.throughput_mean, config.throughput_sd)
            .workload(config.workload.clone())
            .report_flags(config.flags);

        if let Some(target) = config.target_transaction {
            builder = builder.target_transaction(target);
        }
        for _ in 0..config.num_honest_nodes {
            builder = builder.add_honest();
        }
        for _ in 0..config.num_malicious_nodes {
            builder = builder.add_malicious();
        }
        for change in &config.hash_power_changes {
            builder = builder.hash_power_change(*change);
        }

        builder
    }

    pub fn sim_id(mut self, sim_id: u32) -> Self {
        self.sim_id = sim_id;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Adds an honest node whose hash rate is sampled at build time.
    pub fn add_honest(mut self) -> Self {
        self.nodes.push(NodeSpec {
            kind: BehaviorKind::Honest,
            hash_power: None,
        });
        self
    }

    /// Adds an honest node with an explicit hash rate in hashes per second.
    pub fn add_honest_with_power(mut self, hash_power: f64) -> Self {
        self.nodes.push(NodeSpec {
            kind: BehaviorKind::Honest,
            hash_power: Some(hash_power),
        });
        self
    }

    /// Adds a malicious node whose hash rate is sampled at build time.
    pub fn add_malicious(mut self) -> Self {
        self.nodes.push(NodeSpec {
            kind: BehaviorKind::Malicious,
            hash_power: None,
        });
        self
    }

    /// Adds a malicious node with an explicit hash rate.
    pub fn add_malicious_with_power(mut self, hash_power: f64) -> Self {
        self.nodes.push(NodeSpec {
            kind: BehaviorKind::Malicious,
            hash_power: Some(hash_power),
        });
        self
    }

    /// Expected hashes to win a block.
    pub fn pow_difficulty(mut self, difficulty: f64) -> Self {
        self.pow_difficulty = difficulty;
        self
    }

    /// Distribution from which unspecified node hash rates are drawn.
    pub fn hash_power_distribution(mut self, mean: f64, sd: f64) -> Self {
        self.hash_power_mean = mean;
        self.hash_power_sd = sd;
        self
    }

    pub fn max_block_size(mut self, bytes: u64) -> Self {
        self.max_block_size = bytes;
        self
    }

    pub fn min_size_to_mine(mut self, bytes: u64) -> Self {
        self.min_size_to_mine = bytes;
        self
    }

    pub fn min_value_to_mine(mut self, value: u64) -> Self {
        self.min_value_to_mine = value;
        self
    }

    pub fn terminate_at(mut self, time: SimTime) -> Self {
        self.terminate_at = Some(time);
        self
    }

    pub fn max_events(mut self, cap: u64) -> Self {
        self.max_events = cap;
        self
    }

    /// The transaction every malicious node tries to double-spend.
    pub fn target_transaction(mut self, tx: TxId) -> Self {
        self.target_tx = Some(tx);
        self
    }

    /// Confirmations the target must accumulate before an attack starts.
    pub fn required_confirmations(mut self, confirmations: u32) -> Self {
        self.required_confirmations = confirmations;
        self
    }

    /// Reveal-rule thresholds on public-chain growth.
    pub fn reveal_thresholds(mut self, min: u64, max: u64) -> Self {
        self.min_chain_length = min;
        self.max_chain_length = max;
        self
    }

    /// Fixed per-hop propagation delay.
    pub fn propagation_delay(mut self, delay: SimTime) -> Self {
        self.propagation_delay = delay;
        self
    }

    /// Link bandwidth distribution, bytes per second.
    pub fn throughput(mut self, mean: f64, sd: f64) -> Self {
        self.throughput_mean = mean;
        self.throughput_sd = sd;
        self
    }

    /// Schedules one client transaction explicitly. Used by tests and
    /// programmatic workloads; mixes freely with a generated workload.
    pub fn schedule_transaction(
        mut self,
        at: SimTime,
        node: NodeId,
        tx: Transaction,
    ) -> Self {
        self.arrivals.push((at, node, tx));
        self
    }

    /// Attaches a generated workload.
    pub fn workload(mut self, config: WorkloadConfig) -> Self {
        self.workload = Some(config);
        self
    }

    /// Schedules a hash-rate mutation.
    pub fn hash_power_change(mut self, change: HashPowerChange) -> Self {
        self.hash_power_changes.push(change);
        self
    }

    /// Schedules a behavior swap.
    pub fn behavior_change(
        mut self,
        at: SimTime,
        node: NodeId,
        switch: BehaviorSwitch,
    ) -> Self {
        self.behavior_changes.push((at, node, switch));
        self
    }

    pub fn report_flags(mut self, flags: ReportFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Swaps in a custom transaction dependency registry.
    pub fn dependency_registry(
        mut self,
        deps: Arc<dyn DependencyRegistry>,
    ) -> Self {
        self.deps = deps;
        self
    }

    /// Creates a [`Simulation`] from the configured parameters.
    pub fn build(self) -> Result<Simulation, SimulationBuildError> {
        use SimulationBuildError::*;

        let SimulationBuilder {
            sim_id,
            seed,
            nodes,
            pow_difficulty,
            hash_power_mean,
            hash_power_sd,
            max_block_size,
            min_size_to_mine,
            min_value_to_mine,
            terminate_at,
            max_events,
            target_tx,
            required_confirmations,
            min_chain_length,
            max_chain_length,
            propagation_delay,
            throughput_mean,
            throughput_sd,
            arrivals,
            workload,
            hash_power_changes,
            behavior_changes,
            flags,
            deps,
        } = self;

        if nodes.is_empty() {
            return Err(NoNodes);
        }
        let terminate_at = match terminate_at {
            Some(t) if t > 0 => t,
            _ => return Err(NoTerminateTime),
        };

        let any_malicious =
            nodes.iter().any(|spec| spec.kind == BehaviorKind::Malicious);
        if any_malicious && target_tx.is_none() {
            return Err(NoTargetTransaction);
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let num_nodes = nodes.len();

        let network = Network::new(
            num_nodes,
            propagation_delay,
            throughput_mean,
            throughput_sd,
            &mut rng,
        );

        // Resolve hash rates, sampling unspecified ones.
        let power_dist = Normal::new(hash_power_mean, hash_power_sd.max(0.0))
            .expect("valid hash power distribution");
        let powers: Vec<f64> = nodes
            .iter()
            .map(|spec| {
                spec.hash_power
                    .unwrap_or_else(|| power_dist.sample(&mut rng).max(0.0))
            })
            .collect();

        let total_power: f64 = powers.iter().sum();
        let malicious_power: f64 = nodes
            .iter()
            .zip(&powers)
            .filter(|(spec, _)| spec.kind == BehaviorKind::Malicious)
            .map(|(_, power)| power)
            .sum();
        let attacker_share = if total_power > 0.0 {
            malicious_power / total_power
        } else {
            0.0
        };

        let params = ProtocolParams {
            max_block_size,
            min_size_to_mine,
            min_value_to_mine,
            terminate_at,
            max_events,
            min_chain_length,
            max_chain_length,
        };

        let mut ids = IdAllocator::new();
        if let Some(highest) =
            arrivals.iter().map(|(_, _, tx)| tx.id.0).max()
        {
            ids.reserve_tx_ids_through(highest);
        }

        let mut scheduler = Scheduler::new();
        for (at, node, tx) in &arrivals {
            scheduler.schedule(
                *at,
                EventKind::TransactionArrival {
                    node: *node,
                    tx: tx.clone(),
                },
            );
        }

        if let Some(workload_config) = &workload {
            for (at, node, tx) in
                workload::generate(workload_config, num_nodes, &mut ids, &mut rng)
            {
                scheduler
                    .schedule(at, EventKind::TransactionArrival { node, tx });
            }
        }

        for change in &hash_power_changes {
            scheduler.schedule(
                change.time,
                EventKind::HashPowerChange {
                    node: change.node,
                    new_power: change.hash_power,
                },
            );
        }

        for (at, node, switch) in behavior_changes {
            scheduler.schedule(at, EventKind::BehaviorChange { node, switch });
        }

        let nodes: Vec<Node> = nodes
            .into_iter()
            .zip(powers)
            .enumerate()
            .map(|(index, (spec, hash_power))| {
                let behavior: Box<dyn Behavior> = match spec.kind {
                    BehaviorKind::Honest => Box::new(Honest::new()),
                    BehaviorKind::Malicious => {
                        let target = target_tx
                            .expect("checked above: malicious requires target");
                        let mut config =
                            MaliciousConfig::new(target, required_confirmations);
                        config.min_chain_length = min_chain_length;
                        config.max_chain_length = max_chain_length;
                        Box::new(Malicious::new(config))
                    }
                };
                Node {
                    core: NodeCore::new(
                        NodeId(index),
                        hash_power,
                        pow_difficulty,
                    ),
                    behavior,
                }
            })
            .collect();

        let ctx = SimCtx {
            sim_id,
            scheduler,
            rng,
            network,
            reporter: Reporter::new(flags),
            metrics: AttackMetrics::new(attacker_share, required_confirmations),
            ids,
            params,
            deps,
            num_nodes,
            started: std::time::Instant::now(),
        };

        Ok(Simulation::new(nodes, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::SimulationBuilder;
    use crate::transaction::TxId;

    #[test]
    fn example_build() {
        SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .add_honest_with_power(1.0e10)
            .terminate_at(10_000)
            .build()
            .expect("valid simulation build");
    }

    #[test]
    fn build_requires_nodes() {
        assert!(SimulationBuilder::new().terminate_at(1_000).build().is_err());
    }

    #[test]
    fn build_requires_terminate_time() {
        assert!(SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .build()
            .is_err());
    }

    #[test]
    fn malicious_node_requires_target() {
        let err = SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .add_malicious_with_power(1.0e10)
            .terminate_at(1_000)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("target transaction"));

        SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .add_malicious_with_power(1.0e10)
            .target_transaction(TxId(10))
            .terminate_at(1_000)
            .build()
            .expect("target supplied");
    }
}
