//! Building and running simulations

use std::{sync::Arc, time::Instant};

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    analysis::AttackMetrics,
    behavior::{BehaviorKind, BehaviorSwitch, DependencyRegistry, Honest, Malicious, MaliciousConfig},
    block::BlockId,
    blockchain::Blockchain,
    node::{Node, NodeId},
    report::Reporter,
    scheduler::{Event, EventKind, Scheduler, SimTime},
    transaction::TxId,
};

pub mod builder;

pub use builder::{SimulationBuildError, SimulationBuilder};

/// Per-simulation ID source for blocks and transactions. Owned by the
/// simulation so parallel runs never share counters.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next_block: usize,
    next_tx: u64,
}

impl IdAllocator {
    /// Block IDs start at 1; 0 is the genesis sentinel. Transaction IDs
    /// start at 1.
    pub fn new() -> Self {
        IdAllocator {
            next_block: 1,
            next_tx: 1,
        }
    }

    pub fn next_block_id(&mut self) -> BlockId {
        let id = self.next_block;
        self.next_block += 1;
        BlockId(id)
    }

    pub fn next_tx_id(&mut self) -> TxId {
        let id = self.next_tx;
        self.next_tx += 1;
        TxId(id)
    }

    /// Moves the transaction counter past explicitly scheduled IDs so
    /// generated workload never collides with them.
    pub fn reserve_tx_ids_through(&mut self, highest: u64) {
        self.next_tx = self.next_tx.max(highest + 1);
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Protocol-level constants shared by every node in a run.
#[derive(Debug, Clone)]
pub struct ProtocolParams {
    pub max_block_size: u64,
    /// Informational size threshold; the worth-mining check uses value only.
    pub min_size_to_mine: u64,
    pub min_value_to_mine: u64,
    pub terminate_at: SimTime,
    pub max_events: u64,
    pub min_chain_length: u64,
    pub max_chain_length: u64,
}

/// Everything an event handler can touch besides its own node: the
/// scheduler, the seeded RNG, the link model, the logs, and the attack
/// accounting. Split from the node list so behaviors can hold `&mut
/// NodeCore` and `&mut SimCtx` at once.
pub struct SimCtx {
    pub sim_id: u32,
    pub scheduler: Scheduler,
    pub rng: ChaCha8Rng,
    pub network: crate::network::Network,
    pub reporter: Reporter,
    pub metrics: AttackMetrics,
    pub ids: IdAllocator,
    pub params: ProtocolParams,
    pub deps: Arc<dyn DependencyRegistry>,
    pub num_nodes: usize,
    started: Instant,
}

impl SimCtx {
    /// Current simulation time.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.scheduler.now()
    }

    /// Wall-clock milliseconds since the run started, for the SysTime
    /// report columns.
    #[inline]
    pub fn sys_time(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl std::fmt::Debug for SimCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCtx")
            .field("sim_id", &self.sim_id)
            .field("now", &self.scheduler.now())
            .field("num_nodes", &self.num_nodes)
            .finish()
    }
}

/// A single configured simulation run. Built by [`SimulationBuilder`],
/// consumed by [`Simulation::run`].
#[derive(Debug)]
pub struct Simulation {
    nodes: Vec<Node>,
    ctx: SimCtx,
}

/// Everything a finished run leaves behind.
#[derive(Debug)]
pub struct SimulationOutput {
    pub sim_id: u32,
    /// Every node's final local structure, indexed by node ID.
    pub chains: Vec<Blockchain>,
    /// Every node's hash rate at termination, reconfiguration events
    /// applied.
    pub hash_powers: Vec<f64>,
    pub reporter: Reporter,
    pub metrics: AttackMetrics,
    pub events_dispatched: u64,
    pub final_time: SimTime,
}

impl Simulation {
    pub fn builder() -> SimulationBuilder {
        SimulationBuilder::new()
    }

    pub(crate) fn new(nodes: Vec<Node>, ctx: SimCtx) -> Self {
        Simulation { nodes, ctx }
    }

    /// Runs the event loop to completion: until the clock passes the
    /// terminate time, the queue drains, or the event cap is hit.
    pub fn run(mut self) -> SimulationOutput {
        loop {
            if self.ctx.scheduler.dispatched() >= self.ctx.params.max_events {
                break;
            }
            let Some(event) =
                self.ctx.scheduler.pop_until(self.ctx.params.terminate_at)
            else {
                break;
            };
            self.dispatch(event);
        }

        self.finish()
    }

    fn dispatch(&mut self, event: Event) {
        match event.kind {
            EventKind::TransactionArrival { node, tx } => {
                let Some(n) = self.nodes.get_mut(node.0) else {
                    self.event_error(node, "transaction arrival");
                    return;
                };
                n.behavior.on_client_transaction(&mut n.core, &mut self.ctx, tx);
            }
            EventKind::TransactionPropagation { node, tx } => {
                let Some(n) = self.nodes.get_mut(node.0) else {
                    self.event_error(node, "transaction propagation");
                    return;
                };
                n.behavior
                    .on_propagated_transaction(&mut n.core, &mut self.ctx, tx);
            }
            EventKind::ContainerPropagation { node, block } => {
                let Some(n) = self.nodes.get_mut(node.0) else {
                    self.event_error(node, "container propagation");
                    return;
                };
                n.behavior
                    .on_propagated_container(&mut n.core, &mut self.ctx, block);
            }
            EventKind::ValidationComplete { node, block } => {
                let Some(n) = self.nodes.get_mut(node.0) else {
                    self.event_error(node, "validation completion");
                    return;
                };
                // A live validation event implies the node is mining; every
                // path that stops mining ignores the pending event first.
                debug_assert!(
                    n.core.is_mining(),
                    "validation event fired for idle node {}",
                    node
                );
                n.behavior
                    .on_validation_complete(&mut n.core, &mut self.ctx, block);
            }
            EventKind::HashPowerChange { node, new_power } => {
                let Some(n) = self.nodes.get_mut(node.0) else {
                    self.event_error(node, "hash power change");
                    return;
                };
                // An in-flight validation draw keeps its fire time; the PoW
                // was already sampled. Only future draws see the new rate.
                n.core.hash_power = new_power;

                let (sim_id, now, sys) =
                    (self.ctx.sim_id, self.ctx.now(), self.ctx.sys_time());
                self.ctx.reporter.add_event(
                    sim_id,
                    now,
                    sys,
                    node,
                    None,
                    format!("Hash Power Change to {new_power}"),
                );
            }
            EventKind::BehaviorChange { node, switch } => {
                self.apply_behavior_change(node, switch);
            }
        }
    }

    fn apply_behavior_change(&mut self, node: NodeId, switch: BehaviorSwitch) {
        let Some(n) = self.nodes.get_mut(node.0) else {
            self.event_error(node, "behavior change");
            return;
        };

        let name = match switch.kind {
            BehaviorKind::Honest => {
                n.behavior = Box::new(Honest::new());
                "Honest"
            }
            BehaviorKind::Malicious => {
                let Some(target_tx) = switch.target_tx else {
                    let (sim_id, now) = (self.ctx.sim_id, self.ctx.now());
                    self.ctx.reporter.error(
                        sim_id,
                        now,
                        format!(
                            "behavior change to Malicious for node {node} \
                             carries no target transaction"
                        ),
                    );
                    return;
                };

                let mut config = MaliciousConfig::new(
                    target_tx,
                    switch.required_confirmations.unwrap_or(0),
                );
                config.min_chain_length = self.ctx.params.min_chain_length;
                config.max_chain_length = self.ctx.params.max_chain_length;

                let mut malicious = Malicious::new(config);
                // A target already buried deeply enough starts the attack
                // within this same event.
                malicious.initialize_from_structure(&mut n.core, &mut self.ctx);
                n.behavior = Box::new(malicious);
                "Malicious"
            }
        };

        let (sim_id, now, sys) =
            (self.ctx.sim_id, self.ctx.now(), self.ctx.sys_time());
        self.ctx.reporter.add_event(
            sim_id,
            now,
            sys,
            node,
            switch.target_tx,
            format!("Behavior Change to {name}"),
        );
    }

    fn event_error(&mut self, node: NodeId, what: &str) {
        let (sim_id, now) = (self.ctx.sim_id, self.ctx.now());
        self.ctx.reporter.error(
            sim_id,
            now,
            format!("no node {node} present for {what} event"),
        );
    }

    fn finish(mut self) -> SimulationOutput {
        for n in &mut self.nodes {
            n.behavior.on_simulation_end(&mut n.core, &mut self.ctx);
        }

        let final_time = self.ctx.scheduler.now();
        let sys = self.ctx.sys_time();
        let sim_id = self.ctx.sim_id;
        for n in &self.nodes {
            self.ctx.reporter.report_chain_state(
                sim_id,
                final_time,
                sys,
                n.core.id,
                &n.core.chain,
            );
        }

        let hash_powers =
            self.nodes.iter().map(|n| n.core.hash_power).collect();
        SimulationOutput {
            sim_id,
            chains: self.nodes.into_iter().map(|n| n.core.chain).collect(),
            hash_powers,
            reporter: self.ctx.reporter,
            metrics: self.ctx.metrics,
            events_dispatched: self.ctx.scheduler.dispatched(),
            final_time,
        }
    }
}

/// A set of independent runs of one configuration, executed in parallel.
///
/// Parallelism lives only here, at the outermost level; each individual
/// simulation is strictly single-threaded so that a given seed always
/// reproduces the same event order.
#[derive(Debug, Clone)]
pub struct SimulationGroup {
    builder: SimulationBuilder,
    first: u32,
    last: u32,
    base_seed: u64,
}

impl SimulationGroup {
    pub fn new(builder: SimulationBuilder) -> Self {
        SimulationGroup {
            builder,
            first: 1,
            last: 1,
            base_seed: 0,
        }
    }

    /// Inclusive range of simulation IDs to run.
    pub fn runs(mut self, first: u32, last: u32) -> Self {
        self.first = first;
        self.last = last.max(first);
        self
    }

    /// Base seed; each run is seeded with `base_seed + sim_id`.
    pub fn base_seed(mut self, seed: u64) -> Self {
        self.base_seed = seed;
        self
    }

    pub fn run_all(self) -> Result<Vec<SimulationOutput>, SimulationBuildError> {
        let SimulationGroup {
            builder,
            first,
            last,
            base_seed,
        } = self;

        let ids: Vec<u32> = (first..=last).collect();
        let mut outputs = ids
            .into_par_iter()
            .map(|sim_id| {
                builder
                    .clone()
                    .sim_id(sim_id)
                    .seed(base_seed.wrapping_add(sim_id as u64))
                    .build()
                    .map(Simulation::run)
            })
            .collect::<Result<Vec<_>, _>>()?;

        outputs.sort_by_key(|output| output.sim_id);
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::{SimulationBuilder, SimulationGroup, SimulationOutput};
    use crate::{
        config::HashPowerChange,
        node::NodeId,
        transaction::{Transaction, TxId},
    };

    /// Three honest nodes plus one malicious node with a quarter of the
    /// total hash rate, fed evenly sized transactions at one-second
    /// intervals. Transaction 10 is the double-spend target.
    fn attack_builder(
        num_txns: u64,
        required_confirmations: u32,
        malicious_power: f64,
        honest_power: f64,
    ) -> SimulationBuilder {
        let mut builder = SimulationBuilder::new()
            .add_honest_with_power(honest_power)
            .add_honest_with_power(honest_power)
            .add_honest_with_power(honest_power)
            .add_malicious_with_power(malicious_power)
            .target_transaction(TxId(10))
            .required_confirmations(required_confirmations)
            .pow_difficulty(2.5e12)
            .max_block_size(750)
            .propagation_delay(10)
            .throughput(1.0e6, 0.0)
            .terminate_at(7_200_000)
            .seed(42);

        for id in 1..=num_txns {
            builder = builder.schedule_transaction(
                id * 1_000,
                NodeId((id % 3) as usize),
                Transaction::new(TxId(id), 250, 100),
            );
        }

        builder
    }

    fn malicious_node() -> NodeId {
        NodeId(3)
    }

    /// First simulation time at which the malicious node logged a block
    /// event whose contents include the given transaction.
    fn first_block_with_tx(output: &SimulationOutput, tx: TxId) -> Option<u64> {
        output
            .reporter
            .block_log()
            .iter()
            .filter(|row| row.node == malicious_node())
            .filter(|row| {
                row.content.split(';').any(|id| id == tx.0.to_string())
            })
            .map(|row| row.sim_time)
            .min()
    }

    #[test]
    fn single_honest_node_mines_its_pool() {
        let output = SimulationBuilder::new()
            .add_honest_with_power(2.5e10)
            .pow_difficulty(2.5e12)
            .terminate_at(7_200_000)
            .schedule_transaction(
                1_000,
                NodeId(0),
                Transaction::new(TxId(1), 250, 100),
            )
            .seed(7)
            .build()
            .unwrap()
            .run();

        assert_eq!(output.chains[0].height(), 1);
        assert!(output.chains[0].longest_chain_contains_tx(TxId(1)));
        assert!(output
            .reporter
            .block_log()
            .iter()
            .any(|row| row.event_type == "Node Completes Validation"));
        // Close-out dumped the structure: genesis plus the mined block.
        assert_eq!(output.reporter.structure_log().len(), 2);
    }

    #[test]
    fn mining_stops_below_the_value_threshold() {
        let output = SimulationBuilder::new()
            .add_honest_with_power(2.5e10)
            .pow_difficulty(2.5e12)
            .min_value_to_mine(1_000)
            .terminate_at(7_200_000)
            .schedule_transaction(
                1_000,
                NodeId(0),
                Transaction::new(TxId(1), 250, 100),
            )
            .seed(7)
            .build()
            .unwrap()
            .run();

        // A 100-fee pool never clears the 1000 threshold.
        assert_eq!(output.chains[0].height(), 0);
    }

    #[test]
    fn runs_are_reproducible_per_seed() {
        let run = |seed: u64| {
            attack_builder(12, 0, 2.5e10, 2.5e10)
                .seed(seed)
                .build()
                .unwrap()
                .run()
        };

        let a = run(42);
        let b = run(42);
        let rows =
            |o: &SimulationOutput| -> Vec<String> {
                o.reporter.block_log().iter().map(|r| {
                    // SysTime is wall clock; everything else must match.
                    format!(
                        "{},{},{},{},{},{},{}",
                        r.sim_time, r.node, r.block, r.height,
                        r.content, r.event_type, r.cycles,
                    )
                })
                .collect()
            };
        assert_eq!(rows(&a), rows(&b));
        assert_eq!(a.final_time, b.final_time);
    }

    #[test]
    fn zero_confirmation_attack_starts_when_target_appears() {
        let output = attack_builder(12, 0, 2.5e10, 2.5e10)
            .build()
            .unwrap()
            .run();

        let starts: Vec<_> = output
            .reporter
            .attack_log()
            .iter()
            .filter(|row| row.event_type == "Attack Start")
            .collect();
        assert_eq!(starts.len(), 1, "exactly one attack start");

        // The attack begins in the very event that showed the malicious
        // node the first block carrying the target.
        let first_seen = first_block_with_tx(&output, TxId(10))
            .expect("target transaction was mined");
        assert_eq!(starts[0].sim_time, first_seen);
        assert_eq!(starts[0].tx, TxId(10));

        assert_eq!(output.metrics.attempts(), 1);
    }

    #[test]
    fn confirmation_gate_delays_the_attack() {
        let output = attack_builder(40, 5, 2.5e10, 2.5e10)
            .build()
            .unwrap()
            .run();

        let starts: Vec<_> = output
            .reporter
            .attack_log()
            .iter()
            .filter(|row| row.event_type == "Attack Start")
            .collect();
        assert_eq!(starts.len(), 1);

        // The gate held: the attack waited past the block that introduced
        // the target, and the observed confirmation count honored it.
        let first_seen = first_block_with_tx(&output, TxId(10))
            .expect("target transaction was mined");
        assert!(starts[0].sim_time > first_seen);
        assert!(output.metrics.outcomes()[0].confirmations_at_start >= 5);
    }

    #[test]
    fn majority_attacker_displaces_the_target() {
        // 70% attacker, six-confirmation recipient.
        let output = attack_builder(200, 6, 7.0e10, 1.0e10)
            .build()
            .unwrap()
            .run();

        assert!(
            output
                .reporter
                .attack_log()
                .iter()
                .any(|row| row.event_type == "Chain Reveal"),
            "reveal conditions were met before termination"
        );
        assert_eq!(output.metrics.successes(), 1);

        // The target is gone from the longest path everywhere, though it
        // remains present on the abandoned branch.
        for chain in &output.chains {
            assert!(!chain.longest_chain_contains_tx(TxId(10)));
            assert!(chain.contains_tx(TxId(10)));
        }
    }

    #[test]
    fn attack_without_reveal_ends_unresolved() {
        // A weak attacker gated on five confirmations with few remaining
        // transactions: the reveal rule cannot be satisfied in time.
        let output = attack_builder(20, 5, 0.5e10, 2.5e10)
            .build()
            .unwrap()
            .run();

        if output.metrics.attempts() == 1 {
            assert_eq!(
                output.metrics.successes() + output.metrics.failures()
                    + output.metrics.unresolved(),
                1
            );
            if output.metrics.unresolved() == 1 {
                assert!(output
                    .reporter
                    .attack_log()
                    .iter()
                    .any(|row| row.event_type == "Attack Unresolved"));
            }
        }
    }

    #[test]
    fn hash_power_change_applies_to_the_named_node_only() {
        let initial = 2.35597310021e10;
        let output = SimulationBuilder::new()
            .add_honest_with_power(initial)
            .add_honest_with_power(initial)
            .add_honest_with_power(initial)
            .add_honest_with_power(initial)
            .terminate_at(100_000)
            .hash_power_change(HashPowerChange {
                node: NodeId(3),
                hash_power: 5.0e10,
                time: 50_000,
            })
            .build()
            .unwrap()
            .run();

        assert_eq!(output.hash_powers[3], 5.0e10);
        for node in 0..3 {
            assert_eq!(output.hash_powers[node], initial);
        }
        assert!(output
            .reporter
            .event_log()
            .iter()
            .any(|row| row.sim_time == 50_000
                && row.node == NodeId(3)
                && row.description.contains("Hash Power Change")));
    }

    #[test]
    fn simultaneous_hash_power_changes_apply_in_schedule_order() {
        let output = SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .add_honest_with_power(1.0e10)
            .terminate_at(10_000)
            .hash_power_change(HashPowerChange {
                node: NodeId(1),
                hash_power: 3.0e10,
                time: 5_000,
            })
            .hash_power_change(HashPowerChange {
                node: NodeId(1),
                hash_power: 7.0e10,
                time: 5_000,
            })
            .build()
            .unwrap()
            .run();

        // FIFO among same-time events: the later-scheduled change wins.
        assert_eq!(output.hash_powers[1], 7.0e10);
    }

    #[test]
    fn hash_power_change_for_unknown_node_is_logged_not_fatal() {
        let output = SimulationBuilder::new()
            .add_honest_with_power(1.0e10)
            .terminate_at(10_000)
            .hash_power_change(HashPowerChange {
                node: NodeId(9),
                hash_power: 3.0e10,
                time: 5_000,
            })
            .build()
            .unwrap()
            .run();

        assert!(output
            .reporter
            .error_log()
            .iter()
            .any(|row| row.description.contains("no node 9")));
    }

    #[test]
    fn behavior_change_with_buried_target_attacks_at_the_swap() {
        use crate::behavior::{BehaviorKind, BehaviorSwitch};

        // Two honest nodes mine out the whole workload; node 1 then turns
        // malicious on a target that is already buried well past the
        // two-confirmation gate, so the attack starts within the swap event.
        let mut builder = SimulationBuilder::new()
            .add_honest_with_power(2.5e10)
            .add_honest_with_power(2.5e10)
            .pow_difficulty(2.5e12)
            .max_block_size(750)
            .terminate_at(2_000_000)
            .seed(5)
            .behavior_change(
                1_000_000,
                NodeId(1),
                BehaviorSwitch {
                    kind: BehaviorKind::Malicious,
                    target_tx: Some(TxId(10)),
                    required_confirmations: Some(2),
                },
            );
        for id in 1..=20 {
            builder = builder.schedule_transaction(
                id * 1_000,
                NodeId((id % 2) as usize),
                Transaction::new(TxId(id), 250, 100),
            );
        }
        let output = builder.build().unwrap().run();

        assert!(output
            .reporter
            .event_log()
            .iter()
            .any(|row| row.sim_time == 1_000_000
                && row.description.contains("Behavior Change to Malicious")));

        let starts: Vec<_> = output
            .reporter
            .attack_log()
            .iter()
            .filter(|row| row.event_type == "Attack Start")
            .collect();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].sim_time, 1_000_000);
        assert_eq!(starts[0].node, NodeId(1));
        assert!(output.metrics.outcomes()[0].confirmations_at_start >= 2);
    }

    #[test]
    fn group_runs_are_ordered_and_independent() {
        let builder = attack_builder(12, 0, 2.5e10, 2.5e10);
        let outputs = SimulationGroup::new(builder)
            .runs(1, 4)
            .base_seed(100)
            .run_all()
            .unwrap();

        assert_eq!(outputs.len(), 4);
        for (index, output) in outputs.iter().enumerate() {
            assert_eq!(output.sim_id, index as u32 + 1);
            assert!(output.events_dispatched > 0);
        }
    }
}
