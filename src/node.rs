//! Mining nodes and the shared proof-of-work mining controller

use rand_distr::{Distribution, Exp};

use crate::{
    behavior::Behavior,
    block::Block,
    blockchain::Blockchain,
    scheduler::{EventHandle, EventKind, SimTime},
    simulation::SimCtx,
    transaction::{Transaction, TransactionGroup},
};

/// Unique identifier of a node, doubling as its index in the simulation's
/// node list.
#[repr(transparent)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl From<usize> for NodeId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// Mining-controller state. A node is either idle or mining with a pending
/// validation event it can abandon through the event's handle.
#[derive(Debug, Clone, Default)]
pub enum MiningState {
    #[default]
    Idle,
    Mining {
        validation: EventHandle,
    },
}

/// The state of a single mining node, independent of its strategy.
///
/// Behavior strategies receive `&mut NodeCore` on every event; the node's
/// [`Behavior`] lives alongside in [`Node`] so the two can be borrowed
/// disjointly during dispatch.
#[derive(Debug)]
pub struct NodeCore {
    pub id: NodeId,
    /// Hash rate in hashes per second.
    pub hash_power: f64,
    /// Expected number of hashes needed to win a block.
    pub operating_difficulty: f64,
    /// All accepted, not-yet-mined transactions.
    pub pool: TransactionGroup,
    /// Snapshot of the pool currently being mined.
    pub mining_pool: TransactionGroup,
    pub chain: Blockchain,
    state: MiningState,
}

/// A node together with its behavior strategy.
pub struct Node {
    pub core: NodeCore,
    pub behavior: Box<dyn Behavior>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("core", &self.core)
            .field("behavior", &self.behavior.name())
            .finish()
    }
}

impl NodeCore {
    pub fn new(id: NodeId, hash_power: f64, operating_difficulty: f64) -> Self {
        NodeCore {
            id,
            hash_power,
            operating_difficulty,
            pool: TransactionGroup::new(),
            mining_pool: TransactionGroup::new(),
            chain: Blockchain::new(),
            state: MiningState::Idle,
        }
    }

    #[inline]
    pub fn is_mining(&self) -> bool {
        matches!(self.state, MiningState::Mining { .. })
    }

    /// Mining is worthwhile while the mining pool's fees exceed the
    /// configured minimum. (A size threshold also exists in configuration
    /// but is informational only.)
    #[inline]
    pub fn worth_mining(&self, ctx: &SimCtx) -> bool {
        self.mining_pool.total_fee() > ctx.params.min_value_to_mine
    }

    /// Rebuilds the mining pool as the most profitable slice of the pool
    /// that fits in a block. Called after every pool change.
    pub fn reconstruct_mining_pool(&mut self, ctx: &SimCtx) {
        self.mining_pool = self.pool.top_by_fee_per_size(ctx.params.max_block_size);
    }

    /// The mining decision loop.
    ///
    /// Idle and worthwhile: build a candidate from the mining pool, draw a
    /// PoW duration, and schedule the validation event. Mining and no longer
    /// worthwhile: abandon the pending draw. The other two combinations are
    /// no-ops.
    pub fn consider_mining(&mut self, ctx: &mut SimCtx) {
        match (self.worth_mining(ctx), self.is_mining()) {
            (true, false) => {
                let Some(duration) = self.draw_pow_duration(ctx) else {
                    return;
                };

                let mut candidate =
                    Block::candidate(ctx.ids.next_block_id(), self.mining_pool.clone());
                candidate.difficulty = self.operating_difficulty;
                candidate.cycles = self.hash_power * duration as f64 / 1_000.0;

                let validation = ctx.scheduler.schedule(
                    ctx.scheduler.now() + duration,
                    EventKind::ValidationComplete {
                        node: self.id,
                        block: candidate,
                    },
                );
                self.state = MiningState::Mining { validation };
            }
            (true, true) => {
                // Already mining a worthwhile pool; the pending draw stands.
            }
            (false, true) => self.stop_mining(),
            (false, false) => {}
        }
    }

    /// Abandons any pending validation draw and returns to idle.
    pub fn stop_mining(&mut self) {
        if let MiningState::Mining { validation } =
            std::mem::take(&mut self.state)
        {
            validation.ignore();
        }
    }

    /// Samples the time to win the current PoW race:
    /// Exponential(rate = hash_power / operating_difficulty), converted to
    /// simulation time units. `None` when the node cannot mine at all.
    fn draw_pow_duration(&self, ctx: &mut SimCtx) -> Option<SimTime> {
        if self.hash_power <= 0.0 || self.operating_difficulty <= 0.0 {
            return None;
        }

        let rate = self.hash_power / self.operating_difficulty;
        let dist = Exp::new(rate).ok()?;
        let seconds: f64 = dist.sample(&mut ctx.rng);
        Some(((seconds * 1_000.0) as SimTime).max(1))
    }

    /// Accepts a transaction into the pool and reconsiders mining, the
    /// common tail of both transaction-reception handlers.
    pub fn receive_transaction(&mut self, tx: Transaction, ctx: &mut SimCtx) {
        self.pool.push(tx);
        self.reconstruct_mining_pool(ctx);
        self.consider_mining(ctx);
    }

    /// Schedules delivery of a transaction to every peer.
    pub fn broadcast_transaction(&self, tx: &Transaction, ctx: &mut SimCtx) {
        for peer in (0..ctx.num_nodes).map(NodeId) {
            if peer == self.id {
                continue;
            }
            let delay = ctx.network.delay(self.id, peer, tx.size);
            ctx.scheduler.schedule(
                ctx.scheduler.now() + delay,
                EventKind::TransactionPropagation {
                    node: peer,
                    tx: tx.clone(),
                },
            );
        }
    }

    /// Schedules delivery of a block clone to every peer.
    pub fn broadcast_container(&self, block: &Block, ctx: &mut SimCtx) {
        let size = block.txns.total_size();
        for peer in (0..ctx.num_nodes).map(NodeId) {
            if peer == self.id {
                continue;
            }
            let delay = ctx.network.delay(self.id, peer, size);
            ctx.scheduler.schedule(
                ctx.scheduler.now() + delay,
                EventKind::ContainerPropagation {
                    node: peer,
                    block: block.clone(),
                },
            );
        }
    }
}
