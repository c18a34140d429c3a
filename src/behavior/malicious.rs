//! The double-spending strategy: watch, withhold, reveal

use tracing::debug;

use crate::{
    analysis::AttackResolution,
    behavior::{honest::Honest, Behavior},
    block::{Block, BlockId},
    node::NodeCore,
    report::AttackLogRow,
    simulation::SimCtx,
    transaction::{Transaction, TxId},
};

/// Default lower bound on public-chain growth before a reveal is considered.
pub const DEFAULT_MIN_CHAIN_LENGTH: u64 = 2;
/// Default public-chain growth at which the attack gives up waiting and
/// reveals whatever it has.
pub const DEFAULT_MAX_CHAIN_LENGTH: u64 = 15;

/// Parameters of a [`Malicious`] behavior.
#[derive(Debug, Clone)]
pub struct MaliciousConfig {
    /// The transaction the attacker wants reordered out of the honest chain.
    pub target_tx: TxId,
    /// Confirmations the target must accumulate before the attack starts
    /// (0 = attack as soon as the target appears in a block).
    pub required_confirmations: u32,
    pub min_chain_length: u64,
    pub max_chain_length: u64,
}

impl MaliciousConfig {
    pub fn new(target_tx: TxId, required_confirmations: u32) -> Self {
        MaliciousConfig {
            target_tx,
            required_confirmations,
            min_chain_length: DEFAULT_MIN_CHAIN_LENGTH,
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
        }
    }
}

/// Runs an honest shadow for transaction gossip but diverges on block
/// handling around a single target transaction.
///
/// The state machine is Idle until a block carrying the target appears
/// (Watching), counts confirmations derived from the structure rather than
/// an accumulator, then mines a private fork off the block preceding the
/// target (Attacking) and publishes it once it is provably ahead of a
/// non-trivial public extension, or once patience runs out (Revealing).
#[derive(Debug)]
pub struct Malicious {
    shadow: Honest,
    target_tx: TxId,
    required_confirmations: u32,
    min_chain_length: u64,
    max_chain_length: u64,
    /// Attacker-mined blocks withheld from the network, in mining order.
    hidden_chain: Vec<Block>,
    /// Public block just before the target transaction; parent of the first
    /// hidden block at reveal time.
    fork_base: Option<BlockId>,
    /// Height of the block containing the target, once observed.
    target_block_height: Option<u64>,
    attack_in_progress: bool,
    public_height_at_attack_start: u64,
    attack_id: Option<usize>,
}

impl Malicious {
    pub fn new(config: MaliciousConfig) -> Self {
        Malicious {
            shadow: Honest::new(),
            target_tx: config.target_tx,
            required_confirmations: config.required_confirmations,
            min_chain_length: config.min_chain_length,
            max_chain_length: config.max_chain_length,
            hidden_chain: Vec::new(),
            fork_base: None,
            target_block_height: None,
            attack_in_progress: false,
            public_height_at_attack_start: 0,
            attack_id: None,
        }
    }

    pub fn target_transaction(&self) -> TxId {
        self.target_tx
    }

    pub fn required_confirmations(&self) -> u32 {
        self.required_confirmations
    }

    pub fn attack_in_progress(&self) -> bool {
        self.attack_in_progress
    }

    /// Confirmations of the target transaction, derived from the structure:
    /// depth of the longest tip above the target's block.
    fn confirmations(&self, node: &NodeCore) -> Option<u64> {
        self.target_block_height
            .map(|h| node.chain.height().saturating_sub(h))
    }

    fn enough_confirmations(&self, node: &NodeCore) -> bool {
        if self.required_confirmations == 0 {
            return true;
        }
        self.confirmations(node)
            .is_some_and(|c| c >= self.required_confirmations as u64)
    }

    fn attack_row(
        &self,
        node: &NodeCore,
        ctx: &SimCtx,
        event_type: &str,
        block: BlockId,
        block_height: u64,
        description: String,
    ) -> AttackLogRow {
        AttackLogRow {
            sim_id: ctx.sim_id,
            sim_time: ctx.now(),
            sys_time: ctx.sys_time(),
            node: node.id,
            event_type: event_type.to_string(),
            tx: self.target_tx,
            block,
            block_height,
            hidden_chain_length: self.hidden_chain.len(),
            public_chain_length: node.chain.height(),
            description,
        }
    }

    /// Transition into Attacking: snapshot the public height, drop the
    /// target from the pool so no hidden block ever carries it, and open an
    /// attack record.
    fn start_attack(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        block: BlockId,
        block_height: u64,
    ) {
        // Growth is measured from the fork base, so the reveal rule's
        // "hidden chain longer than public growth" coincides with the
        // revealed chain actually overtaking the public tip. For an
        // ungated attack this is the tip minus the target block itself.
        let target_height = self
            .target_block_height
            .expect("attack started before the target transaction was observed");
        self.public_height_at_attack_start = target_height.saturating_sub(1);

        self.attack_in_progress = true;
        let confirmations = self.confirmations(node).unwrap_or(0);
        self.attack_id =
            Some(ctx.metrics.record_attack_start(ctx.now(), confirmations));

        node.pool.remove(self.target_tx);
        node.mining_pool.remove(self.target_tx);

        let row = self.attack_row(
            node,
            ctx,
            "Attack Start",
            block,
            block_height,
            format!(
                "target transaction appeared with {confirmations} confirmations"
            ),
        );
        ctx.reporter.attack_event(row);

        debug!(
            node = node.id.0,
            time = ctx.now(),
            confirmations,
            "starting double-spend attack"
        );
    }

    /// Public-chain handling while attacking: the block joins the public
    /// structure and the mining pool is rebuilt without the target, but the
    /// pool keeps the block's transactions so the fork can re-mine them.
    fn handle_reception_in_attack(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        block: Block,
    ) {
        match node.chain.add(block) {
            Ok(_) => {
                if let Some(attack) = self.attack_id {
                    ctx.metrics.record_public_block(attack);
                }
            }
            Err(err) => {
                let (sim_id, now) = (ctx.sim_id, ctx.now());
                ctx.reporter.error(sim_id, now, err.to_string());
                return;
            }
        }

        node.reconstruct_mining_pool(ctx);
        node.mining_pool.remove(self.target_tx);
        node.consider_mining(ctx);
    }

    /// Mining cleanup after a hidden block: identical to the honest
    /// post-validation reset except the rebuilt mining pool drops the
    /// target.
    fn manage_mining_post_validation(&self, node: &mut NodeCore, ctx: &mut SimCtx) {
        node.stop_mining();
        let mined = node.mining_pool.clone();
        node.pool.remove_group(&mined);
        node.reconstruct_mining_pool(ctx);
        node.mining_pool.remove(self.target_tx);
        node.consider_mining(ctx);
    }

    fn public_growth_since_attack(&self, node: &NodeCore) -> u64 {
        node.chain
            .height()
            .saturating_sub(self.public_height_at_attack_start)
    }

    /// The reveal rule: publish once the hidden chain is provably longer
    /// than a non-trivial public extension, or once the public chain has
    /// outgrown all patience.
    fn should_reveal(&self, public_growth: u64) -> bool {
        (self.hidden_chain.len() as u64 > public_growth
            && public_growth > self.min_chain_length)
            || public_growth > self.max_chain_length
    }

    fn check_and_reveal(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        trigger: BlockId,
        trigger_height: u64,
    ) {
        let growth = self.public_growth_since_attack(node);
        if !self.should_reveal(growth) {
            return;
        }

        let row = self.attack_row(
            node,
            ctx,
            "Chain Reveal",
            trigger,
            trigger_height,
            format!("revealing hidden chain after public growth of {growth}"),
        );
        ctx.reporter.attack_event(row);
        self.reveal(node, ctx);
    }

    /// Publishes the hidden chain: the first block attaches to the fork
    /// base, each further block to its predecessor. Every block is appended
    /// to the public structure and propagated. Afterwards the state machine
    /// returns to Idle.
    fn reveal(&mut self, node: &mut NodeCore, ctx: &mut SimCtx) {
        let fork_base = self.fork_base.unwrap_or_else(|| node.chain.genesis());
        let hidden = std::mem::take(&mut self.hidden_chain);

        let mut prev = fork_base;
        for mut block in hidden {
            block.parent_id = Some(prev);
            prev = block.id;

            let id = block.id;
            match node.chain.add(block) {
                Ok(_) => {
                    let published = node.chain[id].block.clone();
                    node.broadcast_container(&published, ctx);
                }
                Err(err) => {
                    let (sim_id, now) = (ctx.sim_id, ctx.now());
                    ctx.reporter.error(sim_id, now, err.to_string());
                }
            }
        }

        let displaced = !node.chain.longest_chain_contains_tx(self.target_tx);
        if let Some(attack) = self.attack_id {
            let resolution = if displaced {
                AttackResolution::Success
            } else {
                AttackResolution::Failure
            };
            ctx.metrics.record_attack_end(attack, ctx.now(), resolution);
        }

        node.pool.remove(self.target_tx);

        let tip = node.chain.longest_tip();
        let tip_height = node.chain.height();
        let row = self.attack_row(
            node,
            ctx,
            "Reveal Complete",
            tip,
            tip_height,
            if displaced {
                "target transaction displaced from the longest chain".into()
            } else {
                "target transaction survived on the longest chain".into()
            },
        );
        ctx.reporter.attack_event(row);

        debug!(node = node.id.0, time = ctx.now(), displaced, "chain reveal");

        self.attack_in_progress = false;
        self.fork_base = None;
        self.target_block_height = None;
        self.public_height_at_attack_start = 0;
        self.attack_id = None;
    }

    /// Seeds the watching state from a structure the node already holds.
    /// Used when a behavior-change event installs this strategy mid-run: a
    /// target that is already buried deeply enough starts the attack in the
    /// same event.
    pub(crate) fn initialize_from_structure(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
    ) {
        let Some(target_block) = node.chain.find_block_with_tx(self.target_tx)
        else {
            return;
        };

        let data = &node.chain[target_block];
        self.target_block_height = Some(data.height);
        self.fork_base = data.block.parent_id;

        if self.enough_confirmations(node) {
            let height = data.height;
            self.start_attack(node, ctx, target_block, height);
        }
    }
}

impl Behavior for Malicious {
    fn name(&self) -> &'static str {
        "Malicious"
    }

    // Transaction gossip stays truthful; divergence is block handling only.
    fn on_client_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    ) {
        self.shadow.on_client_transaction(node, ctx, tx);
    }

    fn on_propagated_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    ) {
        self.shadow.on_propagated_transaction(node, ctx, tx);
    }

    fn on_propagated_container(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        mut block: Block,
    ) {
        block.current_node = Some(node.id);
        block.last_event = "Node Receives Propagated Block".into();
        // Validation metadata belongs to the miner's copy, not this one.
        block.difficulty = -1.0;
        block.cycles = -1.0;
        let (sim_id, now, sys) = (ctx.sim_id, ctx.now(), ctx.sys_time());
        ctx.reporter.block_event(
            sim_id,
            now,
            sys,
            node.id,
            &block,
            "Node Receives Propagated Block",
        );

        let carries_target = block.contains(self.target_tx);
        let already_known = node.chain.contains(block.id);
        let block_id = block.id;

        if !self.attack_in_progress && carries_target {
            // Idle -> Watching: the target has surfaced in a public block.
            self.fork_base = block.parent_id;

            if !already_known {
                self.handle_reception_in_attack(node, ctx, block);

                let height = node
                    .chain
                    .get(block_id)
                    .map(|data| data.height)
                    .unwrap_or(0);
                if self.target_block_height.is_none() {
                    self.target_block_height = Some(height);
                }

                if self.enough_confirmations(node) {
                    self.start_attack(node, ctx, block_id, height);
                } else {
                    debug!(
                        node = node.id.0,
                        height,
                        required = self.required_confirmations,
                        current = self.confirmations(node).unwrap_or(0),
                        "target transaction seen, waiting for confirmations"
                    );
                }
            } else {
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &block,
                    "Propagated Block Discarded (already exists)",
                );
            }
        } else if self.attack_in_progress {
            if !already_known {
                self.handle_reception_in_attack(node, ctx, block);
            } else {
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &block,
                    "Propagated Block Discarded (already exists)",
                );
            }

            let height = node
                .chain
                .get(block_id)
                .map(|data| data.height)
                .unwrap_or(0);
            self.check_and_reveal(node, ctx, block_id, height);
        } else if self.target_block_height.is_some()
            && !self.enough_confirmations(node)
        {
            // Watching: count confirmations as the public chain grows.
            if !already_known {
                Honest::handle_new_block_reception(node, ctx, block);

                if self.enough_confirmations(node) {
                    if let Some(target_block) =
                        node.chain.find_block_with_tx(self.target_tx)
                    {
                        let data = &node.chain[target_block];
                        let height = data.height;
                        self.fork_base = data.block.parent_id;
                        self.start_attack(node, ctx, target_block, height);
                    }
                } else {
                    debug!(
                        node = node.id.0,
                        required = self.required_confirmations,
                        current = self.confirmations(node).unwrap_or(0),
                        "confirmation count still short of the gate"
                    );
                }
            } else {
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &block,
                    "Propagated Block Discarded (already exists)",
                );
            }
        } else {
            // No target in sight (or gate already satisfied): plain honest
            // integration.
            if !already_known {
                Honest::handle_new_block_reception(node, ctx, block);
            } else {
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &block,
                    "Propagated Block Discarded (already exists)",
                );
            }
        }
    }

    fn on_validation_complete(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        mut block: Block,
    ) {
        let cycles = block.cycles;
        block.stamp_validation(
            node.mining_pool.clone(),
            ctx.now(),
            node.id,
            node.operating_difficulty,
            cycles,
        );

        let (sim_id, now, sys) = (ctx.sim_id, ctx.now(), ctx.sys_time());
        ctx.reporter.block_event(
            sim_id,
            now,
            sys,
            node.id,
            &block,
            "Node Completes Validation",
        );

        if self.attack_in_progress {
            // Hidden blocks never touch the public structure and are not
            // propagated; their parents are assigned at reveal time.
            let block_id = block.id;
            if !node.chain.contains(block_id) {
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &block,
                    "Adding Block to Hidden Chain",
                );
                self.hidden_chain.push(block);
                if let Some(attack) = self.attack_id {
                    ctx.metrics.record_hidden_block(attack);
                }
                let row = self.attack_row(
                    node,
                    ctx,
                    "Hidden Block Mined",
                    block_id,
                    0,
                    format!(
                        "hidden chain extended to {} blocks",
                        self.hidden_chain.len()
                    ),
                );
                ctx.reporter.attack_event(row);
            } else {
                ctx.reporter.error(
                    sim_id,
                    now,
                    format!(
                        "node {} mined hidden block {} that overlaps its \
                         structure",
                        node.id, block_id
                    ),
                );
            }

            self.manage_mining_post_validation(node, ctx);
            self.check_and_reveal(node, ctx, block_id, 0);
        } else if block.contains(self.target_tx) {
            // The attacker itself mined the block carrying the target.
            let block_id = block.id;
            if !node.chain.contains(block_id) {
                block.parent_id = None;
                match node.chain.add(block) {
                    Ok(_) => {
                        let published = node.chain[block_id].block.clone();
                        node.broadcast_container(&published, ctx);

                        self.fork_base = published.parent_id;
                        let height = published.height;
                        if self.target_block_height.is_none() {
                            self.target_block_height = Some(height);
                        }

                        if self.enough_confirmations(node) {
                            self.start_attack(node, ctx, block_id, height);
                        } else {
                            debug!(
                                node = node.id.0,
                                height,
                                required = self.required_confirmations,
                                "mined the target transaction, waiting for \
                                 confirmations"
                            );
                        }
                    }
                    Err(err) => {
                        ctx.reporter.error(sim_id, now, err.to_string());
                    }
                }
            } else {
                ctx.reporter.error(
                    sim_id,
                    now,
                    format!(
                        "node {} mined block {} that overlaps its structure",
                        node.id, block_id
                    ),
                );
            }

            // The pool keeps the mined transactions: if the gate is already
            // satisfied the fork base sits below them and the hidden chain
            // will re-mine them. Only the target is excluded.
            node.stop_mining();
            node.reconstruct_mining_pool(ctx);
            node.mining_pool.remove(self.target_tx);
            node.consider_mining(ctx);
        } else {
            // Ordinary own block: honest handling, then re-derive the
            // confirmation count in case this block was the one that
            // satisfied the gate.
            let block_id = block.id;
            if !node.chain.contains(block_id) {
                block.parent_id = None;
                match node.chain.add(block) {
                    Ok(_) => {
                        let published = node.chain[block_id].block.clone();
                        node.broadcast_container(&published, ctx);
                    }
                    Err(err) => {
                        ctx.reporter.error(sim_id, now, err.to_string());
                    }
                }
            } else {
                ctx.reporter.error(
                    sim_id,
                    now,
                    format!(
                        "node {} mined block {} that overlaps its structure",
                        node.id, block_id
                    ),
                );
            }

            Honest::post_validation(node, ctx);

            if self.target_block_height.is_some()
                && self.enough_confirmations(node)
            {
                if let Some(target_block) =
                    node.chain.find_block_with_tx(self.target_tx)
                {
                    let data = &node.chain[target_block];
                    let height = data.height;
                    self.fork_base = data.block.parent_id;
                    self.start_attack(node, ctx, target_block, height);
                }
            }
        }
    }

    fn on_simulation_end(&mut self, node: &mut NodeCore, ctx: &mut SimCtx) {
        if !self.attack_in_progress {
            return;
        }

        // Reveal conditions never met: the attempt counts as unresolved,
        // not as a success.
        if let Some(attack) = self.attack_id {
            ctx.metrics.record_attack_end(
                attack,
                ctx.now(),
                AttackResolution::Unresolved,
            );
        }
        let tip = node.chain.longest_tip();
        let tip_height = node.chain.height();
        let row = self.attack_row(
            node,
            ctx,
            "Attack Unresolved",
            tip,
            tip_height,
            "simulation terminated before the reveal conditions were met".into(),
        );
        ctx.reporter.attack_event(row);
    }
}
