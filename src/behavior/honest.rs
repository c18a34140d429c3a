//! The canonical mining strategy: verify, integrate, propagate

use crate::{
    behavior::Behavior,
    block::Block,
    node::NodeCore,
    simulation::SimCtx,
    transaction::Transaction,
};

/// Follows the consensus protocol without deviation: accepts conflict-free
/// transactions, mines on the longest tip, publishes every block as soon as
/// it validates, and adopts longer chains as they arrive.
#[derive(Debug, Default, Clone)]
pub struct Honest;

impl Honest {
    pub fn new() -> Self {
        Honest
    }

    /// A transaction is conflict-free iff its declared conflict peer is
    /// unknown to both the pool and the structure.
    fn conflict_free(node: &NodeCore, tx: &Transaction) -> bool {
        match tx.conflicts_with {
            None => true,
            Some(peer) => {
                !(node.pool.contains(peer) || node.chain.contains_tx(peer))
            }
        }
    }

    fn discard_transaction(
        node: &NodeCore,
        ctx: &mut SimCtx,
        tx: &Transaction,
        reason: &str,
    ) {
        let (sim_id, now, sys) = (ctx.sim_id, ctx.now(), ctx.sys_time());
        ctx.reporter.add_event(
            sim_id,
            now,
            sys,
            node.id,
            Some(tx.id),
            format!("Discarding Tx due to: {reason}"),
        );
    }

    /// Common acceptance check for both transaction events. Returns `true`
    /// when the transaction entered the pool.
    fn try_accept(
        &self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: &Transaction,
        reject_if_known: bool,
    ) -> bool {
        let conflict_free = Self::conflict_free(node, tx);
        let deps = ctx.deps.clone();
        let dependencies_present = deps.satisfied(tx, &node.pool, &node.chain);

        if !(conflict_free && dependencies_present) {
            let reason = match (dependencies_present, conflict_free) {
                (false, true) => "dependencies not satisfied",
                (true, false) => "conflicts present",
                _ => "dependencies not satisfied, conflicts present",
            };
            Self::discard_transaction(node, ctx, tx, reason);
            return false;
        }

        if reject_if_known {
            let in_pool = node.pool.contains(tx.id);
            let in_structure = node.chain.contains_tx(tx.id);
            if in_pool || in_structure {
                let place = if in_pool { "pool" } else { "structure" };
                Self::discard_transaction(
                    node,
                    ctx,
                    tx,
                    &format!("tx contained in {place}"),
                );
                return false;
            }
        }

        node.receive_transaction(tx.clone(), ctx);
        true
    }

    /// Integrates a newly received block: attach it, drop its transactions
    /// from the pool, rebuild the mining pool, and reconsider mining.
    ///
    /// The structure itself rejects duplicates and blocks conflicting with
    /// held transactions; a rejected block is logged and discarded here.
    pub(crate) fn handle_new_block_reception(
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        block: Block,
    ) {
        let received = block.clone();
        match node.chain.add(block) {
            Ok(_) => {
                node.pool.remove_group(&received.txns);
                node.reconstruct_mining_pool(ctx);
                node.consider_mining(ctx);
            }
            Err(err) => {
                let (sim_id, now, sys) =
                    (ctx.sim_id, ctx.now(), ctx.sys_time());
                ctx.reporter.error(
                    sim_id,
                    now,
                    format!(
                        "node {} discarding propagated block: {err}",
                        node.id
                    ),
                );
                ctx.reporter.block_event(
                    sim_id,
                    now,
                    sys,
                    node.id,
                    &received,
                    "ERROR: Propagated Block Discarded",
                );
            }
        }
    }

    /// Cleanup after a successful validation: abandon the finished draw,
    /// drop the mined transactions, rebuild the mining pool, and decide
    /// whether to keep mining.
    pub(crate) fn post_validation(node: &mut NodeCore, ctx: &mut SimCtx) {
        node.stop_mining();
        let mined = node.mining_pool.clone();
        node.pool.remove_group(&mined);
        node.reconstruct_mining_pool(ctx);
        node.consider_mining(ctx);
    }
}

impl Behavior for Honest {
    fn name(&self) -> &'static str {
        "Honest"
    }

    fn on_client_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    ) {
        if self.try_accept(node, ctx, &tx, false) {
            node.broadcast_transaction(&tx, ctx);
        }
    }

    fn on_propagated_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    ) {
        // Same checks as the client path, plus rejection of transactions the
        // node already knows. No re-broadcast.
        self.try_accept(node, ctx, &tx, true);
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

        // Overlap and conflict rejection live in the structure; a failed
        // add is logged and the block discarded.
        Self::handle_new_block_reception(node, ctx, block);
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

        if !node.chain.contains(block.id) {
            // The structure attaches the block to the current longest tip.
            block.parent_id = None;
            match node.chain.add(block.clone()) {
                Ok(_) => {
                    let published = &node.chain[block.id].block;
                    let clone = published.clone();
                    node.broadcast_container(&clone, ctx);
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
                    "node {} mined block {} that overlaps its structure; \
                     the mining pool should have excluded it",
                    node.id, block.id
                ),
            );
            ctx.reporter.block_event(
                sim_id,
                now,
                sys,
                node.id,
                &block,
                "Discarding own Block (ERROR)",
            );
        }

        Self::post_validation(node, ctx);
    }
}
