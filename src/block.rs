//! Definitions for blocks

use crate::{
    node::NodeId,
    scheduler::SimTime,
    transaction::{TransactionGroup, TxId},
};

/// Unique identifier of a [`Block`].
///
/// # Invariants
///
/// [`BlockId`] `0` is reserved for the genesis block seeded into every
/// [`Blockchain`](crate::blockchain::Blockchain); per-simulation allocation
/// of new IDs starts at 1.
#[repr(transparent)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub usize);

impl BlockId {
    pub const GENESIS: BlockId = BlockId(0);
}

impl From<usize> for BlockId {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A block of transactions, mined or received by a node.
///
/// A block is only mutated in the window between creation and insertion into
/// a [`Blockchain`](crate::blockchain::Blockchain): the mining path stamps
/// validation metadata and the structure assigns parent and height. Once
/// inserted it is treated as immutable; propagation works on clones so each
/// recipient can record its own `current_node`.
#[derive(Debug, Default, Clone)]
pub struct Block {
    pub id: BlockId,
    pub parent_id: Option<BlockId>,
    /// Height in the chain. Assigned by the structure on insertion; orphans
    /// keep the height their author declared.
    pub height: u64,
    pub txns: TransactionGroup,
    /// Node that mined this block, once validated.
    pub validator: Option<NodeId>,
    /// Node currently holding this copy of the block.
    pub current_node: Option<NodeId>,
    /// Simulation time at which PoW validation completed.
    pub validated_at: SimTime,
    /// Difficulty (expected hashes) under which validation took place.
    /// Negative until stamped, matching the reporter's sentinel convention.
    pub difficulty: f64,
    /// Hashing cycles spent on the validation draw. Negative until stamped.
    pub cycles: f64,
    /// Last event applied to this copy of the block, for reporting.
    pub last_event: String,
}

impl Block {
    /// Creates the genesis sentinel held by every new chain.
    pub fn genesis() -> Self {
        Block {
            id: BlockId::GENESIS,
            difficulty: -1.0,
            cycles: -1.0,
            ..Default::default()
        }
    }

    /// Creates a mining candidate from a snapshot of the mining pool. The
    /// parent is left unset; the structure attaches the block to the longest
    /// tip when it is finally inserted.
    pub fn candidate(id: BlockId, txns: TransactionGroup) -> Self {
        Block {
            id,
            txns,
            difficulty: -1.0,
            cycles: -1.0,
            ..Default::default()
        }
    }

    #[inline]
    pub fn contains(&self, tx: TxId) -> bool {
        self.txns.contains(tx)
    }

    /// Records the outcome of a successful PoW draw. The block's contents
    /// are replaced with the node's mining pool as it stands at validation
    /// time, which may differ from the snapshot taken when mining started.
    pub fn stamp_validation(
        &mut self,
        txns: TransactionGroup,
        sim_time: SimTime,
        node: NodeId,
        difficulty: f64,
        cycles: f64,
    ) {
        self.txns = txns;
        self.validated_at = sim_time;
        self.validator = Some(node);
        self.current_node = Some(node);
        self.difficulty = difficulty;
        self.cycles = cycles;
    }
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Block {}

#[cfg(test)]
mod tests {
    use super::{Block, BlockId};
    use crate::{
        node::NodeId,
        transaction::{Transaction, TransactionGroup, TxId},
    };

    #[test]
    fn stamp_replaces_contents() {
        let snapshot: TransactionGroup =
            [Transaction::new(TxId(1), 10, 5)].into_iter().collect();
        let current: TransactionGroup =
            [Transaction::new(TxId(2), 10, 5)].into_iter().collect();

        let mut block = Block::candidate(BlockId(7), snapshot);
        block.stamp_validation(current, 1_000, NodeId(3), 1e12, 2.5e10);

        assert!(!block.contains(TxId(1)));
        assert!(block.contains(TxId(2)));
        assert_eq!(block.validator, Some(NodeId(3)));
        assert_eq!(block.validated_at, 1_000);
    }
}
