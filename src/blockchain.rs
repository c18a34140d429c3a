use std::{
    collections::{HashMap, HashSet},
    ops::Index,
};

use crate::{
    block::{Block, BlockId},
    transaction::TxId,
};

/// A node's local view of the block tree, rooted at an implicit genesis
/// block. Blocks whose parent is not yet known are held aside as orphans and
/// adopted once the parent arrives.
#[derive(Debug, Clone)]
pub struct Blockchain {
    genesis_id: BlockId,
    blocks: HashMap<BlockId, BlockData>,
    /// Block IDs indexed by height. Row 0 holds only the genesis block.
    blocks_by_height: Vec<Vec<BlockId>>,
    orphans: Vec<Block>,
    /// Every transaction ID appearing in any held block, orphans included.
    tx_index: HashSet<TxId>,
}

/// A block and its associated metadata as stored in a [`Blockchain`].
#[derive(Debug, Clone)]
pub struct BlockData {
    pub block: Block,
    pub height: u64,
    /// All blocks which directly point to `block`.
    pub children: Vec<BlockId>,
}

/// Where a block ended up after [`Blockchain::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// Attached under its parent at the given height. `adopted` lists any
    /// orphans that became attachable as a result, in adoption order.
    Attached { height: u64, adopted: Vec<BlockId> },
    /// Parent unknown; held as an orphan at its author-declared height.
    Orphaned,
}

#[derive(Debug, thiserror::Error)]
pub enum StructureError {
    #[error("block {0} already exists in this structure")]
    DuplicateBlock(BlockId),
    #[error("block {block} conflicts with transaction {tx} already in the structure")]
    ConflictingBlock { block: BlockId, tx: TxId },
}

impl Blockchain {
    /// Creates a new structure containing only the genesis block at height 0.
    pub fn new() -> Self {
        let genesis = Block::genesis();
        let genesis_id = genesis.id;
        let blocks = HashMap::from([(
            genesis_id,
            BlockData {
                block: genesis,
                height: 0,
                children: vec![],
            },
        )]);

        Blockchain {
            genesis_id,
            blocks,
            blocks_by_height: vec![vec![genesis_id]],
            orphans: Vec::new(),
            tx_index: HashSet::new(),
        }
    }

    /// Returns true iff a block with the given ID is attached to the tree.
    /// Orphans count as contained; they hold real transaction data and must
    /// not be re-added.
    #[inline]
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id) || self.orphans.iter().any(|b| b.id == id)
    }

    /// Returns true iff any held block, orphans included, carries the given
    /// transaction.
    #[inline]
    pub fn contains_tx(&self, tx: TxId) -> bool {
        self.tx_index.contains(&tx)
    }

    #[inline]
    pub fn genesis(&self) -> BlockId {
        self.genesis_id
    }

    /// Height of the longest tip. 0 when only the genesis block is present.
    #[inline]
    pub fn height(&self) -> u64 {
        (self.blocks_by_height.len() - 1) as u64
    }

    #[inline]
    pub fn get(&self, id: BlockId) -> Option<&BlockData> {
        self.blocks.get(&id)
    }

    #[inline]
    pub fn get_parent(&self, id: BlockId) -> Option<BlockId> {
        self.blocks.get(&id).and_then(|data| data.block.parent_id)
    }

    /// Number of attached blocks, genesis included.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn orphans(&self) -> &[Block] {
        &self.orphans
    }

    /// All attached blocks ordered by height, ties by block ID. Used for the
    /// close-out structure report.
    pub fn attached_blocks(&self) -> Vec<&BlockData> {
        let mut all: Vec<&BlockData> = self.blocks.values().collect();
        all.sort_by_key(|data| (data.height, data.block.id));
        all
    }

    /// The block of maximum height. Ties are broken by the smallest block
    /// ID, so the result is deterministic. Never an orphan.
    pub fn longest_tip(&self) -> BlockId {
        *self
            .blocks_by_height
            .last()
            .expect("chain always holds the genesis row")
            .iter()
            .min()
            .expect("height rows are never empty")
    }

    /// IDs of all blocks on the path from genesis to the given block, in
    /// ascending height order.
    ///
    /// # Panics
    /// Panics if the block is not attached to the tree.
    pub fn ancestors_of(&self, id: BlockId) -> Vec<BlockId> {
        debug_assert!(
            self.blocks.contains_key(&id),
            "structure does not contain an attached block with ID {id}",
        );

        let mut ancestors = vec![id];
        let mut curr = id;
        while curr != self.genesis_id {
            curr = self.blocks[&curr]
                .block
                .parent_id
                .expect("attached non-genesis blocks always have a parent");
            ancestors.push(curr);
        }

        ancestors.reverse();
        ancestors
    }

    /// IDs of all blocks on the path from genesis to the longest tip.
    #[inline]
    pub fn longest_chain(&self) -> Vec<BlockId> {
        self.ancestors_of(self.longest_tip())
    }

    /// Returns true iff the given transaction appears on the path from
    /// genesis to the longest tip. Stricter than [`Blockchain::contains_tx`],
    /// which also reports side branches and orphans.
    pub fn longest_chain_contains_tx(&self, tx: TxId) -> bool {
        self.longest_chain()
            .iter()
            .any(|id| self.blocks[id].block.contains(tx))
    }

    /// Finds the attached block carrying the given transaction, searching
    /// from the longest tip back to genesis.
    pub fn find_block_with_tx(&self, tx: TxId) -> Option<BlockId> {
        self.longest_chain()
            .into_iter()
            .rev()
            .find(|id| self.blocks[id].block.contains(tx))
    }

    /// Adds a block to the structure.
    ///
    /// A block with no parent reference is attached to the current longest
    /// tip (the mining path leaves the parent unset for exactly this
    /// reason). A block whose declared parent is unknown is held as an
    /// orphan. After a successful attachment, orphans whose parents have
    /// become known are adopted breadth-first.
    ///
    /// Rejected without effect: a block already held, and a block carrying
    /// a transaction whose declared conflict peer is already held anywhere
    /// in the structure, orphans included.
    pub fn add(&mut self, mut block: Block) -> Result<AddOutcome, StructureError> {
        if self.contains(block.id) {
            return Err(StructureError::DuplicateBlock(block.id));
        }

        for tx in block.txns.iter() {
            if let Some(peer) = tx.conflicts_with {
                if self.tx_index.contains(&peer) {
                    return Err(StructureError::ConflictingBlock {
                        block: block.id,
                        tx: tx.id,
                    });
                }
            }
        }

        let parent = match block.parent_id {
            Some(parent) => parent,
            None => {
                let tip = self.longest_tip();
                block.parent_id = Some(tip);
                tip
            }
        };

        for tx in block.txns.iter() {
            self.tx_index.insert(tx.id);
        }

        if !self.blocks.contains_key(&parent) {
            self.orphans.push(block);
            return Ok(AddOutcome::Orphaned);
        }

        let height = self.attach(block, parent);
        let adopted = self.adopt_orphans();
        Ok(AddOutcome::Attached { height, adopted })
    }

    fn attach(&mut self, mut block: Block, parent: BlockId) -> u64 {
        let parent_data = self
            .blocks
            .get_mut(&parent)
            .expect("attach is only called with a known parent");
        parent_data.children.push(block.id);

        let height = parent_data.height + 1;
        block.height = height;

        if height as usize == self.blocks_by_height.len() {
            self.blocks_by_height.push(vec![block.id]);
        } else {
            self.blocks_by_height[height as usize].push(block.id);
        }

        self.blocks.insert(
            block.id,
            BlockData {
                block,
                height,
                children: vec![],
            },
        );

        height
    }

    /// Repeatedly attaches orphans whose parents have become known. Each
    /// adoption may unlock further orphans, so the scan loops until a full
    /// pass makes no progress.
    fn adopt_orphans(&mut self) -> Vec<BlockId> {
        let mut adopted = Vec::new();
        loop {
            let pos = self.orphans.iter().position(|orphan| {
                orphan
                    .parent_id
                    .is_some_and(|p| self.blocks.contains_key(&p))
            });

            match pos {
                Some(pos) => {
                    let orphan = self.orphans.remove(pos);
                    let parent = orphan.parent_id.expect("orphans keep their declared parent");
                    adopted.push(orphan.id);
                    self.attach(orphan, parent);
                }
                None => return adopted,
            }
        }
    }
}

impl Default for Blockchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<BlockId> for Blockchain {
    type Output = BlockData;

    fn index(&self, index: BlockId) -> &Self::Output {
        self.blocks.index(&index)
    }
}

impl Index<&BlockId> for Blockchain {
    type Output = BlockData;

    fn index(&self, index: &BlockId) -> &Self::Output {
        self.blocks.index(index)
    }
}

#[cfg(test)]
mod tests {
    use super::{AddOutcome, Blockchain, StructureError};
    use crate::{
        block::{Block, BlockId},
        transaction::{Transaction, TransactionGroup, TxId},
    };

    fn block(id: usize, parent: Option<usize>) -> Block {
        Block {
            id: BlockId(id),
            parent_id: parent.map(BlockId),
            ..Block::candidate(BlockId(id), TransactionGroup::new())
        }
    }

    fn block_with_tx(id: usize, parent: Option<usize>, tx: u64) -> Block {
        let txns: TransactionGroup =
            [Transaction::new(TxId(tx), 100, 10)].into_iter().collect();
        Block {
            id: BlockId(id),
            parent_id: parent.map(BlockId),
            ..Block::candidate(BlockId(id), txns)
        }
    }

    #[test]
    fn new_chain_is_only_genesis() {
        let chain = Blockchain::new();
        assert_eq!(chain.height(), 0);
        assert_eq!(chain.longest_tip(), BlockId::GENESIS);
        assert_eq!(chain.longest_chain(), vec![BlockId::GENESIS]);
    }

    #[test]
    fn heights_follow_parents() {
        let mut chain = Blockchain::new();
        chain.add(block(1, Some(0))).unwrap();
        chain.add(block(2, Some(1))).unwrap();

        assert_eq!(chain[BlockId(1)].height, 1);
        assert_eq!(chain[BlockId(2)].height, 2);
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.longest_tip(), BlockId(2));
    }

    #[test]
    fn missing_parent_reference_extends_longest_tip() {
        let mut chain = Blockchain::new();
        chain.add(block(1, Some(0))).unwrap();
        chain.add(block(2, None)).unwrap();

        assert_eq!(chain.get_parent(BlockId(2)), Some(BlockId(1)));
        assert_eq!(chain[BlockId(2)].height, 2);
    }

    #[test]
    fn longest_tip_tie_breaks_by_smallest_id() {
        let mut chain = Blockchain::new();
        chain.add(block(5, Some(0))).unwrap();
        chain.add(block(2, Some(0))).unwrap();

        // Two competing tips at height 1: the smaller ID wins.
        assert_eq!(chain.longest_tip(), BlockId(2));
    }

    #[test]
    fn unknown_parent_becomes_orphan_and_is_adopted() {
        let mut chain = Blockchain::new();
        let outcome = chain.add(block(2, Some(1))).unwrap();
        assert_eq!(outcome, AddOutcome::Orphaned);
        assert_eq!(chain.orphans().len(), 1);
        assert_eq!(chain.height(), 0);

        // The missing parent arrives; the orphan is adopted behind it.
        let outcome = chain.add(block(1, Some(0))).unwrap();
        match outcome {
            AddOutcome::Attached { height, adopted } => {
                assert_eq!(height, 1);
                assert_eq!(adopted, vec![BlockId(2)]);
            }
            AddOutcome::Orphaned => panic!("parent should attach"),
        }

        assert!(chain.orphans().is_empty());
        assert_eq!(chain.height(), 2);
        assert_eq!(chain.longest_tip(), BlockId(2));
    }

    #[test]
    fn orphan_chains_adopt_transitively() {
        let mut chain = Blockchain::new();
        chain.add(block(3, Some(2))).unwrap();
        chain.add(block(2, Some(1))).unwrap();
        assert_eq!(chain.orphans().len(), 2);

        chain.add(block(1, Some(0))).unwrap();
        assert!(chain.orphans().is_empty());
        assert_eq!(chain.height(), 3);
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut chain = Blockchain::new();
        chain.add(block(1, Some(0))).unwrap();

        let err = chain.add(block(1, Some(0))).unwrap_err();
        assert!(matches!(err, StructureError::DuplicateBlock(id) if id == BlockId(1)));
        assert_eq!(chain.num_blocks(), 2);
    }

    #[test]
    fn conflicting_block_is_rejected_without_effect() {
        let mut chain = Blockchain::new();
        chain.add(block_with_tx(1, Some(0), 10)).unwrap();

        let txns: TransactionGroup =
            [Transaction::with_conflict(TxId(11), 100, 10, TxId(10))]
                .into_iter()
                .collect();
        let conflicting = Block {
            id: BlockId(2),
            parent_id: Some(BlockId(1)),
            ..Block::candidate(BlockId(2), txns)
        };

        let err = chain.add(conflicting).unwrap_err();
        assert!(matches!(
            err,
            StructureError::ConflictingBlock { tx, .. } if tx == TxId(11)
        ));
        assert!(!chain.contains(BlockId(2)));
        assert!(!chain.contains_tx(TxId(11)));
        assert_eq!(chain.height(), 1);
    }

    #[test]
    fn contains_tx_covers_branches_and_orphans() {
        let mut chain = Blockchain::new();
        chain.add(block_with_tx(1, Some(0), 10)).unwrap();
        chain.add(block_with_tx(2, Some(0), 11)).unwrap();
        chain.add(block_with_tx(9, Some(8), 12)).unwrap(); // orphan

        assert!(chain.contains_tx(TxId(10)));
        assert!(chain.contains_tx(TxId(11)));
        assert!(chain.contains_tx(TxId(12)));
        assert!(!chain.contains_tx(TxId(13)));
    }

    #[test]
    fn longest_chain_containment_ignores_side_branches() {
        let mut chain = Blockchain::new();
        chain.add(block_with_tx(1, Some(0), 10)).unwrap();
        chain.add(block_with_tx(2, Some(0), 11)).unwrap();
        chain.add(block(3, Some(2))).unwrap();

        // Tip is 3 via 2; tx 10 sits on the abandoned branch.
        assert!(chain.longest_chain_contains_tx(TxId(11)));
        assert!(!chain.longest_chain_contains_tx(TxId(10)));
    }

    #[test]
    fn height_is_monotone_under_adds() {
        let mut chain = Blockchain::new();
        let mut last = chain.height();
        for (id, parent) in [(1, 0), (4, 1), (2, 0), (3, 2), (5, 4)] {
            chain.add(block(id, Some(parent))).unwrap();
            assert!(chain.height() >= last);
            last = chain.height();
        }
    }
}
