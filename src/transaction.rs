//! Definitions for transactions and transaction groups

/// Unique identifier of a [`Transaction`].
#[repr(transparent)]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxId(pub u64);

impl From<u64> for TxId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

/// A transaction submitted to the network by a client.
///
/// Transactions are immutable once created and compare equal by [`TxId`].
/// `conflicts_with` names another transaction that cannot coexist with this
/// one in any chain (the simulated double-spend pair).
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TxId,
    /// Size in bytes.
    pub size: u64,
    /// Fee value offered to the miner.
    pub fee: u64,
    pub conflicts_with: Option<TxId>,
}

impl Transaction {
    pub fn new(id: TxId, size: u64, fee: u64) -> Self {
        Transaction {
            id,
            size,
            fee,
            conflicts_with: None,
        }
    }

    pub fn with_conflict(id: TxId, size: u64, fee: u64, peer: TxId) -> Self {
        Transaction {
            id,
            size,
            fee,
            conflicts_with: Some(peer),
        }
    }

    /// Fee offered per byte, the ordering criterion for mining-pool selection.
    #[inline]
    pub fn fee_per_byte(&self) -> f64 {
        self.fee as f64 / self.size.max(1) as f64
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

/// An ordered multiset of transactions.
///
/// Used both for node transaction pools and for the contents of a block.
/// Insertion order is preserved; containment is by [`TxId`].
#[derive(Debug, Default, Clone)]
pub struct TransactionGroup {
    txns: Vec<Transaction>,
}

impl TransactionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.txns.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: TxId) -> bool {
        self.txns.iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: TxId) -> Option<&Transaction> {
        self.txns.iter().find(|t| t.id == id)
    }

    pub fn push(&mut self, tx: Transaction) {
        self.txns.push(tx);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.txns.iter()
    }

    /// Sum of all fee values in the group.
    pub fn total_fee(&self) -> u64 {
        self.txns.iter().map(|t| t.fee).sum()
    }

    /// Sum of all transaction sizes in the group, in bytes.
    pub fn total_size(&self) -> u64 {
        self.txns.iter().map(|t| t.size).sum()
    }

    /// Removes the transaction with the given ID, if present.
    pub fn remove(&mut self, id: TxId) -> Option<Transaction> {
        let pos = self.txns.iter().position(|t| t.id == id)?;
        Some(self.txns.remove(pos))
    }

    /// Removes every transaction that appears in `other`.
    pub fn remove_group(&mut self, other: &TransactionGroup) {
        self.txns.retain(|t| !other.contains(t.id));
    }

    /// Selects the most profitable subset of this group that fits within
    /// `max_size` bytes: transactions are ranked by fee per byte descending
    /// (ties broken by smaller ID for determinism) and taken greedily while
    /// they still fit.
    pub fn top_by_fee_per_size(&self, max_size: u64) -> TransactionGroup {
        let mut ranked: Vec<&Transaction> = self.txns.iter().collect();
        ranked.sort_by(|a, b| {
            b.fee_per_byte()
                .partial_cmp(&a.fee_per_byte())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });

        let mut selected = TransactionGroup::new();
        let mut used = 0u64;
        for tx in ranked {
            if used + tx.size <= max_size {
                used += tx.size;
                selected.push(tx.clone());
            }
        }

        selected
    }

    /// Transaction IDs joined by `sep`, in insertion order. Used by the
    /// reporters for the block-content columns.
    pub fn ids_string(&self, sep: &str) -> String {
        let ids: Vec<_> = self.txns.iter().map(|t| t.id.to_string()).collect();
        ids.join(sep)
    }
}

impl FromIterator<Transaction> for TransactionGroup {
    fn from_iter<I: IntoIterator<Item = Transaction>>(iter: I) -> Self {
        TransactionGroup {
            txns: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Transaction, TransactionGroup, TxId};

    fn tx(id: u64, size: u64, fee: u64) -> Transaction {
        Transaction::new(TxId(id), size, fee)
    }

    #[test]
    fn totals() {
        let group: TransactionGroup =
            [tx(1, 100, 10), tx(2, 200, 30)].into_iter().collect();

        assert_eq!(group.total_fee(), 40);
        assert_eq!(group.total_size(), 300);
    }

    #[test]
    fn top_selection_ranks_by_fee_per_byte() {
        // tx 2 pays 0.3/byte, tx 1 pays 0.1/byte, tx 3 pays 0.05/byte
        let group: TransactionGroup =
            [tx(1, 100, 10), tx(2, 100, 30), tx(3, 100, 5)]
                .into_iter()
                .collect();

        let top = group.top_by_fee_per_size(200);
        let ids: Vec<_> = top.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TxId(2), TxId(1)]);
    }

    #[test]
    fn top_selection_skips_oversized_entries() {
        let group: TransactionGroup =
            [tx(1, 500, 100), tx(2, 100, 10)].into_iter().collect();

        // tx 1 has the better ratio but does not fit; tx 2 still does.
        let top = group.top_by_fee_per_size(200);
        let ids: Vec<_> = top.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TxId(2)]);
    }

    #[test]
    fn top_selection_tie_breaks_by_id() {
        let group: TransactionGroup =
            [tx(9, 100, 10), tx(4, 100, 10)].into_iter().collect();

        let top = group.top_by_fee_per_size(100);
        let ids: Vec<_> = top.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TxId(4)]);
    }

    #[test]
    fn remove_group_drops_shared_ids() {
        let mut pool: TransactionGroup =
            [tx(1, 10, 1), tx(2, 10, 1), tx(3, 10, 1)].into_iter().collect();
        let mined: TransactionGroup =
            [tx(1, 10, 1), tx(3, 10, 1)].into_iter().collect();

        pool.remove_group(&mined);
        let ids: Vec<_> = pool.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![TxId(2)]);
    }
}
