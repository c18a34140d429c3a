/*!
Definitions for node behavior strategies

A behavior decides how a node reacts to the four events it can observe:
a client transaction, a propagated transaction, a propagated block, and
completion of its own PoW validation. [`Honest`] follows the consensus
protocol without deviation; [`Malicious`] withholds a private chain to
reorder a target transaction out of the public one.

The PoW mining decision loop itself is not part of a behavior: it lives on
[`NodeCore`](crate::node::NodeCore) and behaviors call into it.
*/

use std::fmt::Debug;

use crate::{
    block::Block,
    blockchain::Blockchain,
    node::NodeCore,
    simulation::SimCtx,
    transaction::{Transaction, TransactionGroup, TxId},
};

pub mod honest;
pub mod malicious;

pub use honest::Honest;
pub use malicious::{Malicious, MaliciousConfig};

/// Event interface of a node behavior strategy.
pub trait Behavior: Debug {
    /// Name of the strategy, used in reports.
    fn name(&self) -> &'static str;

    /// The node receives a transaction directly from a client.
    fn on_client_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    );

    /// The node receives a transaction propagated by a peer.
    fn on_propagated_transaction(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        tx: Transaction,
    );

    /// The node receives a block propagated by a peer.
    fn on_propagated_container(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        block: Block,
    );

    /// The node's pending PoW draw completes on the given candidate block.
    fn on_validation_complete(
        &mut self,
        node: &mut NodeCore,
        ctx: &mut SimCtx,
        block: Block,
    );

    /// Called once when the simulation terminates, before reports are
    /// collected.
    fn on_simulation_end(&mut self, _node: &mut NodeCore, _ctx: &mut SimCtx) {}
}

/// Which strategy a node runs. Used by configuration and by the
/// behavior-change reconfiguration event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorKind {
    Honest,
    Malicious,
}

/// Payload of a scheduled behavior swap.
///
/// `target_tx` and `required_confirmations` only apply when switching to
/// [`BehaviorKind::Malicious`]; the new behavior initializes its watching
/// state from the node's structure at fire time, so a target that is
/// already buried deeply enough starts the attack in the same event.
#[derive(Debug, Clone)]
pub struct BehaviorSwitch {
    pub kind: BehaviorKind,
    pub target_tx: Option<TxId>,
    pub required_confirmations: Option<u32>,
}

/// Hook for transaction dependency validation.
///
/// The shipped implementation accepts everything, matching the observed
/// behavior of the network being modeled; a custom registry can be supplied
/// through the simulation builder.
pub trait DependencyRegistry: Debug + Send + Sync {
    fn satisfied(
        &self,
        tx: &Transaction,
        pool: &TransactionGroup,
        chain: &Blockchain,
    ) -> bool;
}

/// The default [`DependencyRegistry`]: every transaction's dependencies are
/// considered present.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSatisfied;

impl DependencyRegistry for AlwaysSatisfied {
    fn satisfied(
        &self,
        _tx: &Transaction,
        _pool: &TransactionGroup,
        _chain: &Blockchain,
    ) -> bool {
        true
    }
}
