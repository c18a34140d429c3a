//! The discrete-event scheduling substrate that drives all nodes

use std::{
    cell::Cell,
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    rc::Rc,
};

use crate::{
    behavior::BehaviorSwitch,
    block::Block,
    node::NodeId,
    transaction::Transaction,
};

/// Simulation time, in simulation time units (milliseconds by convention).
pub type SimTime = u64;

/// Cancellation handle for a scheduled [`Event`].
///
/// The scheduler never removes entries from its queue; cancelling an event
/// sets this flag and the scheduler discards the entry silently when it
/// reaches the front. This keeps cancellation independent of queue position
/// and preserves deterministic ordering.
#[derive(Debug, Clone, Default)]
pub struct EventHandle(Rc<Cell<bool>>);

impl EventHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the event so the scheduler drops it instead of dispatching.
    #[inline]
    pub fn ignore(&self) {
        self.0.set(true);
    }

    #[inline]
    pub fn is_ignored(&self) -> bool {
        self.0.get()
    }
}

/// What happens when an event fires.
#[derive(Debug, Clone)]
pub enum EventKind {
    /// A client hands a new transaction to a node.
    TransactionArrival { node: NodeId, tx: Transaction },
    /// A transaction propagated from a peer reaches a node.
    TransactionPropagation { node: NodeId, tx: Transaction },
    /// A block propagated from a peer reaches a node.
    ContainerPropagation { node: NodeId, block: Block },
    /// A node's PoW draw completes on the carried candidate block.
    ValidationComplete { node: NodeId, block: Block },
    /// A node's hash rate changes to the given value.
    HashPowerChange { node: NodeId, new_power: f64 },
    /// A node's behavior strategy is replaced.
    BehaviorChange { node: NodeId, switch: BehaviorSwitch },
}

/// A scheduled simulation event.
#[derive(Debug, Clone)]
pub struct Event {
    pub fire_time: SimTime,
    pub kind: EventKind,
    seq: u64,
    handle: EventHandle,
}

// Queue ordering considers only (fire_time, seq): same-time events fire in
// insertion order, which several reconfiguration tests depend on.
struct QueuedEvent(Event);

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.0.fire_time == other.0.fire_time && self.0.seq == other.0.seq
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.0.fire_time, self.0.seq).cmp(&(other.0.fire_time, other.0.seq))
    }
}

/// Ordered queue of pending events and the single logical clock.
///
/// Single-threaded and cooperative: handlers run to completion, may schedule
/// further events at or after the current time, and return. Given the same
/// seed and the same schedule, dispatch order is fully deterministic.
#[derive(Default)]
pub struct Scheduler {
    queue: BinaryHeap<Reverse<QueuedEvent>>,
    now: SimTime,
    next_seq: u64,
    dispatched: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulation time. Advances monotonically as events fire.
    #[inline]
    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of events dispatched so far (ignored events excluded).
    #[inline]
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Schedules an event and returns its cancellation handle.
    pub fn schedule(&mut self, fire_time: SimTime, kind: EventKind) -> EventHandle {
        debug_assert!(
            fire_time >= self.now,
            "event scheduled at {fire_time}, before current time {}",
            self.now
        );

        let handle = EventHandle::new();
        let event = Event {
            fire_time: fire_time.max(self.now),
            kind,
            seq: self.next_seq,
            handle: handle.clone(),
        };
        self.next_seq += 1;
        self.queue.push(Reverse(QueuedEvent(event)));

        handle
    }

    /// Removes and returns the next live event with `fire_time <= limit`,
    /// advancing the clock to its fire time. Ignored events are discarded
    /// silently. Returns `None` once the next live event lies beyond `limit`
    /// or the queue is exhausted.
    pub fn pop_until(&mut self, limit: SimTime) -> Option<Event> {
        loop {
            let next = self.queue.peek()?;
            if next.0 .0.handle.is_ignored() {
                self.queue.pop();
                continue;
            }
            if next.0 .0.fire_time > limit {
                return None;
            }

            let Reverse(QueuedEvent(event)) = self.queue.pop()?;
            self.now = event.fire_time;
            self.dispatched += 1;
            return Some(event);
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now", &self.now)
            .field("pending", &self.queue.len())
            .field("dispatched", &self.dispatched)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{EventKind, Scheduler};
    use crate::{
        node::NodeId,
        transaction::{Transaction, TxId},
    };

    fn arrival(node: usize, tx: u64) -> EventKind {
        EventKind::TransactionArrival {
            node: NodeId(node),
            tx: Transaction::new(TxId(tx), 100, 10),
        }
    }

    fn tx_of(kind: &EventKind) -> u64 {
        match kind {
            EventKind::TransactionArrival { tx, .. } => tx.id.0,
            _ => panic!("expected arrival"),
        }
    }

    #[test]
    fn events_fire_in_time_order() {
        let mut sched = Scheduler::new();
        sched.schedule(300, arrival(0, 3));
        sched.schedule(100, arrival(0, 1));
        sched.schedule(200, arrival(0, 2));

        let order: Vec<_> = std::iter::from_fn(|| sched.pop_until(u64::MAX))
            .map(|e| tx_of(&e.kind))
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
        assert_eq!(sched.now(), 300);
    }

    #[test]
    fn same_time_events_fire_in_insertion_order() {
        let mut sched = Scheduler::new();
        for tx in 1..=4 {
            sched.schedule(500, arrival(0, tx));
        }

        let order: Vec<_> = std::iter::from_fn(|| sched.pop_until(u64::MAX))
            .map(|e| tx_of(&e.kind))
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn ignored_events_are_discarded_silently() {
        let mut sched = Scheduler::new();
        sched.schedule(100, arrival(0, 1));
        let handle = sched.schedule(200, arrival(0, 2));
        sched.schedule(300, arrival(0, 3));
        handle.ignore();

        let order: Vec<_> = std::iter::from_fn(|| sched.pop_until(u64::MAX))
            .map(|e| tx_of(&e.kind))
            .collect();
        assert_eq!(order, vec![1, 3]);
        assert_eq!(sched.dispatched(), 2);
    }

    #[test]
    fn pop_until_respects_the_limit() {
        let mut sched = Scheduler::new();
        sched.schedule(100, arrival(0, 1));
        sched.schedule(900, arrival(0, 2));

        assert_eq!(sched.pop_until(500).map(|e| tx_of(&e.kind)), Some(1));
        assert!(sched.pop_until(500).is_none());
        // The late event is still there for a wider limit.
        assert_eq!(sched.pop_until(1_000).map(|e| tx_of(&e.kind)), Some(2));
    }
}
