/*!
Re-export of common values and datatypes used for building and analyzing
simulations. Must be imported manually.

```
use attack_sim::prelude::*;
```
*/

pub use crate::analysis::{
    attack_success_probability, required_confirmations, AttackMetrics,
    AttackOutcome, AttackResolution,
};

pub use crate::behavior::{
    Behavior, BehaviorKind, BehaviorSwitch, Honest, Malicious, MaliciousConfig,
};

pub use crate::block::{Block, BlockId};

pub use crate::blockchain::{AddOutcome, Blockchain, StructureError};

pub use crate::config::{Config, ConfigError, HashPowerChange};

pub use crate::node::{Node, NodeCore, NodeId};

pub use crate::report::{ReportFlags, Reporter};

pub use crate::scheduler::{EventHandle, EventKind, Scheduler, SimTime};

pub use crate::simulation::{
    Simulation, SimulationBuildError, SimulationBuilder, SimulationGroup,
    SimulationOutput,
};

pub use crate::transaction::{Transaction, TransactionGroup, TxId};

pub use crate::workload::WorkloadConfig;
