/*!
Append-only simulation logs and their CSV output

Five logs are kept per simulation: block events, final chain structure,
attack events, general events, and errors. Rows are plain structs with
`Display` implementations producing one CSV line each; nothing is written
to disk until [`Reporter::flush_all`] runs at shutdown.
*/

use std::{
    fmt::Display,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{
    block::{Block, BlockId},
    blockchain::Blockchain,
    node::NodeId,
    scheduler::SimTime,
    transaction::TxId,
};

/// Which logs are recorded. Disabled logs drop rows on arrival.
#[derive(Debug, Clone, Copy)]
pub struct ReportFlags {
    pub block_events: bool,
    pub structure_events: bool,
    pub attack_events: bool,
    pub events: bool,
    pub errors: bool,
}

impl Default for ReportFlags {
    fn default() -> Self {
        ReportFlags {
            block_events: true,
            structure_events: true,
            attack_events: true,
            events: true,
            errors: true,
        }
    }
}

/// One row of the block-event log.
#[derive(Debug, Clone)]
pub struct BlockLogRow {
    pub sim_id: u32,
    pub sim_time: SimTime,
    pub sys_time: u64,
    pub node: NodeId,
    pub block: BlockId,
    pub parent: Option<BlockId>,
    pub height: u64,
    pub content: String,
    pub event_type: String,
    pub difficulty: f64,
    pub cycles: f64,
}

impl Display for BlockLogRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.sim_id,
            self.sim_time,
            self.sys_time,
            self.node,
            self.block,
            self.parent.map_or(-1, |p| p.0 as i64),
            self.height,
            self.content,
            self.event_type,
            self.difficulty,
            self.cycles,
        )
    }
}

/// One row of the final structure dump: a block's resting place in a node's
/// local view.
#[derive(Debug, Clone)]
pub struct StructureLogRow {
    pub sim_id: u32,
    pub sim_time: SimTime,
    pub sys_time: u64,
    pub node: NodeId,
    pub block: BlockId,
    pub parent: Option<BlockId>,
    pub height: u64,
    pub content: String,
    pub place: Place,
}

/// Where a block sits in the structure at close-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Blockchain,
    Orphans,
}

impl Display for Place {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Place::Blockchain => write!(f, "blockchain"),
            Place::Orphans => write!(f, "orphans"),
        }
    }
}

impl Display for StructureLogRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{}",
            self.sim_id,
            self.sim_time,
            self.sys_time,
            self.node,
            self.block,
            self.parent.map_or(-1, |p| p.0 as i64),
            self.height,
            self.content,
            self.place,
        )
    }
}

/// One row of the attack log.
#[derive(Debug, Clone)]
pub struct AttackLogRow {
    pub sim_id: u32,
    pub sim_time: SimTime,
    pub sys_time: u64,
    pub node: NodeId,
    pub event_type: String,
    pub tx: TxId,
    pub block: BlockId,
    pub block_height: u64,
    pub hidden_chain_length: usize,
    pub public_chain_length: u64,
    pub description: String,
}

impl Display for AttackLogRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{},{},{},{},{},{}",
            self.sim_id,
            self.sim_time,
            self.sys_time,
            self.node,
            self.event_type,
            self.tx,
            self.block,
            self.block_height,
            self.hidden_chain_length,
            self.public_chain_length,
            self.description,
        )
    }
}

/// One row of the general event log.
#[derive(Debug, Clone)]
pub struct EventLogRow {
    pub sim_id: u32,
    pub sim_time: SimTime,
    pub sys_time: u64,
    pub node: NodeId,
    pub tx: Option<TxId>,
    pub description: String,
}

impl Display for EventLogRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{},{},{}",
            self.sim_id,
            self.sim_time,
            self.sys_time,
            self.node,
            self.tx.map_or(-1, |t| t.0 as i64),
            self.description,
        )
    }
}

/// One row of the error log.
#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub sim_id: u32,
    pub sim_time: SimTime,
    pub description: String,
}

impl Display for ErrorLogRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{},{},{}", self.sim_id, self.sim_time, self.description)
    }
}

const BLOCK_LOG_HEADER: &str =
    "SimID,SimTime,SysTime,NodeID,BlockID,ParentID,Height,BlockContent,EventType,Difficulty,Cycles";
const STRUCTURE_LOG_HEADER: &str =
    "SimID,SimTime,SysTime,NodeID,BlockID,ParentBlockID,Height,Content,Place";
const ATTACK_LOG_HEADER: &str =
    "SimID,SimTime,SysTime,NodeID,EventType,TxID,BlockID,BlockHeight,HiddenChainLength,PublicChainLength,Description";
const EVENT_LOG_HEADER: &str = "SimID,SimTime,SysTime,NodeID,TxID,Description";
const ERROR_LOG_HEADER: &str = "SimID,SimTime,Description";

/// The append-only logs of one simulation (or, after merging, of a whole
/// group of runs).
#[derive(Debug, Default)]
pub struct Reporter {
    flags: ReportFlags,
    block_log: Vec<BlockLogRow>,
    structure_log: Vec<StructureLogRow>,
    attack_log: Vec<AttackLogRow>,
    event_log: Vec<EventLogRow>,
    error_log: Vec<ErrorLogRow>,
}

impl Reporter {
    pub fn new(flags: ReportFlags) -> Self {
        Reporter {
            flags,
            ..Default::default()
        }
    }

    /// Records a block event, filling the block-derived columns from the
    /// block itself.
    pub fn block_event(
        &mut self,
        sim_id: u32,
        sim_time: SimTime,
        sys_time: u64,
        node: NodeId,
        block: &Block,
        event_type: &str,
    ) {
        if !self.flags.block_events {
            return;
        }
        self.block_log.push(BlockLogRow {
            sim_id,
            sim_time,
            sys_time,
            node,
            block: block.id,
            parent: block.parent_id,
            height: block.height,
            content: block.txns.ids_string(";"),
            event_type: event_type.to_string(),
            difficulty: block.difficulty,
            cycles: block.cycles,
        });
    }

    pub fn attack_event(&mut self, row: AttackLogRow) {
        if self.flags.attack_events {
            self.attack_log.push(row);
        }
    }

    pub fn add_event(
        &mut self,
        sim_id: u32,
        sim_time: SimTime,
        sys_time: u64,
        node: NodeId,
        tx: Option<TxId>,
        description: String,
    ) {
        if self.flags.events {
            self.event_log.push(EventLogRow {
                sim_id,
                sim_time,
                sys_time,
                node,
                tx,
                description,
            });
        }
    }

    pub fn error(&mut self, sim_id: u32, sim_time: SimTime, description: String) {
        if self.flags.errors {
            self.error_log.push(ErrorLogRow {
                sim_id,
                sim_time,
                description,
            });
        }
    }

    /// Dumps a node's entire structure (chain blocks in height order, then
    /// orphans) into the structure log. Called once per node at close-out.
    pub fn report_chain_state(
        &mut self,
        sim_id: u32,
        sim_time: SimTime,
        sys_time: u64,
        node: NodeId,
        chain: &Blockchain,
    ) {
        if !self.flags.structure_events {
            return;
        }

        for data in chain.attached_blocks() {
            self.structure_log.push(StructureLogRow {
                sim_id,
                sim_time,
                sys_time,
                node,
                block: data.block.id,
                parent: data.block.parent_id,
                height: data.height,
                content: data.block.txns.ids_string(";"),
                place: Place::Blockchain,
            });
        }
        for orphan in chain.orphans() {
            self.structure_log.push(StructureLogRow {
                sim_id,
                sim_time,
                sys_time,
                node,
                block: orphan.id,
                parent: orphan.parent_id,
                height: orphan.height,
                content: orphan.txns.ids_string(";"),
                place: Place::Orphans,
            });
        }
    }

    pub fn block_log(&self) -> &[BlockLogRow] {
        &self.block_log
    }

    pub fn structure_log(&self) -> &[StructureLogRow] {
        &self.structure_log
    }

    pub fn attack_log(&self) -> &[AttackLogRow] {
        &self.attack_log
    }

    pub fn event_log(&self) -> &[EventLogRow] {
        &self.event_log
    }

    pub fn error_log(&self) -> &[ErrorLogRow] {
        &self.error_log
    }

    /// Appends another reporter's rows onto this one. Used to merge the logs
    /// of a group of runs into one set of files, in simulation order.
    pub fn absorb(&mut self, other: Reporter) {
        self.block_log.extend(other.block_log);
        self.structure_log.extend(other.structure_log);
        self.attack_log.extend(other.attack_log);
        self.event_log.extend(other.event_log);
        self.error_log.extend(other.error_log);
    }

    /// Writes every enabled log to `dir` as
    /// `<LogName> - <run_id>.csv`, returning the paths written.
    pub fn flush_all(&self, dir: &Path, run_id: &str) -> io::Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();

        if self.flags.block_events {
            written.push(write_log(
                dir,
                "BlockLog",
                run_id,
                BLOCK_LOG_HEADER,
                &self.block_log,
            )?);
        }
        if self.flags.structure_events {
            written.push(write_log(
                dir,
                "StructureLog",
                run_id,
                STRUCTURE_LOG_HEADER,
                &self.structure_log,
            )?);
        }
        if self.flags.attack_events {
            written.push(write_log(
                dir,
                "AttackLog",
                run_id,
                ATTACK_LOG_HEADER,
                &self.attack_log,
            )?);
        }
        if self.flags.events {
            written.push(write_log(
                dir,
                "EventLog",
                run_id,
                EVENT_LOG_HEADER,
                &self.event_log,
            )?);
        }
        if self.flags.errors {
            written.push(write_log(
                dir,
                "ErrorLog",
                run_id,
                ERROR_LOG_HEADER,
                &self.error_log,
            )?);
        }

        Ok(written)
    }
}

fn write_log<R: Display>(
    dir: &Path,
    name: &str,
    run_id: &str,
    header: &str,
    rows: &[R],
) -> io::Result<PathBuf> {
    let path = dir.join(format!("{name} - {run_id}.csv"));
    let mut file = fs::File::create(&path)?;
    writeln!(file, "{header}")?;
    for row in rows {
        writeln!(file, "{row}")?;
    }
    Ok(path)
}
