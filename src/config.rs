/*!
Typed configuration loaded from a `key = value` properties file

The recognized keys are fixed; anything else in the file is ignored so that
driver-specific annotations can ride along. Parsing failures name the key
and the offending value. The `node.hashPowerChanges` entry has its own
mini-grammar, `{nodeID:hashPower:time, ...}`, parsed by
[`parse_hash_power_changes`].
*/

use std::{collections::HashMap, fs, path::Path};

use crate::{
    node::NodeId,
    report::ReportFlags,
    scheduler::SimTime,
    transaction::TxId,
    workload::WorkloadConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing required configuration key {0:?}")]
    MissingKey(&'static str),
    #[error("invalid value {value:?} for configuration key {key:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("node.hashPowerChanges: missing opening bracket in {0:?}")]
    MissingOpeningBracket(String),
    #[error("node.hashPowerChanges: missing closing bracket in {0:?}")]
    MissingClosingBracket(String),
    #[error(
        "node.hashPowerChanges: each entry must have format \
         'nodeID:hashPower:time', got {0:?}"
    )]
    MalformedEntry(String),
    #[error("node.hashPowerChanges: invalid number {value:?} in entry {entry:?}")]
    InvalidNumber { entry: String, value: String },
    #[error("node.hashPowerChanges: hashpower cannot be negative, got {0}")]
    NegativeHashPower(f64),
    #[error("node.hashPowerChanges: time cannot be negative, got {0}")]
    NegativeTime(i64),
}

/// One scheduled hash-rate mutation from the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashPowerChange {
    pub node: NodeId,
    pub hash_power: f64,
    pub time: SimTime,
}

/// Everything the simulator reads from a configuration file.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_simulations: u32,
    pub sim_from: Option<u32>,
    pub sim_to: Option<u32>,
    pub terminate_at: SimTime,

    pub num_honest_nodes: usize,
    pub num_malicious_nodes: usize,
    pub throughput_mean: f64,
    pub throughput_sd: f64,
    pub propagation_time: SimTime,

    pub workload: WorkloadConfig,
    pub target_transaction: Option<TxId>,

    pub pow_difficulty: f64,
    pub hash_power_mean: f64,
    pub hash_power_sd: f64,

    pub max_block_size: u64,
    pub min_size_to_mine: u64,
    pub min_value_to_mine: u64,

    pub required_confirmations: u32,
    pub min_chain_length: u64,
    pub max_chain_length: u64,

    pub hash_power_changes: Vec<HashPowerChange>,
    pub flags: ReportFlags,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    /// Parses properties text. Lines are `key = value`; `#` and `!` start
    /// comments; blank lines are skipped.
    pub fn from_str(text: &str) -> Result<Config, ConfigError> {
        let mut map: HashMap<&str, &str> = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key.trim(), value.trim());
            }
        }

        let workload = WorkloadConfig {
            lambda: require(&map, "workload.lambda")?,
            num_transactions: require(&map, "workload.numTransactions")?,
            tx_size_mean: optional(&map, "workload.txSizeMean")?.unwrap_or(250.0),
            tx_size_sd: optional(&map, "workload.txSizeSD")?.unwrap_or(0.0),
            tx_fee_mean: optional(&map, "workload.txFeeValueMean")?
                .unwrap_or(100.0),
            tx_fee_sd: optional(&map, "workload.txFeeValueSD")?.unwrap_or(0.0),
            has_conflicts: optional(&map, "workload.hasConflicts")?
                .unwrap_or(false),
            conflict_dispersion: optional(&map, "workload.conflicts.dispersion")?
                .unwrap_or(10),
            conflict_likelihood: optional(&map, "workload.conflicts.likelihood")?
                .unwrap_or(0.0),
        };

        let flags = ReportFlags {
            events: optional(&map, "reporter.reportEvents")?.unwrap_or(true),
            block_events: optional(&map, "reporter.reportBlockEvents")?
                .unwrap_or(true),
            structure_events: optional(&map, "reporter.reportStructureEvents")?
                .unwrap_or(true),
            attack_events: optional(&map, "reporter.reportAttackEvents")?
                .unwrap_or(true),
            errors: optional(&map, "reporter.reportErrors")?.unwrap_or(true),
        };

        let hash_power_changes = match map.get("node.hashPowerChanges") {
            Some(raw) => parse_hash_power_changes(raw)?,
            None => Vec::new(),
        };

        Ok(Config {
            num_simulations: optional(&map, "sim.numSimulations")?.unwrap_or(1),
            sim_from: optional(&map, "sim.numSimulations.From")?,
            sim_to: optional(&map, "sim.numSimulations.To")?,
            terminate_at: require(&map, "sim.terminate.atTime")?,
            num_honest_nodes: require(&map, "net.numOfHonestNodes")?,
            num_malicious_nodes: require(&map, "net.numOfMaliciousNodes")?,
            throughput_mean: optional(&map, "net.throughputMean")?
                .unwrap_or(1.0e6),
            throughput_sd: optional(&map, "net.throughputSD")?.unwrap_or(0.0),
            propagation_time: optional(&map, "net.propagationTime")?
                .unwrap_or(10),
            workload,
            target_transaction: optional(&map, "workload.targetTransaction")?
                .map(TxId),
            pow_difficulty: require(&map, "pow.difficulty")?,
            hash_power_mean: require(&map, "pow.hashPowerMean")?,
            hash_power_sd: optional(&map, "pow.hashPowerSD")?.unwrap_or(0.0),
            max_block_size: require(&map, "bitcoin.maxBlockSize")?,
            min_size_to_mine: optional(&map, "bitcoin.minSizeToMine")?
                .unwrap_or(0),
            min_value_to_mine: optional(&map, "bitcoin.minValueToMine")?
                .unwrap_or(0),
            required_confirmations: optional(&map, "attack.requiredConfirmations")?
                .unwrap_or(0),
            min_chain_length: optional(&map, "attack.minChainLength")?
                .unwrap_or(crate::behavior::malicious::DEFAULT_MIN_CHAIN_LENGTH),
            max_chain_length: optional(&map, "attack.maxChainLength")?
                .unwrap_or(crate::behavior::malicious::DEFAULT_MAX_CHAIN_LENGTH),
            hash_power_changes,
            flags,
        })
    }

    /// The inclusive range of simulation IDs to run: the `.From`/`.To` pair
    /// when both are present, otherwise `1..=numSimulations`.
    pub fn simulation_range(&self) -> (u32, u32) {
        match (self.sim_from, self.sim_to) {
            (Some(from), Some(to)) => (from, to),
            _ => (1, self.num_simulations.max(1)),
        }
    }
}

fn require<T: std::str::FromStr>(
    map: &HashMap<&str, &str>,
    key: &'static str,
) -> Result<T, ConfigError> {
    optional(map, key)?.ok_or(ConfigError::MissingKey(key))
}

fn optional<T: std::str::FromStr>(
    map: &HashMap<&str, &str>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match map.get(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| {
            ConfigError::InvalidValue {
                key,
                value: raw.to_string(),
            }
        }),
    }
}

/// Parses the `{nodeID:hashPower:time, ...}` schedule string. Whitespace is
/// permitted around every token and `{}` is a valid empty schedule.
pub fn parse_hash_power_changes(
    input: &str,
) -> Result<Vec<HashPowerChange>, ConfigError> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Vec::new());
    }

    if !input.starts_with('{') {
        return Err(ConfigError::MissingOpeningBracket(input.to_string()));
    }
    if !input.ends_with('}') {
        return Err(ConfigError::MissingClosingBracket(input.to_string()));
    }

    let inner = input[1..input.len() - 1].trim();
    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut changes = Vec::new();
    for entry in inner.split(',') {
        let entry = entry.trim();
        let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
        if parts.len() != 3 {
            return Err(ConfigError::MalformedEntry(entry.to_string()));
        }

        let node: usize =
            parts[0].parse().map_err(|_| ConfigError::InvalidNumber {
                entry: entry.to_string(),
                value: parts[0].to_string(),
            })?;
        let hash_power: f64 =
            parts[1].parse().map_err(|_| ConfigError::InvalidNumber {
                entry: entry.to_string(),
                value: parts[1].to_string(),
            })?;
        let time: i64 =
            parts[2].parse().map_err(|_| ConfigError::InvalidNumber {
                entry: entry.to_string(),
                value: parts[2].to_string(),
            })?;

        if hash_power < 0.0 {
            return Err(ConfigError::NegativeHashPower(hash_power));
        }
        if time < 0 {
            return Err(ConfigError::NegativeTime(time));
        }

        changes.push(HashPowerChange {
            node: NodeId(node),
            hash_power,
            time: time as SimTime,
        });
    }

    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::{parse_hash_power_changes, Config, ConfigError};
    use crate::node::NodeId;

    const MINIMAL: &str = "\
        sim.terminate.atTime = 100000\n\
        net.numOfHonestNodes = 3\n\
        net.numOfMaliciousNodes = 1\n\
        workload.lambda = 2.0\n\
        workload.numTransactions = 50\n\
        pow.difficulty = 1.0E13\n\
        pow.hashPowerMean = 2.5E10\n\
        bitcoin.maxBlockSize = 1000000\n";

    #[test]
    fn minimal_file_parses_with_defaults() {
        let config = Config::from_str(MINIMAL).unwrap();
        assert_eq!(config.terminate_at, 100_000);
        assert_eq!(config.num_honest_nodes, 3);
        assert_eq!(config.num_malicious_nodes, 1);
        assert_eq!(config.num_simulations, 1);
        assert_eq!(config.simulation_range(), (1, 1));
        assert!(config.hash_power_changes.is_empty());
        assert!(config.flags.block_events);
    }

    #[test]
    fn missing_required_key_names_it() {
        let err = Config::from_str("sim.terminate.atTime = 1000\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey(_)));
        assert!(err.to_string().contains("net.numOfHonestNodes"));
    }

    #[test]
    fn bad_number_names_key_and_value() {
        let text = MINIMAL.replace("pow.difficulty = 1.0E13", "pow.difficulty = abc");
        let err = Config::from_str(&text).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("pow.difficulty"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn simulation_range_prefers_from_to() {
        let text = format!(
            "{MINIMAL}sim.numSimulations = 9\n\
             sim.numSimulations.From = 3\nsim.numSimulations.To = 5\n"
        );
        let config = Config::from_str(&text).unwrap();
        assert_eq!(config.simulation_range(), (3, 5));
    }

    #[test]
    fn parse_changes_single_entry() {
        let changes = parse_hash_power_changes("{3:5.0E10:50000}").unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].node, NodeId(3));
        assert_eq!(changes[0].hash_power, 5.0e10);
        assert_eq!(changes[0].time, 50_000);
    }

    #[test]
    fn parse_changes_empty_forms() {
        assert!(parse_hash_power_changes("").unwrap().is_empty());
        assert!(parse_hash_power_changes("{}").unwrap().is_empty());
        assert!(parse_hash_power_changes("{ }").unwrap().is_empty());
    }

    #[test]
    fn parse_changes_tolerates_whitespace_and_keeps_order() {
        let changes =
            parse_hash_power_changes("{ 0 : 5.0E10 : 10000 , 1 : 3.0E10 : 20000 }")
                .unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].node, NodeId(0));
        assert_eq!(changes[0].time, 10_000);
        assert_eq!(changes[1].node, NodeId(1));
        assert_eq!(changes[1].time, 20_000);
    }

    #[test]
    fn parse_changes_rejects_missing_brackets() {
        let err = parse_hash_power_changes("0:5.0E10:10000}").unwrap_err();
        assert!(err.to_string().contains("missing opening bracket"));

        let err = parse_hash_power_changes("{0:5.0E10:10000").unwrap_err();
        assert!(err.to_string().contains("missing closing bracket"));
    }

    #[test]
    fn parse_changes_rejects_wrong_arity() {
        let err = parse_hash_power_changes("{0:5.0E10}").unwrap_err();
        assert!(err.to_string().contains("must have format"));

        let err = parse_hash_power_changes("{0:5.0E10:10000:extra}").unwrap_err();
        assert!(err.to_string().contains("must have format"));
    }

    #[test]
    fn parse_changes_rejects_non_numeric_fields() {
        for input in [
            "{notanumber:5.0E10:10000}",
            "{0:notanumber:10000}",
            "{0:5.0E10:notanumber}",
        ] {
            let err = parse_hash_power_changes(input).unwrap_err();
            assert!(
                err.to_string().contains("invalid number"),
                "input {input:?} gave {err}"
            );
        }
    }

    #[test]
    fn parse_changes_rejects_negative_values() {
        let err = parse_hash_power_changes("{0:-5.0E10:10000}").unwrap_err();
        assert!(err.to_string().contains("cannot be negative"));

        let err = parse_hash_power_changes("{0:5.0E10:-10000}").unwrap_err();
        assert!(err.to_string().contains("cannot be negative"));
    }

    #[test]
    fn parse_changes_accepts_zero_and_large_values() {
        assert_eq!(parse_hash_power_changes("{0:0.0:10000}").unwrap().len(), 1);
        assert_eq!(parse_hash_power_changes("{0:5.0E10:0}").unwrap().len(), 1);
        assert_eq!(
            parse_hash_power_changes("{999:9.99E99:9999999999}")
                .unwrap()
                .len(),
            1
        );
    }
}
