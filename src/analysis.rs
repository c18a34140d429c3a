/*!
Theoretical attack-success analysis and per-simulation attack accounting

The closed-form model comes from Section 11 of the Bitcoin whitepaper: given
the attacker's share of hashpower `q` and the recipient's confirmation count
`z`, the probability that the attacker's private chain ever overtakes the
honest one is

```text
P = 1 - sum(k = 0..=z) poisson(k; z * q/p) * (1 - (q/p)^(z - k))
```

with `p = 1 - q`. Simulation outcomes are validated against this model.
*/

use crate::scheduler::SimTime;

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    #[error("attacker hashpower share must be in (0, 1), got {0}")]
    PowerOutOfRange(f64),
    #[error("target probability must be in (0, 1), got {0}")]
    TargetOutOfRange(f64),
}

/// Search cap for [`required_confirmations`]; no realistic target needs
/// more.
const MAX_CONFIRMATION_SEARCH: u32 = 1_000;

/// Probability that an attacker controlling a `q` share of total hashpower
/// catches up with and overtakes the honest chain after the recipient has
/// seen `z` confirmations.
pub fn attack_success_probability(q: f64, z: u32) -> Result<f64, AnalysisError> {
    if q <= 0.0 || q >= 1.0 || q.is_nan() {
        return Err(AnalysisError::PowerOutOfRange(q));
    }

    // A majority attacker always wins; with no confirmations required the
    // recipient has already accepted the payment.
    if q >= 0.5 || z == 0 {
        return Ok(1.0);
    }

    let p = 1.0 - q;
    let ratio = q / p;
    let lambda = z as f64 * ratio;

    let mut sum = 1.0;
    for k in 0..=z {
        // poisson(k; lambda), built multiplicatively to avoid overflowing
        // factorials.
        let mut poisson = (-lambda).exp();
        for i in 1..=k {
            poisson *= lambda / i as f64;
        }

        sum -= poisson * (1.0 - ratio.powi((z - k) as i32));
    }

    Ok(sum)
}

/// The smallest confirmation count for which the attack-success probability
/// drops to `target` or below. Linear search from zero, capped at 1000;
/// a majority attacker can never be defended against, reported as
/// [`u32::MAX`].
pub fn required_confirmations(q: f64, target: f64) -> Result<u32, AnalysisError> {
    if q <= 0.0 || q >= 1.0 || q.is_nan() {
        return Err(AnalysisError::PowerOutOfRange(q));
    }
    if target <= 0.0 || target >= 1.0 || target.is_nan() {
        return Err(AnalysisError::TargetOutOfRange(target));
    }
    if q >= 0.5 {
        return Ok(u32::MAX);
    }

    let mut z = 0;
    while attack_success_probability(q, z)? > target {
        z += 1;
        if z > MAX_CONFIRMATION_SEARCH {
            break;
        }
    }

    Ok(z)
}

/// Formats the probability tables from the whitepaper for the standard `q`
/// values, for eyeballing against the published numbers.
pub fn whitepaper_report() -> String {
    use std::fmt::Write;

    let mut out = String::new();
    let rule = "-".repeat(40);

    out.push_str("Attacker success probability (Nakamoto, Section 11)\n\n");

    out.push_str("q = 0.1\n");
    out.push_str(&rule);
    out.push('\n');
    for z in 0..=10 {
        let p = attack_success_probability(0.1, z).expect("q in range");
        let _ = writeln!(out, "z = {z:<4} P = {p:.7}");
    }
    out.push('\n');

    out.push_str("q = 0.3\n");
    out.push_str(&rule);
    out.push('\n');
    for z in (0..=50).step_by(5) {
        let p = attack_success_probability(0.3, z).expect("q in range");
        let _ = writeln!(out, "z = {z:<4} P = {p:.7}");
    }
    out.push('\n');

    out.push_str("Confirmations required for P < 0.001\n");
    out.push_str(&rule);
    out.push('\n');
    for q in [0.10, 0.15, 0.20, 0.25, 0.30, 0.35, 0.40, 0.45] {
        let z = required_confirmations(q, 0.001).expect("q in range");
        let _ = writeln!(out, "q = {q:.2} z = {z}");
    }

    out
}

/// Formats a comparison of an observed attack success rate against the
/// theoretical prediction for the same `q` and `z`.
pub fn simulation_comparison(
    q: f64,
    z: u32,
    observed_rate: f64,
    attempts: usize,
) -> String {
    use std::fmt::Write;

    let theoretical = attack_success_probability(q, z).unwrap_or(f64::NAN);
    let difference = (theoretical - observed_rate).abs();

    let mut out = String::new();
    let _ = writeln!(out, "Theoretical vs. simulated attack success");
    let _ = writeln!(out, "  attacker hashpower share (q): {q:.2}");
    let _ = writeln!(out, "  confirmations (z):            {z}");
    let _ = writeln!(out, "  attack attempts:              {attempts}");
    let _ = writeln!(out, "  theoretical probability:      {theoretical:.7}");
    let _ = writeln!(out, "  observed success rate:        {observed_rate:.7}");
    let _ = writeln!(out, "  absolute difference:          {difference:.7}");

    out
}

/// How a single attack attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackResolution {
    /// Still running; becomes `Unresolved` if the simulation ends first.
    Ongoing,
    /// The revealed chain displaced the target transaction.
    Success,
    /// The revealed chain failed to displace the target transaction.
    Failure,
    /// The simulation terminated before the reveal conditions were met.
    Unresolved,
}

/// Record of one attack attempt.
#[derive(Debug, Clone)]
pub struct AttackOutcome {
    pub started_at: SimTime,
    pub ended_at: Option<SimTime>,
    pub confirmations_at_start: u64,
    pub hidden_blocks: usize,
    pub public_blocks: usize,
    pub resolution: AttackResolution,
}

/// Per-simulation collector of attack attempts and their outcomes. Owned by
/// the simulation rather than held as process-wide state, so parallel runs
/// never share counters.
#[derive(Debug, Default)]
pub struct AttackMetrics {
    attacker_power_share: f64,
    confirmations_required: u32,
    outcomes: Vec<AttackOutcome>,
}

impl AttackMetrics {
    pub fn new(attacker_power_share: f64, confirmations_required: u32) -> Self {
        AttackMetrics {
            attacker_power_share,
            confirmations_required,
            outcomes: Vec::new(),
        }
    }

    /// Records the start of an attack attempt and returns its index for
    /// later updates.
    pub fn record_attack_start(
        &mut self,
        started_at: SimTime,
        confirmations_at_start: u64,
    ) -> usize {
        self.outcomes.push(AttackOutcome {
            started_at,
            ended_at: None,
            confirmations_at_start,
            hidden_blocks: 0,
            public_blocks: 0,
            resolution: AttackResolution::Ongoing,
        });
        self.outcomes.len() - 1
    }

    pub fn record_hidden_block(&mut self, attack: usize) {
        if let Some(outcome) = self.outcomes.get_mut(attack) {
            outcome.hidden_blocks += 1;
        }
    }

    pub fn record_public_block(&mut self, attack: usize) {
        if let Some(outcome) = self.outcomes.get_mut(attack) {
            outcome.public_blocks += 1;
        }
    }

    pub fn record_attack_end(
        &mut self,
        attack: usize,
        at: SimTime,
        resolution: AttackResolution,
    ) {
        if let Some(outcome) = self.outcomes.get_mut(attack) {
            outcome.ended_at = Some(at);
            outcome.resolution = resolution;
        }
    }

    pub fn outcomes(&self) -> &[AttackOutcome] {
        &self.outcomes
    }

    pub fn attempts(&self) -> usize {
        self.outcomes.len()
    }

    pub fn successes(&self) -> usize {
        self.count(AttackResolution::Success)
    }

    pub fn failures(&self) -> usize {
        self.count(AttackResolution::Failure)
    }

    pub fn unresolved(&self) -> usize {
        self.count(AttackResolution::Unresolved)
    }

    /// Successful attacks over total attempts. Unresolved attempts count
    /// against the attacker, not for it.
    pub fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        self.successes() as f64 / self.outcomes.len() as f64
    }

    /// Merges another collector's outcomes into this one.
    pub fn absorb(&mut self, other: AttackMetrics) {
        if self.outcomes.is_empty() {
            self.attacker_power_share = other.attacker_power_share;
            self.confirmations_required = other.confirmations_required;
        }
        self.outcomes.extend(other.outcomes);
    }

    /// Human-readable summary, with the theory comparison appended when any
    /// attempts were recorded.
    pub fn summary(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "Attack summary");
        let _ = writeln!(
            out,
            "  attacker hashpower share: {:.2}",
            self.attacker_power_share
        );
        let _ = writeln!(
            out,
            "  confirmations required:   {}",
            self.confirmations_required
        );
        let _ = writeln!(out, "  attempts:   {}", self.attempts());
        let _ = writeln!(out, "  successes:  {}", self.successes());
        let _ = writeln!(out, "  failures:   {}", self.failures());
        let _ = writeln!(out, "  unresolved: {}", self.unresolved());

        if !self.outcomes.is_empty() {
            out.push('\n');
            out.push_str(&simulation_comparison(
                self.attacker_power_share,
                self.confirmations_required,
                self.success_rate(),
                self.attempts(),
            ));
        }

        out
    }

    fn count(&self, resolution: AttackResolution) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.resolution == resolution)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        attack_success_probability, required_confirmations, AttackMetrics,
        AttackResolution,
    };

    const TOLERANCE: f64 = 1e-7;

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= TOLERANCE,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn whitepaper_values_for_ten_percent_attacker() {
        let expected = [
            1.0000000, 0.2045873, 0.0509779, 0.0131722, 0.0034552, 0.0009137,
            0.0002428, 0.0000647, 0.0000173, 0.0000046, 0.0000012,
        ];
        for (z, &p) in expected.iter().enumerate() {
            assert_close(attack_success_probability(0.1, z as u32).unwrap(), p);
        }
    }

    #[test]
    fn whitepaper_values_for_thirty_percent_attacker() {
        assert_close(attack_success_probability(0.3, 5).unwrap(), 0.1773523);
        assert_close(attack_success_probability(0.3, 10).unwrap(), 0.0416605);
        assert_close(attack_success_probability(0.3, 50).unwrap(), 0.0000006);
    }

    #[test]
    fn whitepaper_confirmation_table() {
        let table = [
            (0.10, 5),
            (0.15, 8),
            (0.20, 11),
            (0.25, 15),
            (0.30, 24),
            (0.35, 41),
            (0.40, 89),
            (0.45, 340),
        ];
        for (q, z) in table {
            assert_eq!(required_confirmations(q, 0.001).unwrap(), z, "q = {q}");
        }
    }

    #[test]
    fn zero_confirmations_always_succeed() {
        for q in [0.01, 0.1, 0.25, 0.49, 0.7, 0.99] {
            assert_eq!(attack_success_probability(q, 0).unwrap(), 1.0);
        }
    }

    #[test]
    fn majority_attacker_always_succeeds() {
        for q in [0.5, 0.6, 0.99] {
            for z in [1, 6, 100] {
                assert_eq!(attack_success_probability(q, z).unwrap(), 1.0);
            }
        }
        assert_eq!(required_confirmations(0.5, 0.001).unwrap(), u32::MAX);
    }

    #[test]
    fn probability_is_monotone_in_confirmations_and_power() {
        for q in [0.1, 0.2, 0.3, 0.4] {
            let mut last = f64::INFINITY;
            for z in 0..=50 {
                let p = attack_success_probability(q, z).unwrap();
                assert!(p <= last + TOLERANCE, "P({q}, {z}) rose");
                last = p;
            }
        }

        for z in [1, 3, 6, 12] {
            let mut last = 0.0;
            for q in [0.1, 0.2, 0.3, 0.4] {
                let p = attack_success_probability(q, z).unwrap();
                assert!(p > last, "P({q}, {z}) did not rise with q");
                last = p;
            }
        }
    }

    #[test]
    fn out_of_range_power_is_rejected() {
        assert!(attack_success_probability(0.0, 3).is_err());
        assert!(attack_success_probability(1.0, 3).is_err());
        assert!(attack_success_probability(-0.2, 3).is_err());
        assert!(required_confirmations(0.3, 0.0).is_err());
        assert!(required_confirmations(0.3, 1.0).is_err());
    }

    #[test]
    fn metrics_track_outcomes() {
        let mut metrics = AttackMetrics::new(0.25, 2);
        let first = metrics.record_attack_start(1_000, 2);
        metrics.record_hidden_block(first);
        metrics.record_hidden_block(first);
        metrics.record_attack_end(first, 5_000, AttackResolution::Success);

        let second = metrics.record_attack_start(9_000, 2);
        metrics.record_attack_end(second, 9_500, AttackResolution::Unresolved);

        assert_eq!(metrics.attempts(), 2);
        assert_eq!(metrics.successes(), 1);
        assert_eq!(metrics.unresolved(), 1);
        assert_eq!(metrics.success_rate(), 0.5);
        assert_eq!(metrics.outcomes()[0].hidden_blocks, 2);
    }
}
