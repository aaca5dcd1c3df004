//! Cross-protocol comparison
//!
//! The report groups outcomes by scenario key (`write_db_bool00_10hz`, `bulk_write`, ...)
//! and, inside each scenario, by protocol in the order they ran.

use crate::metrics::{summarize, SummaryStatistics};
use crate::utils::{format_bytes, format_ms_opt, format_rate, NO_DATA};
use crate::{RunResult, RunStatus};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tabled::settings::Style;
use tabled::{Table, Tabled};

/// A rate-capped adapter counts as meeting its target within this fraction below it
pub const TARGET_TOLERANCE: f64 = 0.05;

const TIE_EPSILON: f64 = 1e-9;

pub const TRUST_ASSUMPTION: &str = "Writes are counted as applied when the transport reports success; \
values are not read back from controller memory.";

/// What one protocol produced for one scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioOutcome {
    pub protocol: String,
    pub status: RunStatus,
    pub statistics: SummaryStatistics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioEntry {
    pub target_ops_per_sec: Option<f64>,
    pub outcomes: IndexMap<String, ScenarioOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub generated_at: DateTime<Utc>,
    pub scenarios: IndexMap<String, ScenarioEntry>,
    pub trust_assumption: String,
}

impl Default for ComparisonReport {
    fn default() -> Self {
        Self::new()
    }
}

impl ComparisonReport {
    pub fn new() -> Self {
        Self {
            generated_at: Utc::now(),
            scenarios: IndexMap::new(),
            trust_assumption: TRUST_ASSUMPTION.to_string(),
        }
    }

    /// Add the statistics of a finished run. A second run of the same protocol and
    /// scenario replaces the first.
    pub fn record(&mut self, run: &RunResult) {
        let entry = self.scenarios.entry(run.scenario.key()).or_default();
        entry.target_ops_per_sec = run.scenario.target_rate;
        entry.outcomes.insert(
            run.adapter.clone(),
            ScenarioOutcome {
                protocol: run.adapter.clone(),
                status: run.status.clone(),
                statistics: summarize(run),
            },
        );
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    pub fn outcome(&self, scenario: &str, protocol: &str) -> Option<&ScenarioOutcome> {
        self.scenarios.get(scenario)?.outcomes.get(protocol)
    }

    /// Best protocol for a scenario, if any outcome has successful samples.
    ///
    /// Unpaced scenarios go to the highest achieved rate. Rate-capped ones go to the
    /// adapter closest to the target among those within tolerance of it, or to the
    /// fastest when none are. Ties are broken by lowest P50.
    pub fn winner(&self, scenario: &str) -> Option<&str> {
        let entry = self.scenarios.get(scenario)?;
        let candidates: Vec<&ScenarioOutcome> = entry
            .outcomes
            .values()
            .filter(|o| o.statistics.has_data() && o.statistics.achieved_ops_per_sec.is_some())
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let pool: Vec<&ScenarioOutcome> = match entry.target_ops_per_sec {
            Some(target) => {
                let floor = target * (1.0 - TARGET_TOLERANCE);
                let meeting: Vec<_> = candidates
                    .iter()
                    .copied()
                    .filter(|o| achieved(o) >= floor)
                    .collect();
                if meeting.is_empty() {
                    candidates
                } else {
                    return pick(meeting, |o| -(achieved(o) - target).abs());
                }
            }
            None => candidates,
        };
        pick(pool, achieved)
    }

    /// Winner per scenario, in report order
    pub fn winners(&self) -> IndexMap<String, Option<String>> {
        self.scenarios
            .keys()
            .map(|key| (key.clone(), self.winner(key).map(str::to_string)))
            .collect()
    }

    /// Plain-text table of every outcome, followed by the trust assumption
    pub fn render_table(&self) -> String {
        let mut rows = Vec::new();
        for (key, entry) in &self.scenarios {
            let winner = self.winner(key);
            for outcome in entry.outcomes.values() {
                let stats = &outcome.statistics;
                rows.push(OutcomeRow {
                    scenario: key.clone(),
                    protocol: outcome.protocol.clone(),
                    target: entry
                        .target_ops_per_sec
                        .map(format_rate)
                        .unwrap_or_else(|| "-".to_string()),
                    achieved: stats
                        .achieved_ops_per_sec
                        .map(format_rate)
                        .unwrap_or_else(|| NO_DATA.to_string()),
                    p50: format_ms_opt(stats.p50_ms),
                    p90: format_ms_opt(stats.p90_ms),
                    p99: format_ms_opt(stats.p99_ms),
                    stdev: stats.stdev_ms.map_or_else(|| "-".to_string(), |s| format!("{:.3}", s)),
                    errors: stats.error_count,
                    throughput: stats
                        .throughput_bytes_per_sec
                        .map(|b| format!("{}/s", format_bytes(b)))
                        .unwrap_or_else(|| "-".to_string()),
                    status: outcome.status.to_string(),
                    winner: if winner == Some(outcome.protocol.as_str()) { "*" } else { "" }.to_string(),
                });
            }
        }

        let mut out = String::new();
        if rows.is_empty() {
            out.push_str("No scenarios were run.\n");
        } else {
            let mut table = Table::new(rows);
            table.with(Style::modern());
            let _ = writeln!(out, "{}", table);
        }
        let _ = writeln!(out, "\nNote: {}", self.trust_assumption);
        out
    }
}

/// Highest score wins; scores within epsilon fall back to lowest P50
fn pick<'a, F>(pool: Vec<&'a ScenarioOutcome>, score: F) -> Option<&'a str>
where
    F: Fn(&ScenarioOutcome) -> f64,
{
    let mut best: Option<&ScenarioOutcome> = None;
    for outcome in pool {
        best = match best {
            None => Some(outcome),
            Some(current) => {
                let (a, b) = (score(outcome), score(current));
                if a > b + TIE_EPSILON {
                    Some(outcome)
                } else if (a - b).abs() <= TIE_EPSILON && p50(outcome) < p50(current) {
                    Some(outcome)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.map(|o| o.protocol.as_str())
}

fn achieved(outcome: &ScenarioOutcome) -> f64 {
    outcome.statistics.achieved_ops_per_sec.unwrap_or(0.0)
}

fn p50(outcome: &ScenarioOutcome) -> f64 {
    outcome.statistics.p50_ms.unwrap_or(f64::INFINITY)
}

#[derive(Tabled)]
struct OutcomeRow {
    scenario: String,
    protocol: String,
    target: String,
    achieved: String,
    #[tabled(rename = "P50 ms")]
    p50: String,
    #[tabled(rename = "P90 ms")]
    p90: String,
    #[tabled(rename = "P99 ms")]
    p99: String,
    #[tabled(rename = "stdev ms")]
    stdev: String,
    errors: usize,
    throughput: String,
    status: String,
    #[tabled(rename = "best")]
    winner: String,
}
