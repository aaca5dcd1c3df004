//! plcbench measurement framework
//!
//! This crate turns a scenario into samples and samples into comparable numbers:
//! - Rate pacing with coordinated-omission-aware dispatch
//! - Single-variable write/read loops
//! - Bulk block transfer in both directions
//! - Mixed write/read cycles
//! - Latency percentiles, achieved rates and throughput
//! - Cross-protocol comparison report

pub mod bulk;
pub mod metrics;
pub mod mixed;
pub mod pacer;
pub mod report;
pub mod single_write;
pub mod utils;

use chrono::{DateTime, Utc};
use plcbench_common::{BenchError, ErrorKind, Protocol, Result, ScenarioMatrix, VariableKind, VariableSpec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use bulk::{run_bulk, BulkPayload};
pub use metrics::{percentile, sample_stdev, summarize, SummaryStatistics};
pub use mixed::run_mixed;
pub use pacer::RatePacer;
pub use report::{ComparisonReport, ScenarioOutcome};
pub use single_write::{run_single, value_for};

/// Whether a scenario writes or reads its variable, or cycles through both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioOperation {
    Write,
    Read,
    Mixed,
}

impl fmt::Display for ScenarioOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioOperation::Write => write!(f, "write"),
            ScenarioOperation::Read => write!(f, "read"),
            ScenarioOperation::Mixed => write!(f, "mixed"),
        }
    }
}

/// How long a scenario runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    /// Fixed number of operations
    Count(usize),
    /// Every operation whose intended dispatch falls inside the window
    Duration(Duration),
}

impl Workload {
    /// Whether operation `index`, intended `offset` after run start, belongs to the run
    pub fn admits(&self, index: usize, offset: Duration) -> bool {
        match *self {
            Workload::Count(n) => index < n,
            Workload::Duration(window) => offset < window,
        }
    }
}

/// One (protocol, variable, rate, workload) combination. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub protocol: Protocol,
    /// Kind of `variable`; for a mixed cycle, of its first variable
    pub kind: VariableKind,
    pub variable: String,
    /// Absent for bulk and mixed scenarios, which run unpaced
    pub target_rate: Option<f64>,
    pub workload: Workload,
    pub operation: ScenarioOperation,
    /// Variables a mixed cycle writes and reads back, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cycle: Vec<VariableSpec>,
}

impl Scenario {
    pub fn paced(
        protocol: Protocol,
        variable: impl Into<String>,
        kind: VariableKind,
        rate: f64,
        workload: Workload,
        operation: ScenarioOperation,
    ) -> Self {
        Self {
            protocol,
            kind,
            variable: variable.into(),
            target_rate: Some(rate),
            workload,
            operation,
            cycle: Vec::new(),
        }
    }

    /// Unpaced bulk block writes
    pub fn bulk(protocol: Protocol, variable: impl Into<String>, repetitions: usize) -> Self {
        Self::bulk_with(protocol, variable.into(), repetitions, ScenarioOperation::Write)
    }

    /// Unpaced reads of the whole bulk block
    pub fn bulk_read(protocol: Protocol, variable: impl Into<String>, repetitions: usize) -> Self {
        Self::bulk_with(protocol, variable.into(), repetitions, ScenarioOperation::Read)
    }

    fn bulk_with(protocol: Protocol, variable: String, repetitions: usize, operation: ScenarioOperation) -> Self {
        Self {
            protocol,
            kind: VariableKind::BulkBlock,
            variable,
            target_rate: None,
            workload: Workload::Count(repetitions),
            operation,
            cycle: Vec::new(),
        }
    }

    /// Unpaced cycles that write every variable of `cycle` and then read each back
    pub fn mixed(protocol: Protocol, cycle: Vec<VariableSpec>, repetitions: usize) -> Self {
        let kind = cycle.first().map_or(VariableKind::Bool, |v| v.kind);
        Self {
            protocol,
            kind,
            variable: MIXED_KEY.to_string(),
            target_rate: None,
            workload: Workload::Count(repetitions),
            operation: ScenarioOperation::Mixed,
            cycle,
        }
    }

    pub fn is_bulk(&self) -> bool {
        self.kind.is_bulk()
    }

    pub fn is_mixed(&self) -> bool {
        self.operation == ScenarioOperation::Mixed
    }

    /// Protocol-independent key that groups the same scenario across adapters.
    ///
    /// Paced keys carry the whole variable name, so variables sharing a last path
    /// segment stay apart.
    pub fn key(&self) -> String {
        if self.is_mixed() {
            return MIXED_KEY.to_string();
        }
        if self.is_bulk() {
            return format!("bulk_{}", self.operation);
        }
        let rate = self.target_rate.unwrap_or_default();
        format!("{}_{}_{}hz", self.operation, slug(&self.variable), rate)
    }

    /// Scenario list for one protocol: each variable at each rate, the same again as
    /// reads when requested, then the bulk transfer (read back too when reads are on),
    /// then the mixed cycle.
    pub fn expand(matrix: &ScenarioMatrix, protocol: Protocol) -> Vec<Scenario> {
        // unrepresentable durations become empty windows, which validate() rejects
        let workload = match (matrix.operation_count, matrix.duration_secs) {
            (Some(count), _) => Workload::Count(count),
            (None, Some(secs)) => Workload::Duration(Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)),
            (None, None) => Workload::Count(0),
        };
        let mut operations = vec![ScenarioOperation::Write];
        if matrix.include_reads {
            operations.push(ScenarioOperation::Read);
        }

        let mut scenarios = Vec::new();
        for operation in operations {
            for variable in &matrix.variables {
                for rate in &matrix.rates {
                    scenarios.push(Scenario::paced(
                        protocol,
                        variable.name.clone(),
                        variable.kind,
                        *rate,
                        workload,
                        operation,
                    ));
                }
            }
        }
        if matrix.bulk_enabled {
            scenarios.push(Scenario::bulk(protocol, matrix.bulk_variable.clone(), matrix.bulk_repetitions));
            if matrix.include_reads {
                scenarios.push(Scenario::bulk_read(protocol, matrix.bulk_variable.clone(), matrix.bulk_repetitions));
            }
        }
        if matrix.mixed_enabled {
            scenarios.push(Scenario::mixed(protocol, matrix.variables.clone(), matrix.mixed_repetitions));
        }
        scenarios
    }

    /// Reject scenarios no loop can run
    pub fn validate(&self) -> Result<()> {
        if let Workload::Count(0) = self.workload {
            return Err(BenchError::config(format!("{}: operation count must be positive", self.key())));
        }
        if let Workload::Duration(d) = self.workload {
            if d.is_zero() {
                return Err(BenchError::config(format!("{}: duration must be positive", self.key())));
            }
        }
        if self.is_mixed() {
            if self.cycle.is_empty() {
                return Err(BenchError::config(format!("{}: mixed cycle without variables", self.key())));
            }
            if let Some(bulk) = self.cycle.iter().find(|v| v.kind.is_bulk()) {
                return Err(BenchError::config(format!("{}: {} is a bulk block", self.key(), bulk.name)));
            }
            return Ok(());
        }
        match (self.is_bulk(), self.target_rate) {
            (false, None) => Err(BenchError::config(format!("{}: paced scenario without a rate", self.key()))),
            (false, Some(rate)) if !(rate.is_finite() && rate > 0.0) => {
                Err(BenchError::config(format!("{}: invalid target rate {}", self.key(), rate)))
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.key())
    }
}

const MIXED_KEY: &str = "mixed_cycle";

/// Lowercase form of a controller variable name in which every run of characters
/// other than ASCII letters and digits becomes a single underscore
fn slug(variable: &str) -> String {
    let mut out = String::with_capacity(variable.len());
    for c in variable.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.is_empty() && !out.ends_with('_') {
            out.push('_');
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// One measured operation. Offsets are milliseconds since the run started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSample {
    pub index: usize,
    pub intended_offset_ms: f64,
    pub dispatch_offset_ms: f64,
    pub completion_offset_ms: f64,
    pub latency_ms: f64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error: Option<String>,
}

impl OperationSample {
    pub fn succeeded(index: usize, intended: Duration, dispatched: Duration, completed: Duration, latency: Duration) -> Self {
        Self {
            index,
            intended_offset_ms: as_ms(intended),
            dispatch_offset_ms: as_ms(dispatched),
            completion_offset_ms: as_ms(completed),
            latency_ms: as_ms(latency),
            success: true,
            error_kind: None,
            error: None,
        }
    }

    /// Failed sample; latency runs from dispatch to the observed failure
    pub fn failed(index: usize, intended: Duration, dispatched: Duration, completed: Duration, error: &BenchError) -> Self {
        Self {
            index,
            intended_offset_ms: as_ms(intended),
            dispatch_offset_ms: as_ms(dispatched),
            completion_offset_ms: as_ms(completed),
            latency_ms: as_ms(completed.saturating_sub(dispatched)),
            success: false,
            error_kind: Some(error.kind()),
            error: Some(error.to_string()),
        }
    }
}

pub(crate) fn as_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// How a scenario run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    Complete,
    /// The adapter lost its connection; samples are the partial sequence
    Incomplete(String),
    /// Stopped by the external stop signal
    Cancelled,
    /// Never started, e.g. the adapter could not (re)connect
    Failed(String),
}

impl RunStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunStatus::Complete)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Complete => write!(f, "complete"),
            RunStatus::Incomplete(_) => write!(f, "incomplete"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Failed(_) => write!(f, "failed"),
        }
    }
}

/// Samples and outcome of one scenario against one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub scenario: Scenario,
    pub adapter: String,
    pub status: RunStatus,
    pub samples: Vec<OperationSample>,
    pub started_at: DateTime<Utc>,
    pub wall_clock: Duration,
    /// Bytes moved per successful call, for bulk runs
    pub payload_bytes: Option<usize>,
}

impl RunResult {
    /// A run that produced no samples because it could not start
    pub fn failed(scenario: Scenario, adapter: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            scenario,
            adapter: adapter.into(),
            status: RunStatus::Failed(reason.into()),
            samples: Vec::new(),
            started_at: Utc::now(),
            wall_clock: Duration::ZERO,
            payload_bytes: None,
        }
    }

    pub fn success_count(&self) -> usize {
        self.samples.iter().filter(|s| s.success).count()
    }

    pub fn error_count(&self) -> usize {
        self.samples.len() - self.success_count()
    }
}
