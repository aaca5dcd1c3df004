//! Benchmark sessions
//!
//! A session is one invocation of the harness: every registered adapter runs its
//! scenario list, each finished run is folded into a fresh [`ComparisonReport`], and
//! the whole session is handed to a [`ResultSink`](sink::ResultSink) at the end.

use chrono::{DateTime, Utc};
use plcbench_benchmarks::{ComparisonReport, RunResult, RunStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

pub mod runner;
pub mod sink;

pub use runner::Orchestrator;
pub use sink::{JsonDirectorySink, MemorySink, ResultSink};

/// Progress update emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    AdapterStarted { adapter: String, scenarios: usize },
    ScenarioStarted { adapter: String, scenario: String, position: usize, total: usize },
    ScenarioFinished { adapter: String, scenario: String, status: RunStatus, samples: usize },
    AdapterFinished { adapter: String },
}

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Cancelled,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything one invocation produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkSession {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    /// Raw runs in execution order
    pub runs: Vec<RunResult>,
    pub report: ComparisonReport,
}

impl BenchmarkSession {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: SessionStatus::Running,
            runs: Vec::new(),
            report: ComparisonReport::new(),
        }
    }

    /// Append a finished run and fold it into the report
    pub fn record(&mut self, run: RunResult) {
        self.report.record(&run);
        self.runs.push(run);
    }

    pub fn finish(&mut self, status: SessionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Runs that did not complete normally
    pub fn unfinished_runs(&self) -> impl Iterator<Item = &RunResult> {
        self.runs.iter().filter(|r| !r.status.is_complete())
    }
}

impl Default for BenchmarkSession {
    fn default() -> Self {
        Self::new()
    }
}
