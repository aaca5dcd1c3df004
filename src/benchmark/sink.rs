//! Where finished sessions go.
//!
//! The directory sink lays a session out as
//!
//! ```text
//! <root>/<session-id>/report.json          comparison report and run index
//! <root>/<session-id>/summary.txt          rendered comparison table
//! <root>/<session-id>/samples/<adapter>__<scenario>.csv
//! ```

use super::{BenchmarkSession, SessionStatus};
use chrono::{DateTime, Utc};
use plcbench_benchmarks::utils::format_duration;
use plcbench_benchmarks::{ComparisonReport, RunResult, RunStatus, Scenario};
use plcbench_common::{BenchError, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Consumer of a finished (or cancelled) session
pub trait ResultSink {
    fn persist(&mut self, session: &BenchmarkSession) -> Result<()>;
}

/// Writes JSON, text and CSV files under a root directory
#[derive(Debug, Clone)]
pub struct JsonDirectorySink {
    root: PathBuf,
}

#[derive(Serialize)]
struct ReportFile<'a> {
    session_id: &'a str,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    report: &'a ComparisonReport,
    runs: Vec<RunIndexEntry<'a>>,
}

#[derive(Serialize)]
struct RunIndexEntry<'a> {
    adapter: &'a str,
    scenario: &'a Scenario,
    status: &'a RunStatus,
    started_at: DateTime<Utc>,
    wall_clock_secs: f64,
    sample_count: usize,
    payload_bytes: Option<usize>,
    samples_file: String,
}

impl JsonDirectorySink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn session_dir(&self, session: &BenchmarkSession) -> PathBuf {
        self.root.join(&session.id)
    }

    fn write_samples(path: &Path, run: &RunResult) -> Result<()> {
        let mut writer = csv::Writer::from_path(path).map_err(csv_error)?;
        for sample in &run.samples {
            writer.serialize(sample).map_err(csv_error)?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl ResultSink for JsonDirectorySink {
    fn persist(&mut self, session: &BenchmarkSession) -> Result<()> {
        let dir = self.session_dir(session);
        let samples_dir = dir.join("samples");
        fs::create_dir_all(&samples_dir)?;

        let mut runs = Vec::with_capacity(session.runs.len());
        for run in &session.runs {
            let file_name = samples_file_name(run);
            Self::write_samples(&samples_dir.join(&file_name), run)?;
            debug!("Wrote {} samples to {}", run.samples.len(), file_name);
            runs.push(RunIndexEntry {
                adapter: &run.adapter,
                scenario: &run.scenario,
                status: &run.status,
                started_at: run.started_at,
                wall_clock_secs: run.wall_clock.as_secs_f64(),
                sample_count: run.samples.len(),
                payload_bytes: run.payload_bytes,
                samples_file: format!("samples/{}", file_name),
            });
        }

        let report = ReportFile {
            session_id: &session.id,
            status: session.status,
            started_at: session.started_at,
            finished_at: session.finished_at,
            report: &session.report,
            runs,
        };
        fs::write(dir.join("report.json"), serde_json::to_string_pretty(&report)?)?;

        let took = session
            .finished_at
            .and_then(|end| (end - session.started_at).to_std().ok())
            .map_or_else(|| "-".to_string(), format_duration);
        let summary = format!(
            "plcbench session {} ({})\nstarted {}, took {}\n\n{}",
            session.id,
            session.status,
            session.started_at.to_rfc3339(),
            took,
            session.report.render_table()
        );
        fs::write(dir.join("summary.txt"), summary)?;

        info!("Results written to {}", dir.display());
        Ok(())
    }
}

/// Keeps sessions in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    pub sessions: Vec<BenchmarkSession>,
}

impl ResultSink for MemorySink {
    fn persist(&mut self, session: &BenchmarkSession) -> Result<()> {
        self.sessions.push(session.clone());
        Ok(())
    }
}

fn samples_file_name(run: &RunResult) -> String {
    let raw = format!("{}__{}", run.adapter, run.scenario.key());
    let name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' { c } else { '_' })
        .collect();
    format!("{}.csv", name)
}

fn csv_error(err: csv::Error) -> BenchError {
    BenchError::Serialization(err.to_string())
}
