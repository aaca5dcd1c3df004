//! Bulk block transfer.

use crate::{OperationSample, RunResult, RunStatus, Scenario, ScenarioOperation};
use chrono::Utc;
use plcbench_common::{BenchError, LTime, Result, LTIME_WIDTH_BYTES};
use plcbench_protocol::ProtocolAdapter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Entries in the standard bulk block
pub const BULK_ENTRIES: usize = 100;
/// Spacing between consecutive LTIME entries
pub const LTIME_STEP_NANOS: i64 = 1_000_000;

/// The LTIME block moved by a bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkPayload {
    values: Vec<String>,
}

impl BulkPayload {
    /// Entry `i` is `LT#<i * 1_000_000>ns`
    pub fn standard() -> Self {
        Self::with_entries(BULK_ENTRIES)
    }

    pub fn with_entries(entries: usize) -> Self {
        let values = (0..entries)
            .map(|i| LTime::from_nanos(i as i64 * LTIME_STEP_NANOS).to_string())
            .collect();
        Self { values }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Size of the block in controller memory
    pub fn size_bytes(&self) -> usize {
        self.values.len() * LTIME_WIDTH_BYTES
    }
}

impl Default for BulkPayload {
    fn default() -> Self {
        Self::standard()
    }
}

/// Run a bulk scenario: back-to-back `write_bulk` (or `read_bulk`) calls, no pacing.
///
/// Failure handling matches the paced loop. A count workload makes that many calls;
/// a duration workload keeps calling until the window has passed. Reads ask for as
/// many elements as the payload holds.
pub async fn run_bulk(
    adapter: &mut dyn ProtocolAdapter,
    scenario: &Scenario,
    payload: &BulkPayload,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    scenario.validate()?;
    if !scenario.is_bulk() || scenario.is_mixed() {
        return Err(BenchError::config(format!("{} is not a bulk scenario", scenario)));
    }

    info!(
        "Running bulk {} of {} entries ({} bytes) against {}",
        scenario.operation,
        payload.len(),
        payload.size_bytes(),
        adapter.name()
    );
    let started_at = Utc::now();
    let start = Instant::now();
    let mut samples = Vec::new();
    let mut status = RunStatus::Complete;

    let mut index = 0;
    while scenario.workload.admits(index, start.elapsed()) {
        if cancel.is_cancelled() {
            status = RunStatus::Cancelled;
            break;
        }
        let dispatched = Instant::now() - start;
        let outcome = match scenario.operation {
            ScenarioOperation::Read => adapter.read_bulk(payload.len()).await,
            _ => adapter.write_bulk(payload.values()).await,
        };
        let completed = Instant::now() - start;
        match outcome {
            Ok(timed) => {
                debug!("bulk #{}: {:.3} ms", index, timed.latency_ms());
                samples.push(OperationSample::succeeded(index, dispatched, dispatched, completed, timed.latency));
            }
            Err(e) if e.is_fatal_to_run() => {
                error!("Bulk {} on {} aborted at call {}: {}", scenario.operation, adapter.name(), index, e);
                status = RunStatus::Incomplete(e.to_string());
                break;
            }
            Err(e) => {
                warn!("bulk #{} failed: {}", index, e);
                samples.push(OperationSample::failed(index, dispatched, dispatched, completed, &e));
            }
        }
        index += 1;
    }

    Ok(RunResult {
        scenario: scenario.clone(),
        adapter: adapter.name().to_string(),
        status,
        samples,
        started_at,
        wall_clock: start.elapsed(),
        payload_bytes: Some(payload.size_bytes()),
    })
}
