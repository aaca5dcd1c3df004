//! Paced single-variable loop.

use crate::pacer::RatePacer;
use crate::{OperationSample, RunResult, RunStatus, Scenario, ScenarioOperation};
use chrono::Utc;
use plcbench_common::{BenchError, PlcValue, Result, VariableKind};
use plcbench_protocol::ProtocolAdapter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deterministic value for iteration `index`: bools alternate starting with `true`,
/// integers count up and wrap every thousand operations.
pub fn value_for(kind: VariableKind, index: usize) -> Option<PlcValue> {
    match kind {
        VariableKind::Bool => Some(PlcValue::Bool(index % 2 == 0)),
        VariableKind::Int16 => Some(PlcValue::Int16((index % 1000) as i16)),
        VariableKind::Int32 => Some(PlcValue::Int32((index % 1000) as i32)),
        VariableKind::BulkBlock => None,
    }
}

/// Run a paced write (or read) scenario against a connected adapter.
///
/// Rejected operations become failed samples and the loop carries on. A connection
/// failure ends the run as `Incomplete`, keeping the samples gathered so far; the
/// failing call itself is not recorded. Cancellation is only observed while waiting
/// for the next slot.
pub async fn run_single(
    adapter: &mut dyn ProtocolAdapter,
    scenario: &Scenario,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    scenario.validate()?;
    if scenario.is_bulk() || scenario.is_mixed() {
        return Err(BenchError::config(format!(
            "{} is not a single-variable scenario",
            scenario
        )));
    }
    let rate = scenario
        .target_rate
        .ok_or_else(|| BenchError::config(format!("{} has no target rate", scenario)))?;

    let mut pacer = RatePacer::new(rate)?;
    info!(
        "Running {} against {} at {} ops/s ({:?} apart)",
        scenario.key(),
        adapter.name(),
        rate,
        pacer.interval()
    );
    let started_at = Utc::now();
    let start = pacer.start();
    let mut samples = Vec::new();
    let mut status = RunStatus::Complete;

    let mut index = 0;
    loop {
        let intended_offset = pacer.intended(index) - start;
        if !scenario.workload.admits(index, intended_offset) {
            break;
        }
        let dispatch = match pacer.wait(index, cancel).await {
            Ok(dispatch) => dispatch,
            Err(_) => {
                info!("{} cancelled after {} operations", scenario, samples.len());
                status = RunStatus::Cancelled;
                break;
            }
        };

        let outcome = match scenario.operation {
            ScenarioOperation::Write => {
                let value = value_for(scenario.kind, index).ok_or_else(|| {
                    BenchError::config(format!("no value generator for {}", scenario.kind))
                })?;
                adapter.write(&scenario.variable, value).await
            }
            ScenarioOperation::Read => adapter.read(&scenario.variable).await,
            ScenarioOperation::Mixed => {
                return Err(BenchError::config(format!("{} is a mixed cycle", scenario)));
            }
        };
        let completed = Instant::now();

        let intended = dispatch.intended - start;
        let dispatched = dispatch.actual - start;
        match outcome {
            Ok(timed) => {
                debug!("{} #{}: {:.3} ms", scenario, index, timed.latency_ms());
                samples.push(OperationSample::succeeded(
                    index,
                    intended,
                    dispatched,
                    completed - start,
                    timed.latency,
                ));
            }
            Err(e) if e.is_fatal_to_run() => {
                error!("{} aborted at operation {}: {}", scenario, index, e);
                status = RunStatus::Incomplete(e.to_string());
                break;
            }
            Err(e) => {
                warn!("{} #{} failed: {}", scenario, index, e);
                samples.push(OperationSample::failed(index, intended, dispatched, completed - start, &e));
            }
        }
        index += 1;
    }

    if pacer.slips() > 0 {
        debug!("{} fell behind schedule {} times", scenario, pacer.slips());
    }
    // a finished run owns its last slot, so the window closes at the next intended dispatch
    let mut wall_clock = start.elapsed();
    if status.is_complete() {
        wall_clock = wall_clock.max(pacer.intended(index) - start);
    }
    Ok(RunResult {
        scenario: scenario.clone(),
        adapter: adapter.name().to_string(),
        status,
        samples,
        started_at,
        wall_clock,
        payload_bytes: None,
    })
}
