//! Mixed write/read cycles.

use crate::single_write::value_for;
use crate::{OperationSample, RunResult, RunStatus, Scenario};
use chrono::Utc;
use plcbench_common::{BenchError, Result};
use plcbench_protocol::{ProtocolAdapter, Timed};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Run a mixed scenario: each cycle writes every cycle variable in order, then reads
/// each of them back. Cycles run back to back.
///
/// One sample per cycle; its latency is the sum of the adapter latencies of the
/// cycle's calls. A rejected call ends that cycle as a failed sample. A lost
/// connection ends the run as `Incomplete`.
pub async fn run_mixed(
    adapter: &mut dyn ProtocolAdapter,
    scenario: &Scenario,
    cancel: &CancellationToken,
) -> Result<RunResult> {
    scenario.validate()?;
    if !scenario.is_mixed() {
        return Err(BenchError::config(format!("{} is not a mixed cycle", scenario)));
    }

    info!(
        "Running mixed cycle of {} variables against {}",
        scenario.cycle.len(),
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
        let outcome = cycle(adapter, scenario, index).await;
        let completed = Instant::now() - start;
        match outcome {
            Ok(latency) => {
                debug!("cycle #{}: {:?}", index, latency);
                samples.push(OperationSample::succeeded(index, dispatched, dispatched, completed, latency));
            }
            Err(e) if e.is_fatal_to_run() => {
                error!("Mixed cycle on {} aborted at cycle {}: {}", adapter.name(), index, e);
                status = RunStatus::Incomplete(e.to_string());
                break;
            }
            Err(e) => {
                warn!("cycle #{} failed: {}", index, e);
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
        payload_bytes: None,
    })
}

/// One cycle; stops at the first failing call
async fn cycle(adapter: &mut dyn ProtocolAdapter, scenario: &Scenario, index: usize) -> Result<Duration> {
    let mut total = Duration::ZERO;
    for variable in &scenario.cycle {
        let value = value_for(variable.kind, index)
            .ok_or_else(|| BenchError::config(format!("no value generator for {}", variable.kind)))?;
        let timed: Timed = adapter.write(&variable.name, value).await?;
        total += timed.latency;
    }
    for variable in &scenario.cycle {
        total += adapter.read(&variable.name).await?.latency;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::single_write::tests::{ScriptedAdapter, Step};
    use plcbench_common::{ErrorKind, PlcValue, Protocol, VariableKind, VariableSpec};

    fn cycle_of_three(repetitions: usize) -> Scenario {
        Scenario::mixed(
            Protocol::OpcUa,
            vec![
                VariableSpec::new("\"DB\".bool00", VariableKind::Bool),
                VariableSpec::new("\"DB\".int16_01", VariableKind::Int16),
                VariableSpec::new("\"DB\".int32_01", VariableKind::Int32),
            ],
            repetitions,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_writes_then_reads_every_variable() {
        let mut adapter = ScriptedAdapter::new(vec![Step::Ok(Duration::from_millis(2)); 12]);
        let run = run_mixed(&mut adapter, &cycle_of_three(2), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.samples.len(), 2);
        assert_eq!(adapter.calls.len(), 12);
        // three writes then three reads
        let pattern: Vec<bool> = adapter.calls[..6].iter().map(|(_, v)| v.is_some()).collect();
        assert_eq!(pattern, vec![true, true, true, false, false, false]);
        assert_eq!(adapter.calls[6].1, Some(PlcValue::Bool(false)));
        assert_eq!(adapter.calls[7].1, Some(PlcValue::Int16(1)));
        // six calls of 2 ms each
        assert!((run.samples[0].latency_ms - 12.0).abs() < 1e-6);
        assert_eq!(run.wall_clock, Duration::from_millis(24));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_call_fails_only_its_cycle() {
        let script = vec![Step::Ok(Duration::ZERO), Step::Reject];
        let mut adapter = ScriptedAdapter::new(script);
        let run = run_mixed(&mut adapter, &cycle_of_three(3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, RunStatus::Complete);
        assert_eq!(run.samples.len(), 3);
        assert_eq!(run.samples[0].error_kind, Some(ErrorKind::Operation));
        assert_eq!(run.success_count(), 2);
        // the failed cycle stopped after its second call
        assert_eq!(adapter.calls.len(), 2 + 6 + 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_ends_run() {
        let mut script = vec![Step::Ok(Duration::ZERO); 6];
        script.push(Step::Drop);
        let mut adapter = ScriptedAdapter::new(script);
        let run = run_mixed(&mut adapter, &cycle_of_three(5), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(run.status, RunStatus::Incomplete(_)));
        assert_eq!(run.samples.len(), 1);
    }

    #[tokio::test]
    async fn test_non_mixed_scenario_rejected() {
        let mut adapter = ScriptedAdapter::new(Vec::new());
        let bulk = Scenario::bulk(Protocol::S7, "b", 1);
        let err = run_mixed(&mut adapter, &bulk, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
