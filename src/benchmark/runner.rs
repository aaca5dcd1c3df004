//! Benchmark orchestrator
//!
//! Runs adapters strictly one after another. Each adapter is connected, driven through
//! its scenarios with a cooldown in between, and disconnected before the next adapter
//! starts. A run that loses its connection is kept as `Incomplete` and the adapter is
//! reconnected for the next scenario; if that fails the remaining scenarios are
//! recorded as failed.

use super::{BenchmarkSession, ProgressEvent, ProgressSender, SessionStatus};
use indexmap::IndexMap;
use std::collections::HashSet;
use plcbench_benchmarks::{run_bulk, run_mixed, run_single, BulkPayload, RunResult, RunStatus, Scenario};
use plcbench_common::{BenchError, BenchSettings, Result};
use plcbench_protocol::{create_adapter, ProtocolAdapter};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Registered {
    adapter: Box<dyn ProtocolAdapter>,
    scenarios: Vec<Scenario>,
}

pub struct Orchestrator {
    adapters: IndexMap<String, Registered>,
    cooldown: Duration,
    payload: BulkPayload,
    progress: Option<ProgressSender>,
}

impl Orchestrator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            adapters: IndexMap::new(),
            cooldown,
            payload: BulkPayload::standard(),
            progress: None,
        }
    }

    /// One adapter per enabled protocol, each with the full scenario matrix
    pub fn from_settings(settings: &BenchSettings) -> Result<Self> {
        settings.validate()?;
        let mut orchestrator = Self::new(settings.cooldown());
        for protocol in &settings.scenarios.protocols {
            let scenarios = Scenario::expand(&settings.scenarios, *protocol);
            orchestrator.register(create_adapter(*protocol, settings), scenarios)?;
        }
        Ok(orchestrator)
    }

    /// Register an adapter with the scenarios to run against it. Scenario keys must be
    /// unique per adapter since results are looked up by key.
    pub fn register(&mut self, adapter: Box<dyn ProtocolAdapter>, scenarios: Vec<Scenario>) -> Result<()> {
        let mut keys = HashSet::new();
        for scenario in &scenarios {
            scenario.validate()?;
            if !keys.insert(scenario.key()) {
                return Err(BenchError::config(format!(
                    "scenario key '{}' used twice for {}",
                    scenario.key(),
                    adapter.name()
                )));
            }
        }
        let name = adapter.name().to_string();
        if self.adapters.contains_key(&name) {
            return Err(BenchError::config(format!("adapter '{}' registered twice", name)));
        }
        debug!("Registered adapter {} with {} scenarios", name, scenarios.len());
        self.adapters.insert(name, Registered { adapter, scenarios });
        Ok(())
    }

    pub fn with_progress(mut self, sender: ProgressSender) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn adapter_names(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn scenario_count(&self) -> usize {
        self.adapters.values().map(|r| r.scenarios.len()).sum()
    }

    /// Run every registered adapter. Cancellation is observed while pacing, between
    /// bulk transfers or cycles and during the cooldown, never inside a protocol call.
    /// The partial session is still returned.
    pub async fn run(&mut self, cancel: &CancellationToken) -> BenchmarkSession {
        let mut session = BenchmarkSession::new();
        info!(
            "Session {}: {} adapters, {} scenarios",
            session.id,
            self.adapters.len(),
            self.scenario_count()
        );

        for (name, registered) in self.adapters.iter_mut() {
            if cancel.is_cancelled() {
                break;
            }
            emit(
                &self.progress,
                ProgressEvent::AdapterStarted {
                    adapter: name.clone(),
                    scenarios: registered.scenarios.len(),
                },
            );
            run_adapter(
                name,
                registered,
                &self.payload,
                self.cooldown,
                &self.progress,
                cancel,
                &mut session,
            )
            .await;
            emit(&self.progress, ProgressEvent::AdapterFinished { adapter: name.clone() });
        }

        let status = if cancel.is_cancelled() {
            SessionStatus::Cancelled
        } else {
            SessionStatus::Completed
        };
        session.finish(status);
        info!("Session {} {} with {} runs", session.id, status, session.runs.len());
        session
    }
}

async fn run_adapter(
    name: &str,
    registered: &mut Registered,
    payload: &BulkPayload,
    cooldown: Duration,
    progress: &Option<ProgressSender>,
    cancel: &CancellationToken,
    session: &mut BenchmarkSession,
) {
    let adapter = registered.adapter.as_mut();
    let scenarios = &registered.scenarios;

    info!("Connecting {}", name);
    if let Err(e) = adapter.connect().await {
        error!("{} could not connect: {}", name, e);
        for scenario in scenarios {
            session.record(RunResult::failed(scenario.clone(), name, e.to_string()));
        }
        // a half-open session may still hold resources
        let _ = adapter.disconnect().await;
        return;
    }

    let mut needs_reconnect = false;
    for (position, scenario) in scenarios.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        if position > 0 && !cooldown.is_zero() && !pause(cooldown, cancel).await {
            break;
        }

        if needs_reconnect {
            info!("Reconnecting {} after lost session", name);
            let _ = adapter.disconnect().await;
            if let Err(e) = adapter.connect().await {
                error!("{} could not reconnect: {}", name, e);
                for remaining in &scenarios[position..] {
                    session.record(RunResult::failed(remaining.clone(), name, e.to_string()));
                }
                break;
            }
            needs_reconnect = false;
        }

        emit(
            progress,
            ProgressEvent::ScenarioStarted {
                adapter: name.to_string(),
                scenario: scenario.key(),
                position: position + 1,
                total: scenarios.len(),
            },
        );
        let outcome = if scenario.is_mixed() {
            run_mixed(adapter, scenario, cancel).await
        } else if scenario.is_bulk() {
            run_bulk(adapter, scenario, payload, cancel).await
        } else {
            run_single(adapter, scenario, cancel).await
        };
        let run = match outcome {
            Ok(run) => run,
            Err(e) => {
                warn!("{} on {} could not run: {}", scenario, name, e);
                RunResult::failed(scenario.clone(), name, e.to_string())
            }
        };

        if let RunStatus::Incomplete(reason) = &run.status {
            warn!("{} on {} incomplete after {} samples: {}", scenario, name, run.samples.len(), reason);
            needs_reconnect = true;
        }
        emit(
            progress,
            ProgressEvent::ScenarioFinished {
                adapter: name.to_string(),
                scenario: scenario.key(),
                status: run.status.clone(),
                samples: run.samples.len(),
            },
        );
        session.record(run);
    }

    if let Err(e) = adapter.disconnect().await {
        warn!("{} disconnect failed: {}", name, e);
    }
    info!("Disconnected {}", name);
}

/// Cooldown between runs; false when cancelled during the pause
async fn pause(cooldown: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(cooldown) => true,
    }
}

fn emit(progress: &Option<ProgressSender>, event: ProgressEvent) {
    if let Some(sender) = progress {
        let _ = sender.send(event);
    }
}
