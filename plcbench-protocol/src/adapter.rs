//! The uniform contract every protocol path implements.

use async_trait::async_trait;
use plcbench_common::{PlcValue, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Outcome of a single adapter call: the protocol response plus the latency the
/// adapter measured around its own round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timed {
    /// Protocol-specific response, opaque to the measurement loops
    pub response: serde_json::Value,
    pub latency: Duration,
}

impl Timed {
    pub fn new(response: serde_json::Value, latency: Duration) -> Self {
        Self { response, latency }
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// A communication path to the controller.
///
/// Adapters are driven by one measurement loop at a time. `write`, `read` and the
/// bulk calls report rejected or timed-out calls as `BenchError::Operation`; a lost
/// session is reported as `BenchError::Connection` and every later call fails the
/// same way until `connect` succeeds again.
#[async_trait]
pub trait ProtocolAdapter: Send {
    /// Stable identifier used in reports ("web_api", "opc_ua", "s7")
    fn name(&self) -> &str;

    /// Establish a session. Calling it on a connected adapter is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Release the session. Never fails once connected; disconnecting twice is a no-op.
    async fn disconnect(&mut self) -> Result<()>;

    async fn write(&mut self, variable: &str, value: PlcValue) -> Result<Timed>;

    async fn read(&mut self, variable: &str) -> Result<Timed>;

    /// Write a whole block of LTIME literals in as few round trips as the protocol allows
    async fn write_bulk(&mut self, values: &[String]) -> Result<Timed>;

    /// Read the first `entries` elements of the bulk block back
    async fn read_bulk(&mut self, entries: usize) -> Result<Timed>;

    fn is_connected(&self) -> bool;
}

/// Run `fut` and measure how long it took
pub async fn measure<F, T>(fut: F) -> (T, Duration)
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let output = fut.await;
    (output, start.elapsed())
}
