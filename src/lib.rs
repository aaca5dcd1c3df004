//! plcbench - latency and throughput comparison of PLC access paths
//!
//! This is the main crate that ties the protocol adapters and measurement loops together
//! into benchmark sessions and writes their results.

pub mod benchmark;

pub use plcbench_benchmarks as benchmarks;
pub use plcbench_common as common;
pub use plcbench_protocol as protocol;

/// Re-export the types most callers need
pub mod prelude {
    pub use crate::benchmark::{
        BenchmarkSession, JsonDirectorySink, MemorySink, Orchestrator, ProgressEvent, ResultSink,
        SessionStatus,
    };
    pub use plcbench_benchmarks::{
        BulkPayload, ComparisonReport, RunResult, RunStatus, Scenario, SummaryStatistics,
    };
    pub use plcbench_common::{BenchError, BenchSettings, Protocol, Result};
    pub use plcbench_protocol::{create_adapter, ProtocolAdapter};
}
