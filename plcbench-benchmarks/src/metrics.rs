//! Statistics over a run's samples
//!
//! Latency percentiles use linear interpolation between order statistics and only
//! consider successful samples. An empty sample set has no percentiles rather than
//! zeros. The achieved rate divides successes by the run's wall clock, which for a
//! paced run ends no earlier than the close of its last slot.

use crate::RunResult;
use serde::{Deserialize, Serialize};

/// Percentile `p` (0..=100) of ascending `sorted` values.
///
/// Rank is `p / 100 * (n - 1)`; fractional ranks interpolate between neighbours.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    match sorted.len() {
        0 => None,
        1 => Some(sorted[0]),
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let fraction = rank - lower as f64;
            Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
        }
    }
}

/// Sample standard deviation (n - 1 denominator); needs at least two values
pub fn sample_stdev(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let squares: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((squares / (n - 1) as f64).sqrt())
}

/// Aggregated view of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    /// `None` when nothing succeeded or the run took no measurable time
    pub achieved_ops_per_sec: Option<f64>,
    pub target_ops_per_sec: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p90_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub stdev_ms: Option<f64>,
    pub success_count: usize,
    pub error_count: usize,
    pub wall_clock_secs: f64,
    /// Bulk runs only
    pub throughput_bytes_per_sec: Option<f64>,
}

impl SummaryStatistics {
    /// Whether any latency was measured
    pub fn has_data(&self) -> bool {
        self.success_count > 0
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

pub fn summarize(run: &RunResult) -> SummaryStatistics {
    let mut latencies: Vec<f64> = run
        .samples
        .iter()
        .filter(|s| s.success)
        .map(|s| s.latency_ms)
        .collect();
    latencies.sort_by(|a, b| a.total_cmp(b));

    let success_count = latencies.len();
    let error_count = run.samples.len() - success_count;

    let wall_clock_secs = run.wall_clock.as_secs_f64();
    let achieved_ops_per_sec = (success_count > 0 && wall_clock_secs > 0.0)
        .then(|| success_count as f64 / wall_clock_secs);
    let throughput_bytes_per_sec = match run.payload_bytes {
        Some(bytes) if wall_clock_secs > 0.0 => Some(bytes as f64 * success_count as f64 / wall_clock_secs),
        _ => None,
    };

    let mean_ms = if latencies.is_empty() {
        None
    } else {
        Some(latencies.iter().sum::<f64>() / success_count as f64)
    };

    SummaryStatistics {
        achieved_ops_per_sec,
        target_ops_per_sec: run.scenario.target_rate,
        p50_ms: percentile(&latencies, 50.0),
        p90_ms: percentile(&latencies, 90.0),
        p99_ms: percentile(&latencies, 99.0),
        mean_ms,
        min_ms: latencies.first().copied(),
        max_ms: latencies.last().copied(),
        stdev_ms: sample_stdev(&latencies),
        success_count,
        error_count,
        wall_clock_secs,
        throughput_bytes_per_sec,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{OperationSample, RunStatus, Scenario, ScenarioOperation, Workload};
    use chrono::Utc;
    use plcbench_common::{BenchError, Protocol, VariableKind};
    use proptest::prelude::*;
    use std::time::Duration;

    fn ok(index: usize, dispatch_ms: u64, latency_ms: u64) -> OperationSample {
        OperationSample::succeeded(
            index,
            Duration::from_millis(dispatch_ms),
            Duration::from_millis(dispatch_ms),
            Duration::from_millis(dispatch_ms + latency_ms),
            Duration::from_millis(latency_ms),
        )
    }

    fn run_with(samples: Vec<OperationSample>, wall_ms: u64, payload_bytes: Option<usize>) -> RunResult {
        RunResult {
            scenario: Scenario::paced(Protocol::S7, "x", VariableKind::Int16, 10.0, Workload::Count(10), ScenarioOperation::Write),
            adapter: "s7".to_string(),
            status: RunStatus::Complete,
            samples,
            started_at: Utc::now(),
            wall_clock: Duration::from_millis(wall_ms),
            payload_bytes,
        }
    }

    #[test]
    fn test_percentiles_of_one_to_ten() {
        let values: Vec<f64> = (1..=10).map(f64::from).collect();
        assert!((percentile(&values, 50.0).unwrap() - 5.5).abs() < 1e-9);
        assert!((percentile(&values, 90.0).unwrap() - 9.1).abs() < 1e-9);
        assert!((percentile(&values, 99.0).unwrap() - 9.91).abs() < 1e-9);
        assert_eq!(percentile(&values, 0.0), Some(1.0));
        assert_eq!(percentile(&values, 100.0), Some(10.0));
    }

    #[test]
    fn test_percentile_edge_cases() {
        assert_eq!(percentile(&[], 50.0), None);
        assert_eq!(percentile(&[7.25], 99.0), Some(7.25));
    }

    #[test]
    fn test_summary_separates_errors_from_latency() {
        let failure = OperationSample::failed(
            1,
            Duration::from_millis(100),
            Duration::from_millis(100),
            Duration::from_millis(5100),
            &BenchError::operation("write", "timed out"),
        );
        let samples = vec![ok(0, 0, 10), failure, ok(2, 5200, 30)];
        let stats = summarize(&run_with(samples, 5230, None));

        assert_eq!(stats.success_count, 2);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.p50_ms, Some(20.0));
        assert_eq!(stats.max_ms, Some(30.0));
        assert_eq!(stats.target_ops_per_sec, Some(10.0));
        // two successes over the 5.23 s wall clock
        assert!((stats.achieved_ops_per_sec.unwrap() - 2.0 / 5.23).abs() < 1e-9);
        assert!((stats.stdev_ms.unwrap() - 200f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.throughput_bytes_per_sec, None);
    }

    #[test]
    fn test_all_failed_run_has_no_data() {
        let failure = OperationSample::failed(
            0,
            Duration::ZERO,
            Duration::ZERO,
            Duration::from_millis(3),
            &BenchError::operation("write", "rejected"),
        );
        let stats = summarize(&run_with(vec![failure], 3, None));
        assert!(!stats.has_data());
        assert_eq!(stats.p50_ms, None);
        assert_eq!(stats.achieved_ops_per_sec, None);
        assert_eq!(stats.stdev_ms, None);
        assert_eq!(stats.error_rate(), 1.0);

        let empty = summarize(&run_with(Vec::new(), 0, None));
        assert_eq!(empty.p99_ms, None);
        assert_eq!(empty.achieved_ops_per_sec, None);
    }

    #[test]
    fn test_zero_wall_clock_has_no_rate() {
        // instantaneous calls: latencies exist but no time passed
        let samples = vec![ok(0, 0, 0), ok(1, 0, 0)];
        let stats = summarize(&run_with(samples, 0, None));
        assert!(stats.has_data());
        assert_eq!(stats.p50_ms, Some(0.0));
        assert_eq!(stats.achieved_ops_per_sec, None);
    }

    #[test]
    fn test_paced_run_rate_uses_full_slots() {
        // 10 operations at 10/s: last dispatch at 0.9 s, slots close at 1.0 s
        let samples = (0..10).map(|i| ok(i, i as u64 * 100, 2)).collect();
        let stats = summarize(&run_with(samples, 1000, None));
        assert!((stats.achieved_ops_per_sec.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_sample_stdev() {
        assert_eq!(sample_stdev(&[]), None);
        assert_eq!(sample_stdev(&[4.0]), None);
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((sample_stdev(&values).unwrap() - (32.0f64 / 7.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_bulk_throughput_counts_successful_calls() {
        let samples = vec![ok(0, 0, 100), ok(1, 100, 100), ok(2, 200, 100), ok(3, 300, 100)];
        let stats = summarize(&run_with(samples, 400, Some(800)));
        // 4 calls * 800 bytes over 0.4 s
        assert!((stats.throughput_bytes_per_sec.unwrap() - 8000.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn test_percentiles_are_ordered_and_bounded(
            mut values in proptest::collection::vec(0.0f64..10_000.0, 1..200),
        ) {
            values.sort_by(|a, b| a.total_cmp(b));
            let p50 = percentile(&values, 50.0).unwrap();
            let p90 = percentile(&values, 90.0).unwrap();
            let p99 = percentile(&values, 99.0).unwrap();
            prop_assert!(values[0] <= p50);
            prop_assert!(p50 <= p90);
            prop_assert!(p90 <= p99);
            prop_assert!(p99 <= values[values.len() - 1]);
        }
    }
}
