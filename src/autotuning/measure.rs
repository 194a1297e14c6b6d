//! Stream-timed measurement of a single tactic.
//!
//! Each measurement runs a fixed number of untimed warmup launches, then a
//! fixed number of timed launches. A timed launch is bracketed by stream
//! timestamps, so asynchronous kernels are measured to completion. There is
//! no wall-clock deadline: the trial count bounds the cost of a tactic.

use crate::error::KernelResult;
use crate::runtime::Stream;

/// Result of measuring one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BenchResult {
    /// Median launch latency in nanoseconds
    pub median_ns: f64,
    /// Fastest observed launch
    pub min_ns: f64,
    /// Slowest observed launch
    pub max_ns: f64,
    /// Number of timed launches
    pub samples: usize,
}

impl std::fmt::Display for BenchResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "median={:.1}us min={:.1}us max={:.1}us n={}",
            self.median_ns / 1000.0,
            self.min_ns / 1000.0,
            self.max_ns / 1000.0,
            self.samples,
        )
    }
}

/// Configuration for the measurement harness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenchConfig {
    /// Untimed launches before measuring
    pub warmup_iters: usize,
    /// Timed launches
    pub runs: usize,
}

impl Default for BenchConfig {
    fn default() -> Self {
        BenchConfig {
            warmup_iters: 10,
            runs: 10,
        }
    }
}

impl BenchConfig {
    /// Fewer launches, for quick builds and tests.
    pub fn fast() -> Self {
        BenchConfig {
            warmup_iters: 2,
            runs: 5,
        }
    }

    /// More launches, for noisy devices.
    pub fn precise() -> Self {
        BenchConfig {
            warmup_iters: 20,
            runs: 30,
        }
    }

    /// Total launches one measurement performs.
    pub fn trials(&self) -> usize {
        self.warmup_iters + self.runs
    }
}

/// Measures `launch` on `stream`.
///
/// `launch` receives the iteration index and must submit exactly one kernel.
/// The first launch error aborts the measurement.
pub fn bench_on_stream<F>(config: &BenchConfig, stream: &dyn Stream, mut launch: F) -> KernelResult<BenchResult>
where
    F: FnMut(usize) -> KernelResult<()>,
{
    for i in 0..config.warmup_iters {
        launch(i)?;
    }
    stream.synchronize()?;

    let runs = config.runs.max(1);
    let mut times_ns = Vec::with_capacity(runs);
    let mut prev = stream.timestamp_ns()?;
    for i in 0..runs {
        launch(config.warmup_iters + i)?;
        let now = stream.timestamp_ns()?;
        times_ns.push(now.saturating_sub(prev) as f64);
        prev = now;
    }

    Ok(compute_stats(&mut times_ns))
}

// ── Statistical analysis ────────────────────────────────────────────────

fn compute_stats(times: &mut [f64]) -> BenchResult {
    let n = times.len();
    if n == 0 {
        return BenchResult {
            median_ns: 0.0,
            min_ns: 0.0,
            max_ns: 0.0,
            samples: 0,
        };
    }

    times.sort_by(|a, b| a.total_cmp(b));

    let median = if n % 2 == 0 {
        (times[n / 2 - 1] + times[n / 2]) / 2.0
    } else {
        times[n / 2]
    };

    BenchResult {
        median_ns: median,
        min_ns: times[0],
        max_ns: times[n - 1],
        samples: n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KernelError;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Stream whose clock only moves when a launch advances it.
    #[derive(Debug, Default)]
    struct StepStream {
        now: AtomicU64,
    }

    impl Stream for StepStream {
        fn synchronize(&self) -> KernelResult<()> {
            Ok(())
        }

        fn timestamp_ns(&self) -> KernelResult<u64> {
            Ok(self.now.load(Ordering::SeqCst))
        }
    }

    #[test]
    fn test_median_of_timed_runs() {
        let stream = StepStream::default();
        let cfg = BenchConfig { warmup_iters: 2, runs: 5 };
        let costs = [1000, 1000, 500, 300, 900, 100, 700];
        let result = bench_on_stream(&cfg, &stream, |i| {
            stream.now.fetch_add(costs[i], Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        // warmup launches (1000, 1000) are not sampled
        assert_eq!(result.samples, 5);
        assert_eq!(result.median_ns, 500.0);
        assert_eq!(result.min_ns, 100.0);
        assert_eq!(result.max_ns, 900.0);
    }

    #[test]
    fn test_launch_error_aborts() {
        let stream = StepStream::default();
        let mut launches = 0;
        let err = bench_on_stream(&BenchConfig::fast(), &stream, |i| {
            launches += 1;
            if i == 3 {
                Err(KernelError::Launch("illegal address".into()))
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert!(matches!(err, KernelError::Launch(_)));
        assert_eq!(launches, 4);
    }

    #[test]
    fn test_even_sample_median() {
        let mut t = vec![4.0, 1.0, 3.0, 2.0];
        let r = compute_stats(&mut t);
        assert_eq!(r.median_ns, 2.5);
    }
}
