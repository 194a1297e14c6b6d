//! Autotuning for weight-only GEMM tactics.
//!
//! Picks the fastest kernel configuration per problem by measuring every
//! candidate on the target device at build time, and keeps the result so
//! later plugins with the same identity reuse it.
//!
//! # Architecture
//!
//! ```text
//! measure   -- stream-timed benchmark harness
//! identity  -- GemmDims and the GemmIdentity cache key
//! profiler  -- single-flight per-identity tactic tables
//! manager   -- build-session registry of shared profilers
//! cache     -- persistent tactic file (JSON)
//! ```

pub mod cache;
pub mod identity;
pub mod manager;
pub mod measure;
pub mod profiler;

use std::collections::BTreeSet;
use std::str::FromStr;

pub use cache::TacticCache;
pub use identity::{GemmDims, GemmIdentity};
pub use manager::{ProfilerKey, ProfilerManager};
pub use measure::{BenchConfig, BenchResult};
pub use profiler::{MProfileTable, ProfileTarget, Tactic, TacticProfiler};

/// Upper bound on profiled M.
pub const DEFAULT_MAX_PROFILE_M: usize = 8192;

/// M below which the batched GEMV kernel is a candidate.
pub const DEFAULT_SMALL_M_LIMIT: usize = 16;

/// Which M values are measured for a `[min_m, max_m]` range.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BucketPolicy {
    /// Powers of two from `next_pow2(min_m)` up to `next_pow2(max_m)`.
    #[default]
    PowersOfTwo,
    /// A fixed set, clipped to the range. The capped `max_m` is always added.
    Explicit(Vec<usize>),
}

/// Profiler tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfilerConfig {
    pub bench: BenchConfig,
    pub max_profile_m: usize,
    pub small_m_limit: usize,
    pub buckets: BucketPolicy,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        ProfilerConfig {
            bench: BenchConfig::default(),
            max_profile_m: DEFAULT_MAX_PROFILE_M,
            small_m_limit: DEFAULT_SMALL_M_LIMIT,
            buckets: BucketPolicy::PowersOfTwo,
        }
    }
}

impl ProfilerConfig {
    /// Quick profiling, for tests and interactive builds.
    pub fn fast() -> Self {
        ProfilerConfig {
            bench: BenchConfig::fast(),
            ..Self::default()
        }
    }

    /// Thorough profiling, for deployment builds.
    pub fn precise() -> Self {
        ProfilerConfig {
            bench: BenchConfig::precise(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `GLLM_WQ_PROFILE_WARMUP`, `GLLM_WQ_PROFILE_RUNS`
    /// and `GLLM_WQ_MAX_PROFILE_M`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_override("GLLM_WQ_PROFILE_WARMUP") {
            config.bench.warmup_iters = v;
        }
        if let Some(v) = env_override("GLLM_WQ_PROFILE_RUNS") {
            config.bench.runs = v;
        }
        if let Some(v) = env_override::<usize>("GLLM_WQ_MAX_PROFILE_M") {
            config.max_profile_m = v.max(1);
        }
        config
    }

    /// Representative M values profiled for `dims`, ascending.
    ///
    /// With `gemv` set, every M below `small_m_limit` is profiled
    /// individually since the GEMV kernel's cost is not monotone there.
    pub fn profile_buckets(&self, dims: &GemmDims, gemv: bool) -> Vec<usize> {
        let max_m = dims
            .max_m
            .max(1)
            .next_power_of_two()
            .min(self.max_profile_m.max(1));
        let start = dims.min_m.max(1).next_power_of_two().min(max_m);

        let mut buckets = BTreeSet::new();
        match &self.buckets {
            BucketPolicy::PowersOfTwo => {
                if gemv {
                    buckets.extend(start..self.small_m_limit.min(max_m));
                }
                let mut m = start;
                while m < max_m {
                    buckets.insert(m);
                    m *= 2;
                }
            }
            BucketPolicy::Explicit(list) => {
                buckets.extend(list.iter().copied().filter(|&m| m >= 1 && m <= max_m));
            }
        }
        buckets.insert(max_m);
        buckets.into_iter().collect()
    }
}

/// Parses an environment override. Unset variables yield `None`;
/// unparseable ones are ignored with a warning.
pub(crate) fn env_override<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring {name}={raw:?}: not a valid value");
            None
        }
    }
}
