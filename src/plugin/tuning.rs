//! Profiling target for the weight-only GEMM: candidate tactics come from
//! the kernel runner, scratch holds one full problem at the largest M.

use crate::autotuning::profiler::ProfileTarget;
use crate::error::KernelResult;
use crate::runner::{GemmArgs, GemmConfig, GemmProblem, KernelRunner, WorkspaceSlice};
use crate::runtime::{partition_workspace, total_workspace_size, DevicePtr, Stream};
use crate::types::{DataType, WeightType};

const ACTIVATION: usize = 0;
const WEIGHTS: usize = 1;
const SCALES: usize = 2;
const OUTPUT: usize = 3;
const KERNEL_WORKSPACE: usize = 4;

pub struct WeightOnlyGemmTarget<'a> {
    runner: &'a dyn KernelRunner,
    dtype: DataType,
    weight: WeightType,
    gemv_enabled: bool,
    small_m_limit: usize,
}

impl<'a> WeightOnlyGemmTarget<'a> {
    pub fn new(
        runner: &'a dyn KernelRunner,
        dtype: DataType,
        weight: WeightType,
        gemv_enabled: bool,
        small_m_limit: usize,
    ) -> Self {
        Self {
            runner,
            dtype,
            weight,
            gemv_enabled,
            small_m_limit,
        }
    }

    /// Byte sizes of activation, packed weights, scales, output and kernel
    /// workspace for an `m x n x k` problem.
    fn region_sizes(&self, m: usize, n: usize, k: usize) -> [usize; 5] {
        let elem = self.dtype.size_bytes();
        [
            m * k * elem,
            self.weight.packed_bytes(k, n),
            n * elem,
            m * n * elem,
            self.runner.workspace_size(m, n, k),
        ]
    }
}

impl ProfileTarget for WeightOnlyGemmTarget<'_> {
    type Tactic = GemmConfig;

    fn tactics(&self, m: usize, n: usize, k: usize) -> Vec<GemmConfig> {
        let mut tactics = self.runner.supported_tactics(GemmProblem::new(m, n, k));
        if self.gemv_enabled && !tactics.iter().any(GemmConfig::is_batched_gemv) {
            tactics.push(GemmConfig::batched_gemv());
        }
        tactics
    }

    fn check_tactic(&self, m: usize, _n: usize, _k: usize, tactic: &GemmConfig) -> bool {
        !tactic.is_batched_gemv() || (self.gemv_enabled && m < self.small_m_limit)
    }

    fn tmp_size(&self, max_m: usize, n: usize, k: usize) -> usize {
        total_workspace_size(&self.region_sizes(max_m, n, k))
    }

    fn kernel_workspace_size(&self, max_m: usize, n: usize, k: usize) -> usize {
        self.runner.workspace_size(max_m, n, k)
    }

    fn run_tactic(
        &self,
        m: usize,
        n: usize,
        k: usize,
        tactic: &GemmConfig,
        scratch: DevicePtr,
        stream: &dyn Stream,
    ) -> KernelResult<()> {
        let sizes = self.region_sizes(m, n, k);
        let regions = partition_workspace(scratch, &sizes);
        let args = GemmArgs {
            activation: regions[ACTIVATION],
            weight: regions[WEIGHTS],
            scales: regions[SCALES],
            output: regions[OUTPUT],
        };
        let workspace = WorkspaceSlice {
            ptr: regions[KERNEL_WORKSPACE],
            bytes: sizes[KERNEL_WORKSPACE],
        };
        self.runner
            .run(tactic, GemmProblem::new(m, n, k), &args, workspace, stream)
    }
}
