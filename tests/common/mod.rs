//! Shared mocks: a kernel runner whose launches advance a virtual clock, so
//! profiling winners are deterministic, plus a device whose streams read
//! that clock.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gllm_wq_matmul::{
    DataType, Device, DeviceBuffer, DevicePtr, DynamicTensorDesc, GemmArgs, GemmConfig,
    GemmProblem, HostDevice, KernelError, KernelResult, KernelRunner, PluginConfig, PluginField,
    PluginResult, ProfilerConfig, ProfilerManager, RunnerFactory, SplitKStyle, Stream,
    TensorDesc, TileConfig, WeightOnlyQuantMatmulPluginFactory, WeightType, WorkspaceSlice,
};
use gllm_wq_matmul::autotuning::BenchConfig;

pub type CostFn = dyn Fn(&GemmConfig, GemmProblem) -> Option<u64> + Send + Sync;

#[derive(Debug, Clone, Default)]
pub struct VirtualClock(Arc<AtomicU64>);

impl VirtualClock {
    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockStream {
    clock: VirtualClock,
}

impl MockStream {
    pub fn new(clock: VirtualClock) -> Self {
        Self { clock }
    }
}

impl Stream for MockStream {
    fn synchronize(&self) -> KernelResult<()> {
        Ok(())
    }

    fn timestamp_ns(&self) -> KernelResult<u64> {
        Ok(self.clock.now())
    }
}

pub struct MockDevice {
    host: HostDevice,
    clock: VirtualClock,
    pub allocations: AtomicUsize,
}

impl MockDevice {
    pub fn new(sm: u32, clock: VirtualClock) -> Self {
        Self {
            host: HostDevice::new("mockgpu", sm),
            clock,
            allocations: AtomicUsize::new(0),
        }
    }
}

impl Device for MockDevice {
    fn name(&self) -> &str {
        self.host.name()
    }

    fn sm_version(&self) -> u32 {
        self.host.sm_version()
    }

    fn allocate(&self, bytes: usize) -> KernelResult<DeviceBuffer> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.host.allocate(bytes)
    }

    fn create_stream(&self) -> KernelResult<Arc<dyn Stream>> {
        Ok(Arc::new(MockStream::new(self.clock.clone())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Launch {
    pub tactic: GemmConfig,
    pub problem: GemmProblem,
    pub args: GemmArgs,
    pub workspace: WorkspaceSlice,
}

pub fn tiled_tactics() -> Vec<GemmConfig> {
    vec![
        GemmConfig::tiled(TileConfig::Tile16x128x64, 2),
        GemmConfig::tiled(TileConfig::Tile32x128x64, 3),
        GemmConfig::tiled(TileConfig::Tile64x128x64, 4),
        GemmConfig::tiled(TileConfig::Tile128x128x64, 4).with_split_k(SplitKStyle::SplitKSerial, 2),
    ]
}

/// Default cost model: a tile is cheapest when its M extent is the smallest
/// one covering the problem. The batched GEMV kernel wins below M=4.
pub fn tile_fit_cost(tactic: &GemmConfig, problem: GemmProblem) -> Option<u64> {
    if tactic.is_batched_gemv() {
        return Some(if problem.m < 4 { 10 } else { 10_000 });
    }
    let (tile_m, _, _) = tactic.tile.shape();
    let waves = problem.m.div_ceil(tile_m) as u64;
    Some(100 * waves + tile_m as u64)
}

pub struct MockRunner {
    clock: VirtualClock,
    tactics: Vec<GemmConfig>,
    cost: Box<CostFn>,
    gemv_from_sm: Option<u32>,
    default_tactic: Option<GemmConfig>,
    pub runs: AtomicUsize,
    pub launches: Mutex<Vec<Launch>>,
}

impl MockRunner {
    pub fn new(clock: VirtualClock) -> Self {
        Self {
            clock,
            tactics: tiled_tactics(),
            cost: Box::new(tile_fit_cost),
            gemv_from_sm: None,
            default_tactic: None,
            runs: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tactics(mut self, tactics: Vec<GemmConfig>) -> Self {
        self.tactics = tactics;
        self
    }

    /// `None` from the cost function makes the launch fail.
    pub fn with_cost(
        mut self,
        cost: impl Fn(&GemmConfig, GemmProblem) -> Option<u64> + Send + Sync + 'static,
    ) -> Self {
        self.cost = Box::new(cost);
        self
    }

    pub fn with_gemv_from_sm(mut self, sm: u32) -> Self {
        self.gemv_from_sm = Some(sm);
        self
    }

    pub fn with_default(mut self, tactic: GemmConfig) -> Self {
        self.default_tactic = Some(tactic);
        self
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn take_launches(&self) -> Vec<Launch> {
        std::mem::take(&mut *self.launches.lock().unwrap())
    }
}

impl KernelRunner for MockRunner {
    fn family(&self) -> &str {
        "mock"
    }

    fn supported_tactics(&self, _problem: GemmProblem) -> Vec<GemmConfig> {
        self.tactics.clone()
    }

    fn workspace_size(&self, m: usize, n: usize, _k: usize) -> usize {
        m * n * 4
    }

    fn supports_batched_gemv(&self, sm: u32) -> bool {
        self.gemv_from_sm.is_some_and(|min| sm >= min)
    }

    fn default_tactic(&self) -> Option<GemmConfig> {
        self.default_tactic
    }

    fn run(
        &self,
        tactic: &GemmConfig,
        problem: GemmProblem,
        args: &GemmArgs,
        workspace: WorkspaceSlice,
        _stream: &dyn Stream,
    ) -> KernelResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().unwrap().push(Launch {
            tactic: *tactic,
            problem,
            args: *args,
            workspace,
        });
        match (self.cost)(tactic, problem) {
            Some(ns) => {
                self.clock.advance(ns);
                Ok(())
            }
            None => Err(KernelError::Launch(format!("{tactic} faulted"))),
        }
    }
}

pub struct MockRunnerFactory {
    pub runner: Arc<MockRunner>,
}

impl RunnerFactory for MockRunnerFactory {
    fn family(&self) -> &str {
        "mock"
    }

    fn create(
        &self,
        _dtype: DataType,
        _weight: WeightType,
        _sm: u32,
    ) -> PluginResult<Arc<dyn KernelRunner>> {
        Ok(self.runner.clone())
    }
}

/// Everything a test needs to build plugins through the factory.
pub struct Harness {
    pub clock: VirtualClock,
    pub device: Arc<MockDevice>,
    pub runner: Arc<MockRunner>,
    pub manager: Arc<ProfilerManager<GemmConfig>>,
    pub factory: WeightOnlyQuantMatmulPluginFactory,
}

pub fn test_profiler_config() -> ProfilerConfig {
    ProfilerConfig {
        bench: BenchConfig {
            warmup_iters: 1,
            runs: 3,
        },
        ..ProfilerConfig::default()
    }
}

impl Harness {
    pub fn new(sm: u32, configure: impl FnOnce(MockRunner) -> MockRunner) -> Self {
        Self::with_config(
            sm,
            PluginConfig {
                profiler: test_profiler_config(),
                ..PluginConfig::default()
            },
            configure,
        )
    }

    pub fn with_config(
        sm: u32,
        config: PluginConfig,
        configure: impl FnOnce(MockRunner) -> MockRunner,
    ) -> Self {
        let clock = VirtualClock::default();
        let device = Arc::new(MockDevice::new(sm, clock.clone()));
        let runner = Arc::new(configure(MockRunner::new(clock.clone())));
        let manager = Arc::new(ProfilerManager::new(config.profiler.clone(), device.clone()));
        let factory = WeightOnlyQuantMatmulPluginFactory::new(
            config,
            Arc::new(MockRunnerFactory {
                runner: runner.clone(),
            }),
            manager.clone(),
        );
        Self {
            clock,
            device,
            runner,
            manager,
            factory,
        }
    }

    pub fn stream(&self) -> MockStream {
        MockStream::new(self.clock.clone())
    }
}

pub fn fields(weight: WeightType, dtype: DataType) -> Vec<PluginField> {
    vec![
        PluginField::int32("weight_type_id", i32::from(weight.id())),
        PluginField::int32("type_id", i32::from(dtype.tag())),
    ]
}

/// Optimization-profile descriptors for an `[m, k] x [k, n]` GEMM with `m`
/// ranging over `[min_m, max_m]`. `packed_n` is the stored weight width.
pub fn profile_io(
    dtype: DataType,
    min_m: i64,
    max_m: i64,
    k: i64,
    packed_n: i64,
    n: i64,
) -> (Vec<DynamicTensorDesc>, Vec<DynamicTensorDesc>) {
    let act = TensorDesc::new(vec![-1, k], dtype);
    let inputs = vec![
        DynamicTensorDesc::new(act, vec![min_m, k], vec![max_m, k]),
        DynamicTensorDesc::fixed(vec![k, packed_n], DataType::Int8),
        DynamicTensorDesc::fixed(vec![n], dtype),
    ];
    let out = TensorDesc::new(vec![-1, n], dtype);
    let outputs = vec![DynamicTensorDesc::new(out, vec![min_m, n], vec![max_m, n])];
    (inputs, outputs)
}

/// Concrete enqueue-time descriptors for one call.
pub fn call_descs(dtype: DataType, m: i64, k: i64, packed_n: i64, n: i64) -> Vec<TensorDesc> {
    vec![
        TensorDesc::new(vec![m, k], dtype),
        TensorDesc::new(vec![k, packed_n], DataType::Int8),
        TensorDesc::new(vec![n], dtype),
    ]
}

pub fn io_ptrs() -> ([DevicePtr; 3], [DevicePtr; 1], DevicePtr) {
    (
        [
            DevicePtr::new(0x1000),
            DevicePtr::new(0x2000),
            DevicePtr::new(0x3000),
        ],
        [DevicePtr::new(0x4000)],
        DevicePtr::new(0x8000),
    )
}
