//! gllm-wq-matmul: autotuned weight-only quantized GEMM plugin.
//!
//! This crate provides the build-time and run-time halves of a weight-only
//! quantized matmul (INT8/INT4 weights, FP16/BF16 activations):
//! - **Tactic autotuning**: every candidate kernel configuration is measured
//!   per representative M, once per problem identity, and shared across
//!   plugins through an explicit [`ProfilerManager`]
//! - **Plugin lifecycle**: configure / workspace sizing / enqueue /
//!   serialize, with a lock-free, allocation-free `enqueue`
//! - **Tactic persistence**: profiled tables survive restarts through the
//!   plugin blob and an optional JSON tactic cache
//!
//! Kernels themselves live behind the [`KernelRunner`] trait.
//!
//! # Quick Start
//!
//! ```ignore
//! use gllm_wq_matmul::{PluginConfig, PluginField, ProfilerManager, WeightOnlyQuantMatmulPluginFactory};
//!
//! let manager = Arc::new(ProfilerManager::new(config.profiler.clone(), device));
//! let factory = WeightOnlyQuantMatmulPluginFactory::new(config, runners, manager);
//! let mut plugin = factory.create_plugin("fc1", &[
//!     PluginField::int32("weight_type_id", 2),
//!     PluginField::int32("type_id", 1),
//! ])?;
//! plugin.configure(&inputs, &outputs)?;
//! plugin.enqueue(&descs, &inputs_ptrs, &output_ptrs, workspace, stream.as_ref())?;
//! ```

pub mod autotuning;
pub mod codec;
pub mod error;
pub mod plugin;
pub mod runner;
pub mod runtime;
pub mod topk;
pub mod types;

pub use autotuning::{
    BenchConfig, BucketPolicy, GemmDims, GemmIdentity, MProfileTable, ProfileTarget, ProfilerConfig,
    ProfilerKey, ProfilerManager, Tactic, TacticCache, TacticProfiler,
};
pub use error::{KernelError, KernelResult, PluginError, PluginResult};
pub use plugin::{
    PluginConfig, PluginField, PluginFieldData, PluginState, WeightOnlyQuantMatmulPlugin,
    WeightOnlyQuantMatmulPluginFactory, PLUGIN_NAME, PLUGIN_VERSION,
};
pub use runner::{
    GemmArgs, GemmConfig, GemmProblem, KernelRunner, KernelVariant, RunnerFactory, SplitKStyle,
    TileConfig, WorkspaceSlice,
};
pub use runtime::{Device, DeviceBuffer, DevicePtr, HostDevice, HostStream, Stream};
pub use types::{DataType, DynamicTensorDesc, TensorDesc, TensorFormat, WeightType};
