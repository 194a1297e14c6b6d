//! Weight-only quantized matmul plugin.
//!
//! Computes `output = activation x dequant(weights, scales)` with weights
//! packed as INT8 or INT4. The plugin follows the host engine's lifecycle:
//!
//! ```text
//! construct / deserialize -> supports_format* -> configure -> workspace_size
//!     -> initialize? -> enqueue* -> serialize? -> destroy
//! ```
//!
//! `configure` is the only call that profiles. It snapshots the identity's
//! tactic table into the plugin, and `enqueue` reads only that snapshot.

pub mod factory;
pub mod tuning;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::autotuning::identity::{GemmDims, GemmIdentity};
use crate::autotuning::profiler::{MProfileTable, Tactic, TacticProfiler};
use crate::autotuning::{env_override, ProfilerConfig};
use crate::codec::{Decoder, Encoder, LEN_PREFIX_BYTES};
use crate::error::{PluginError, PluginResult};
use crate::runner::{GemmArgs, GemmConfig, GemmProblem, KernelRunner, WorkspaceSlice};
use crate::runtime::{DevicePtr, Stream};
use crate::types::{leading_product, DataType, DynamicTensorDesc, TensorDesc, TensorFormat, WeightType};

pub use factory::{PluginField, PluginFieldData, WeightOnlyQuantMatmulPluginFactory};
pub use tuning::WeightOnlyGemmTarget;

pub const PLUGIN_NAME: &str = "WeightOnlyQuantMatmul";
pub const PLUGIN_VERSION: &str = "1";

const NB_INPUTS: usize = 3;
const NB_OUTPUTS: usize = 1;

/// Plugin-wide settings shared by every instance a factory creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginConfig {
    /// Profile tactics at configure time. When off, the runner's default
    /// tactic is used for every M.
    pub autotune: bool,
    pub profiler: ProfilerConfig,
    /// Persistent tactic file. `None` disables persistence.
    pub tactic_cache: Option<PathBuf>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        PluginConfig {
            autotune: true,
            profiler: ProfilerConfig::default(),
            tactic_cache: None,
        }
    }
}

impl PluginConfig {
    /// Defaults overridden by `GLLM_WQ_AUTOTUNE` (0/1), `GLLM_WQ_TACTIC_CACHE`
    /// and the profiler variables read by [`ProfilerConfig::from_env`].
    pub fn from_env() -> Self {
        let mut config = PluginConfig {
            profiler: ProfilerConfig::from_env(),
            ..Self::default()
        };
        if let Some(v) = env_override::<u8>("GLLM_WQ_AUTOTUNE") {
            config.autotune = v != 0;
        }
        if let Ok(path) = std::env::var("GLLM_WQ_TACTIC_CACHE") {
            if !path.is_empty() {
                config.tactic_cache = Some(PathBuf::from(path));
            }
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Constructed,
    Configuring,
    Configured,
    Executable,
    Destroyed,
}

pub struct WeightOnlyQuantMatmulPlugin {
    dtype: DataType,
    weight: WeightType,
    runner: Arc<dyn KernelRunner>,
    profiler: Arc<TacticProfiler<GemmConfig>>,
    autotune: bool,
    gemv_enabled: bool,
    dims: Option<GemmDims>,
    table: Option<Arc<MProfileTable<GemmConfig>>>,
    fallback: Option<GemmConfig>,
    workspace_bytes: usize,
    state: PluginState,
}

impl fmt::Debug for WeightOnlyQuantMatmulPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeightOnlyQuantMatmulPlugin")
            .field("dtype", &self.dtype)
            .field("weight", &self.weight)
            .field("family", &self.runner.family())
            .field("gemv_enabled", &self.gemv_enabled)
            .field("dims", &self.dims)
            .field("workspace_bytes", &self.workspace_bytes)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl WeightOnlyQuantMatmulPlugin {
    /// Creates an unconfigured plugin. `sm` selects whether the batched GEMV
    /// kernel takes part in profiling.
    pub fn new(
        dtype: DataType,
        weight: WeightType,
        runner: Arc<dyn KernelRunner>,
        profiler: Arc<TacticProfiler<GemmConfig>>,
        sm: u32,
        autotune: bool,
    ) -> PluginResult<Self> {
        if !dtype.is_weight_only_activation() {
            return Err(PluginError::UnsupportedType(format!(
                "{dtype} activations are not supported, expected fp16 or bf16"
            )));
        }
        let gemv_enabled = runner.supports_batched_gemv(sm);
        let fallback = runner.default_tactic();
        Ok(Self {
            dtype,
            weight,
            runner,
            profiler,
            autotune,
            gemv_enabled,
            dims: None,
            table: None,
            fallback,
            workspace_bytes: 0,
            state: PluginState::Constructed,
        })
    }

    pub fn plugin_type(&self) -> &'static str {
        PLUGIN_NAME
    }

    pub fn plugin_version(&self) -> &'static str {
        PLUGIN_VERSION
    }

    pub fn nb_outputs(&self) -> usize {
        NB_OUTPUTS
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn weight_type(&self) -> WeightType {
        self.weight
    }

    pub fn dims(&self) -> Option<GemmDims> {
        self.dims
    }

    pub fn gemv_enabled(&self) -> bool {
        self.gemv_enabled
    }

    pub fn profiler(&self) -> &Arc<TacticProfiler<GemmConfig>> {
        &self.profiler
    }

    /// Identity this plugin profiles under, once its weight extents are known.
    pub fn identity(&self) -> Option<GemmIdentity> {
        self.dims.map(|d| self.identity_for(d.n, d.k))
    }

    fn identity_for(&self, n: usize, k: usize) -> GemmIdentity {
        GemmIdentity::new(n, k, self.dtype, self.weight).with_gemv(self.gemv_enabled)
    }

    fn is_configured(&self) -> bool {
        matches!(self.state, PluginState::Configured | PluginState::Executable)
    }

    /// An independent copy sharing the profiler and runner. The copy keeps
    /// the configuration but must be initialized again.
    pub fn clone_plugin(&self) -> Self {
        Self {
            dtype: self.dtype,
            weight: self.weight,
            runner: self.runner.clone(),
            profiler: self.profiler.clone(),
            autotune: self.autotune,
            gemv_enabled: self.gemv_enabled,
            dims: self.dims,
            table: self.table.clone(),
            fallback: self.fallback,
            workspace_bytes: self.workspace_bytes,
            state: match self.state {
                PluginState::Executable => PluginState::Configured,
                s => s,
            },
        }
    }

    // ── Shapes and formats ──────────────────────────────────────────────

    pub fn output_data_type(&self, index: usize) -> PluginResult<DataType> {
        if index >= NB_OUTPUTS {
            return Err(PluginError::ShapeMismatch(format!("no output at index {index}")));
        }
        Ok(self.dtype)
    }

    /// Output shape: the activation shape with its last extent replaced by
    /// `N`. Dynamic extents (`-1`) pass through.
    pub fn output_shape(&self, index: usize, inputs: &[TensorDesc]) -> PluginResult<Vec<i64>> {
        if index >= NB_OUTPUTS {
            return Err(PluginError::ShapeMismatch(format!("no output at index {index}")));
        }
        if inputs.len() != NB_INPUTS {
            return Err(PluginError::ShapeMismatch(format!(
                "expected {NB_INPUTS} inputs, got {}",
                inputs.len()
            )));
        }
        let (act, weights) = (&inputs[0], &inputs[1]);
        if act.rank() < 2 {
            return Err(PluginError::ShapeMismatch(format!(
                "activation rank {} is below 2",
                act.rank()
            )));
        }
        if weights.rank() != 2 {
            return Err(PluginError::ShapeMismatch(format!(
                "weights must be rank 2, got rank {}",
                weights.rank()
            )));
        }
        let k = act.dims[act.rank() - 1];
        if k >= 0 && weights.dims[0] >= 0 && k != weights.dims[0] {
            return Err(PluginError::ShapeMismatch(format!(
                "activation K={k} does not match weight rows {}",
                weights.dims[0]
            )));
        }
        if let Some(dims) = self.dims {
            if k >= 0 && k as usize != dims.k {
                return Err(PluginError::ShapeMismatch(format!(
                    "activation K={k} does not match configured K={}",
                    dims.k
                )));
            }
        }
        let n = match weights.dims[1] {
            d if d < 0 => -1,
            d => d * self.weight.multiplier() as i64,
        };
        let mut out = act.dims.clone();
        let last = out.len() - 1;
        out[last] = n;
        Ok(out)
    }

    /// Whether the tensor at `pos` (inputs then outputs) may use the type and
    /// layout proposed in `in_out`. Activation, scales and output share the
    /// plugin's dtype; weights are always packed INT8.
    pub fn supports_format(&self, pos: usize, in_out: &[TensorDesc]) -> bool {
        if in_out.len() != NB_INPUTS + NB_OUTPUTS || pos >= in_out.len() {
            return false;
        }
        let desc = &in_out[pos];
        if desc.format != TensorFormat::Linear {
            return false;
        }
        match pos {
            1 => desc.dtype == DataType::Int8,
            _ => desc.dtype == self.dtype,
        }
    }

    // ── Build time ──────────────────────────────────────────────────────

    /// Derives the GEMM extents from the optimization-profile bounds and
    /// profiles any M not yet covered.
    ///
    /// `N` and `K` are fixed by the first call. A later call whose M range
    /// leaves the known bounds widens them and profiles the new buckets.
    pub fn configure(
        &mut self,
        inputs: &[DynamicTensorDesc],
        outputs: &[DynamicTensorDesc],
    ) -> PluginResult<()> {
        match self.state {
            PluginState::Constructed | PluginState::Configured => {}
            s => {
                return Err(PluginError::InvalidState(format!(
                    "configure called in state {s:?}"
                )))
            }
        }
        let previous = self.state;
        self.state = PluginState::Configuring;
        let result = self.configure_inner(inputs, outputs);
        self.state = if result.is_ok() {
            PluginState::Configured
        } else {
            previous
        };
        result
    }

    fn configure_inner(
        &mut self,
        inputs: &[DynamicTensorDesc],
        outputs: &[DynamicTensorDesc],
    ) -> PluginResult<()> {
        if inputs.len() != NB_INPUTS || outputs.len() != NB_OUTPUTS {
            return Err(PluginError::ShapeMismatch(format!(
                "expected {NB_INPUTS} inputs and {NB_OUTPUTS} output, got {} and {}",
                inputs.len(),
                outputs.len()
            )));
        }
        let dims = self.dims_from_profile(&inputs[0], &inputs[1])?;
        let dims = match self.dims {
            Some(prev) if prev.n != dims.n || prev.k != dims.k => {
                return Err(PluginError::ShapeMismatch(format!(
                    "weight extents changed from n={} k={} to n={} k={}",
                    prev.n, prev.k, dims.n, dims.k
                )))
            }
            Some(prev) if prev.contains(&dims) => prev,
            Some(prev) => {
                log::debug!("widening M range {prev} to cover {dims}");
                prev.union(&dims)
            }
            None => dims,
        };
        self.prepare(dims)
    }

    fn dims_from_profile(
        &self,
        act: &DynamicTensorDesc,
        weights: &DynamicTensorDesc,
    ) -> PluginResult<GemmDims> {
        let min_m = leading_product(&act.min)?;
        let max_m = leading_product(&act.max)?;
        let k = act
            .max
            .last()
            .and_then(|&d| usize::try_from(d).ok())
            .ok_or_else(|| PluginError::ShapeMismatch("activation K is not concrete".into()))?;
        if act.min.last() != act.max.last() {
            return Err(PluginError::ShapeMismatch(
                "activation K must not vary across the profile".into(),
            ));
        }
        let [rows, cols] = weights.max[..] else {
            return Err(PluginError::ShapeMismatch(format!(
                "weights must be rank 2, got rank {}",
                weights.max.len()
            )));
        };
        if usize::try_from(rows).ok() != Some(k) {
            return Err(PluginError::ShapeMismatch(format!(
                "weight rows {rows} do not match activation K={k}"
            )));
        }
        let cols = usize::try_from(cols)
            .map_err(|_| PluginError::ShapeMismatch(format!("weight columns {cols} not concrete")))?;
        GemmDims::new(min_m, max_m, cols * self.weight.multiplier(), k)
    }

    /// Profiles (or re-reads) the tactic table for `dims` and sizes the
    /// workspace.
    fn prepare(&mut self, dims: GemmDims) -> PluginResult<()> {
        let identity = self.identity_for(dims.n, dims.k);
        let table = if self.autotune {
            self.profiler.set_limits(&dims);
            let target = WeightOnlyGemmTarget::new(
                self.runner.as_ref(),
                self.dtype,
                self.weight,
                self.gemv_enabled,
                self.profiler.config().small_m_limit,
            );
            match self.profiler.profile_tactics(&target, &identity, &dims) {
                Ok(table) => Some(table),
                Err(PluginError::NoViableTactic { m, .. }) if self.fallback.is_some() => {
                    log::warn!(
                        "{identity}: no viable tactic at m={m}, falling back to {}",
                        self.fallback_name()
                    );
                    self.profiler.snapshot(&identity)
                }
                Err(e) => return Err(e),
            }
        } else if self.fallback.is_some() {
            log::debug!("{identity}: autotuning disabled, using {}", self.fallback_name());
            None
        } else {
            return Err(PluginError::InvalidConfig(format!(
                "{identity}: autotuning is disabled and the {} runner has no default tactic",
                self.runner.family()
            )));
        };

        let table_ws = table.as_ref().map_or(0, |t| t.workspace_bytes());
        self.workspace_bytes = self
            .runner
            .workspace_size(dims.max_m, dims.n, dims.k)
            .max(table_ws);
        self.table = table;
        self.dims = Some(dims);
        Ok(())
    }

    fn fallback_name(&self) -> String {
        self.fallback
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".into())
    }

    /// Scratch bytes the host must pass to every `enqueue`. Pure lookup.
    pub fn workspace_size(&self) -> usize {
        self.workspace_bytes
    }

    // ── Runtime ─────────────────────────────────────────────────────────

    pub fn initialize(&mut self) -> PluginResult<()> {
        match self.state {
            PluginState::Configured => {
                self.state = PluginState::Executable;
                Ok(())
            }
            PluginState::Executable => Ok(()),
            s => Err(PluginError::InvalidState(format!(
                "initialize called in state {s:?}"
            ))),
        }
    }

    pub fn terminate(&mut self) {
        if self.state == PluginState::Executable {
            self.state = PluginState::Configured;
        }
    }

    pub fn destroy(mut self) {
        self.terminate();
        self.state = PluginState::Destroyed;
        log::debug!("destroying {PLUGIN_NAME} plugin ({:?})", self.identity());
    }

    /// Tactic `enqueue` would launch for `m`.
    pub fn tactic_for(&self, m: usize) -> PluginResult<GemmConfig> {
        let dims = match self.dims {
            Some(d) if self.is_configured() => d,
            _ => {
                return Err(PluginError::InvalidState(
                    "plugin has not been configured".into(),
                ))
            }
        };
        let identity = self.identity_for(dims.n, dims.k);
        match self.table.as_deref().and_then(|t| t.lookup(m)) {
            Some((_, Some(tactic))) => Ok(*tactic),
            Some((bucket, None)) => self
                .fallback
                .ok_or(PluginError::NoViableTactic { identity, m: bucket }),
            None => self.fallback.ok_or(PluginError::NotProfiled { identity }),
        }
    }

    /// Submits one GEMM to `stream`.
    ///
    /// Never profiles and never touches the shared profiler. Fails with
    /// [`PluginError::NotProfiled`] before any kernel launch if the plugin
    /// was not configured.
    pub fn enqueue(
        &self,
        input_desc: &[TensorDesc],
        inputs: &[DevicePtr],
        outputs: &[DevicePtr],
        workspace: DevicePtr,
        stream: &dyn Stream,
    ) -> PluginResult<()> {
        if input_desc.len() != NB_INPUTS || inputs.len() != NB_INPUTS || outputs.len() != NB_OUTPUTS {
            return Err(PluginError::ShapeMismatch(format!(
                "enqueue expects {NB_INPUTS} inputs and {NB_OUTPUTS} output"
            )));
        }
        let (act, weights) = (&input_desc[0], &input_desc[1]);
        let m = act.rows()?;
        let k = act
            .last_dim()
            .and_then(|d| usize::try_from(d).ok())
            .ok_or_else(|| PluginError::ShapeMismatch("activation K is not concrete".into()))?;
        let n = match weights.dims[..] {
            [_, cols] if cols >= 0 => cols as usize * self.weight.multiplier(),
            _ => {
                return Err(PluginError::ShapeMismatch(
                    "weights must be a concrete rank-2 tensor".into(),
                ))
            }
        };

        let dims = match self.dims {
            Some(d) if self.is_configured() => d,
            _ => {
                let identity = self.identity_for(n, k);
                log::error!("enqueue on unconfigured plugin for {identity}");
                return Err(PluginError::NotProfiled { identity });
            }
        };
        if dims.n != n || dims.k != k {
            return Err(PluginError::ShapeMismatch(format!(
                "enqueue with n={n} k={k} on a plugin configured for n={} k={}",
                dims.n, dims.k
            )));
        }
        if m == 0 {
            return Ok(());
        }

        let tactic = self.tactic_for(m).map_err(|e| {
            log::error!("enqueue m={m}: {e}");
            e
        })?;
        let args = GemmArgs {
            activation: inputs[0],
            weight: inputs[1],
            scales: inputs[2],
            output: outputs[0],
        };
        let slice = WorkspaceSlice {
            ptr: workspace,
            bytes: self.workspace_bytes,
        };
        self.runner
            .run(&tactic, GemmProblem::new(m, n, k), &args, slice, stream)?;
        Ok(())
    }

    // ── Serialization ───────────────────────────────────────────────────
    //
    // dtype:u8 | weight:u8 | gemv:u8 | dims_present:u8 | min_m,max_m,n,k:u64
    // | table | has_fallback:u8 [len:u32 tactic] | workspace:u64

    /// Exact length of [`WeightOnlyQuantMatmulPlugin::serialize`]'s output.
    pub fn serialization_size(&self) -> usize {
        let table = self
            .table
            .as_ref()
            .map_or(MProfileTable::<GemmConfig>::new().encoded_len(), |t| t.encoded_len());
        let fallback = self
            .fallback
            .as_ref()
            .map_or(0, |t| LEN_PREFIX_BYTES + t.encoded_len());
        4 + GemmDims::ENCODED_LEN + table + 1 + fallback + 8
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut enc = Encoder::with_capacity(self.serialization_size());
        enc.put_u8(self.dtype.tag());
        enc.put_u8(self.weight.id());
        enc.put_bool(self.gemv_enabled);
        enc.put_bool(self.dims.is_some());
        self.dims
            .unwrap_or(GemmDims {
                min_m: 0,
                max_m: 0,
                n: 0,
                k: 0,
            })
            .encode(&mut enc);
        match &self.table {
            Some(table) => table.encode(&mut enc),
            None => MProfileTable::<GemmConfig>::new().encode(&mut enc),
        }
        enc.put_bool(self.fallback.is_some());
        if let Some(t) = &self.fallback {
            enc.put_nested(|e| t.encode(e));
        }
        enc.put_u64(self.workspace_bytes as u64);
        enc.into_bytes()
    }

    /// Reads the type tags at the head of a serialized plugin.
    pub fn peek_types(blob: &[u8]) -> PluginResult<(DataType, WeightType)> {
        let mut dec = Decoder::new(blob);
        let tag = dec.get_u8()?;
        let dtype = DataType::from_tag(tag).ok_or_else(|| {
            PluginError::SerializationMismatch(format!("unknown data type tag {tag}"))
        })?;
        let id = dec.get_u8()?;
        let weight = WeightType::from_id(i64::from(id)).ok_or_else(|| {
            PluginError::SerializationMismatch(format!("unknown weight type id {id}"))
        })?;
        Ok((dtype, weight))
    }

    /// Rebuilds a plugin from [`WeightOnlyQuantMatmulPlugin::serialize`]'s
    /// output. An embedded table seeds `profiler`, which should not be shared
    /// with build-time plugins.
    ///
    /// The plugin comes back configured when it carries dims and either a
    /// table or a fallback tactic; otherwise it must be configured again.
    pub fn deserialize(
        blob: &[u8],
        runner: Arc<dyn KernelRunner>,
        profiler: Arc<TacticProfiler<GemmConfig>>,
        sm: u32,
        autotune: bool,
    ) -> PluginResult<Self> {
        let (dtype, weight) = Self::peek_types(blob)?;
        let mut dec = Decoder::new(blob);
        dec.get_u8()?;
        dec.get_u8()?;
        let gemv_enabled = dec.get_bool()?;
        let dims_present = dec.get_bool()?;
        let dims = GemmDims::decode(&mut dec)?;
        let mut table = MProfileTable::<GemmConfig>::decode(&mut dec)?;
        let fallback = if dec.get_bool()? {
            Some(dec.get_nested(GemmConfig::decode)?)
        } else {
            None
        };
        let workspace_bytes = dec.get_usize()?;
        dec.finish()?;

        let mut plugin = Self::new(dtype, weight, runner, profiler, sm, autotune)?;
        if plugin.gemv_enabled != gemv_enabled {
            return Err(PluginError::SerializationMismatch(format!(
                "blob was built with batched GEMV {}, runner reports {} for sm{sm}",
                if gemv_enabled { "enabled" } else { "disabled" },
                if plugin.gemv_enabled { "enabled" } else { "disabled" },
            )));
        }
        plugin.fallback = fallback.or(plugin.fallback);
        plugin.workspace_bytes = workspace_bytes;
        if !dims_present {
            if !table.is_empty() {
                return Err(PluginError::SerializationMismatch(
                    "tactic table present without dims".into(),
                ));
            }
            return Ok(plugin);
        }

        let dims = GemmDims::new(dims.min_m, dims.max_m, dims.n, dims.k)
            .map_err(|e| PluginError::SerializationMismatch(e.to_string()))?;
        let identity = plugin.identity_for(dims.n, dims.k);
        plugin.dims = Some(dims);
        plugin.profiler.set_limits(&dims);
        if !table.is_empty() {
            table.set_workspace_bytes(workspace_bytes);
            plugin.profiler.import(&identity, table);
            plugin.table = plugin.profiler.snapshot(&identity);
        }
        if plugin.table.is_some() || plugin.fallback.is_some() {
            plugin.state = PluginState::Configured;
        }
        Ok(plugin)
    }
}
