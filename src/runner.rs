//! Kernel runner capability consumed by the profiler and the plugin.
//!
//! A runner wraps one family of weight-only GEMM kernels. The crate never
//! looks inside a kernel: it asks the runner which tactics exist for a
//! problem, how much workspace they need, and asks it to launch one.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::autotuning::profiler::Tactic;
use crate::codec::{CodecError, Decoder, Encoder};
use crate::error::{KernelResult, PluginResult};
use crate::runtime::{DevicePtr, Stream};
use crate::types::{DataType, WeightType};

/// CTA tile shape of a tiled GEMM kernel, `M x N x K`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileConfig {
    Tile16x128x64,
    Tile32x128x64,
    Tile64x128x64,
    Tile128x128x64,
    Tile128x256x64,
}

impl TileConfig {
    pub const ALL: [TileConfig; 5] = [
        Self::Tile16x128x64,
        Self::Tile32x128x64,
        Self::Tile64x128x64,
        Self::Tile128x128x64,
        Self::Tile128x256x64,
    ];

    fn tag(self) -> u8 {
        match self {
            Self::Tile16x128x64 => 0,
            Self::Tile32x128x64 => 1,
            Self::Tile64x128x64 => 2,
            Self::Tile128x128x64 => 3,
            Self::Tile128x256x64 => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    /// `(m, n, k)` extents of the tile.
    pub fn shape(self) -> (usize, usize, usize) {
        match self {
            Self::Tile16x128x64 => (16, 128, 64),
            Self::Tile32x128x64 => (32, 128, 64),
            Self::Tile64x128x64 => (64, 128, 64),
            Self::Tile128x128x64 => (128, 128, 64),
            Self::Tile128x256x64 => (128, 256, 64),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitKStyle {
    NoSplitK,
    SplitKSerial,
    StreamK,
}

impl SplitKStyle {
    fn tag(self) -> u8 {
        match self {
            Self::NoSplitK => 0,
            Self::SplitKSerial => 1,
            Self::StreamK => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::NoSplitK),
            1 => Some(Self::SplitKSerial),
            2 => Some(Self::StreamK),
            _ => None,
        }
    }
}

/// Kernel implementation a tactic launches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelVariant {
    /// Tiled tensor-core GEMM.
    Tiled,
    /// Batched GEMV kernel for small M.
    BatchedGemv,
}

/// One concrete kernel configuration. Opaque to the profiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmConfig {
    pub variant: KernelVariant,
    pub tile: TileConfig,
    pub split_k_style: SplitKStyle,
    pub split_k_factor: u32,
    pub stages: u32,
}

impl GemmConfig {
    pub fn tiled(tile: TileConfig, stages: u32) -> Self {
        Self {
            variant: KernelVariant::Tiled,
            tile,
            split_k_style: SplitKStyle::NoSplitK,
            split_k_factor: 1,
            stages,
        }
    }

    pub fn with_split_k(mut self, style: SplitKStyle, factor: u32) -> Self {
        self.split_k_style = style;
        self.split_k_factor = factor;
        self
    }

    /// The batched GEMV kernel, injected as a candidate when the device has one.
    pub fn batched_gemv() -> Self {
        Self {
            variant: KernelVariant::BatchedGemv,
            tile: TileConfig::Tile16x128x64,
            split_k_style: SplitKStyle::NoSplitK,
            split_k_factor: 1,
            stages: 1,
        }
    }

    pub fn is_batched_gemv(&self) -> bool {
        self.variant == KernelVariant::BatchedGemv
    }
}

impl fmt::Display for GemmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_batched_gemv() {
            return f.write_str("batched_gemv");
        }
        let (m, n, k) = self.tile.shape();
        write!(f, "tile={m}x{n}x{k} stages={}", self.stages)?;
        match self.split_k_style {
            SplitKStyle::NoSplitK => Ok(()),
            SplitKStyle::SplitKSerial => write!(f, " split_k={}", self.split_k_factor),
            SplitKStyle::StreamK => write!(f, " stream_k={}", self.split_k_factor),
        }
    }
}

impl Tactic for GemmConfig {
    fn encode(&self, enc: &mut Encoder) {
        enc.put_u8(match self.variant {
            KernelVariant::Tiled => 0,
            KernelVariant::BatchedGemv => 1,
        });
        enc.put_u8(self.tile.tag());
        enc.put_u8(self.split_k_style.tag());
        enc.put_u32(self.split_k_factor);
        enc.put_u32(self.stages);
    }

    fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        let variant = match dec.get_u8()? {
            0 => KernelVariant::Tiled,
            1 => KernelVariant::BatchedGemv,
            v => {
                return Err(CodecError::InvalidTag {
                    field: "kernel variant",
                    value: u64::from(v),
                })
            }
        };
        let tag = dec.get_u8()?;
        let tile = TileConfig::from_tag(tag).ok_or(CodecError::InvalidTag {
            field: "tile",
            value: u64::from(tag),
        })?;
        let tag = dec.get_u8()?;
        let split_k_style = SplitKStyle::from_tag(tag).ok_or(CodecError::InvalidTag {
            field: "split-k style",
            value: u64::from(tag),
        })?;
        Ok(Self {
            variant,
            tile,
            split_k_style,
            split_k_factor: dec.get_u32()?,
            stages: dec.get_u32()?,
        })
    }

    fn encoded_len(&self) -> usize {
        3 + 4 + 4
    }
}

/// GEMM extents: `[m, k] x [k, n] -> [m, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmProblem {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmProblem {
    pub fn new(m: usize, n: usize, k: usize) -> Self {
        Self { m, n, k }
    }
}

impl fmt::Display for GemmProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// Device pointers of one weight-only GEMM launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GemmArgs {
    pub activation: DevicePtr,
    pub weight: DevicePtr,
    pub scales: DevicePtr,
    pub output: DevicePtr,
}

/// Caller-owned scratch memory handed to a single launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkspaceSlice {
    pub ptr: DevicePtr,
    pub bytes: usize,
}

/// A family of weight-only GEMM kernels for one activation/weight type pair.
pub trait KernelRunner: Send + Sync {
    /// Kernel family name, part of the profiler sharing key.
    fn family(&self) -> &str;

    /// Candidate tactics for `problem`, in a stable order.
    fn supported_tactics(&self, problem: GemmProblem) -> Vec<GemmConfig>;

    /// Workspace bytes any supported tactic needs for the given extents.
    fn workspace_size(&self, m: usize, n: usize, k: usize) -> usize;

    /// Whether a batched GEMV kernel exists for the given SM version.
    fn supports_batched_gemv(&self, _sm: u32) -> bool {
        false
    }

    /// Fixed tactic used when profiling finds nothing viable.
    fn default_tactic(&self) -> Option<GemmConfig> {
        None
    }

    /// Submits one GEMM to `stream`. Must not block on the stream.
    fn run(
        &self,
        tactic: &GemmConfig,
        problem: GemmProblem,
        args: &GemmArgs,
        workspace: WorkspaceSlice,
        stream: &dyn Stream,
    ) -> KernelResult<()>;
}

/// Builds the runner matching a plugin's types and target architecture.
pub trait RunnerFactory: Send + Sync {
    fn family(&self) -> &str;

    fn create(
        &self,
        dtype: DataType,
        weight: WeightType,
        sm: u32,
    ) -> PluginResult<Arc<dyn KernelRunner>>;
}
