//! Tensor-level types exchanged with the host graph compiler.

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// Element type of a tensor, tagged the way the host engine numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    BFloat16,
}

impl DataType {
    /// Wire tag, also used as the `type_id` plugin attribute.
    pub fn tag(self) -> u8 {
        match self {
            Self::Float => 0,
            Self::Half => 1,
            Self::Int8 => 2,
            Self::Int32 => 3,
            Self::BFloat16 => 7,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Float),
            1 => Some(Self::Half),
            2 => Some(Self::Int8),
            3 => Some(Self::Int32),
            7 => Some(Self::BFloat16),
            _ => None,
        }
    }

    /// Size of one element in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Float | Self::Int32 => 4,
            Self::Half => std::mem::size_of::<half::f16>(),
            Self::BFloat16 => std::mem::size_of::<half::bf16>(),
            Self::Int8 => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "fp32",
            Self::Half => "fp16",
            Self::Int8 => "int8",
            Self::Int32 => "int32",
            Self::BFloat16 => "bf16",
        }
    }

    /// Activation types the weight-only GEMM accepts.
    pub fn is_weight_only_activation(self) -> bool {
        matches!(self, Self::Half | Self::BFloat16)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Storage width of the quantized weight matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WeightType {
    Int8,
    Int4,
}

impl WeightType {
    /// Numeric id used by the `weight_type_id` attribute and the serialized blob.
    pub fn id(self) -> u8 {
        match self {
            Self::Int8 => 1,
            Self::Int4 => 2,
        }
    }

    pub fn from_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Self::Int8),
            2 => Some(Self::Int4),
            _ => None,
        }
    }

    pub fn bits(self) -> usize {
        match self {
            Self::Int8 => 8,
            Self::Int4 => 4,
        }
    }

    /// Logical weight columns stored per packed int8 column.
    pub fn multiplier(self) -> usize {
        8 / self.bits()
    }

    /// Bytes occupied by a packed `k x n` weight matrix.
    pub fn packed_bytes(self, k: usize, n: usize) -> usize {
        (k * n * self.bits()).div_ceil(8)
    }
}

impl std::fmt::Display for WeightType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int8 => f.write_str("int8"),
            Self::Int4 => f.write_str("int4"),
        }
    }
}

/// Memory layout of a tensor. Only row-major linear is consumed by the GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorFormat {
    Linear,
    Chw32,
    Hwc8,
}

/// A concrete tensor description as seen at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDesc {
    /// Extents, outermost first. `-1` marks a dynamic extent.
    pub dims: Vec<i64>,
    pub dtype: DataType,
    pub format: TensorFormat,
}

impl TensorDesc {
    pub fn new(dims: Vec<i64>, dtype: DataType) -> Self {
        Self {
            dims,
            dtype,
            format: TensorFormat::Linear,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Last extent, the reduction dimension for an activation tensor.
    pub fn last_dim(&self) -> Option<i64> {
        self.dims.last().copied()
    }

    /// Product of every extent but the last, i.e. the flattened row count.
    pub fn rows(&self) -> PluginResult<usize> {
        leading_product(&self.dims)
    }
}

/// A tensor description with the min/max extents of its optimization profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicTensorDesc {
    pub desc: TensorDesc,
    pub min: Vec<i64>,
    pub max: Vec<i64>,
}

impl DynamicTensorDesc {
    pub fn new(desc: TensorDesc, min: Vec<i64>, max: Vec<i64>) -> Self {
        Self { desc, min, max }
    }

    /// A fully static tensor: min and max equal the given extents.
    pub fn fixed(dims: Vec<i64>, dtype: DataType) -> Self {
        Self {
            min: dims.clone(),
            max: dims.clone(),
            desc: TensorDesc::new(dims, dtype),
        }
    }
}

/// Product of all but the last extent. Fails on rank-0 or negative extents.
pub(crate) fn leading_product(dims: &[i64]) -> PluginResult<usize> {
    let Some((_, leading)) = dims.split_last() else {
        return Err(PluginError::ShapeMismatch("rank-0 tensor has no rows".into()));
    };
    leading.iter().try_fold(1usize, |acc, &d| {
        usize::try_from(d)
            .map(|d| acc * d)
            .map_err(|_| PluginError::ShapeMismatch(format!("extent {d} is not concrete")))
    })
}
