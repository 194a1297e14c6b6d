//! Problem dimensions and the profiling cache key.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{CodecError, Decoder, Encoder};
use crate::error::{PluginError, PluginResult};
use crate::types::{DataType, WeightType};

/// M range observed at build time plus the fixed weight extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GemmDims {
    pub min_m: usize,
    pub max_m: usize,
    pub n: usize,
    pub k: usize,
}

impl GemmDims {
    /// Encoded size: four `u64` fields.
    pub const ENCODED_LEN: usize = 4 * 8;

    pub fn new(min_m: usize, max_m: usize, n: usize, k: usize) -> PluginResult<Self> {
        if min_m > max_m {
            return Err(PluginError::InvalidConfig(format!(
                "min_m {min_m} exceeds max_m {max_m}"
            )));
        }
        if n == 0 || k == 0 {
            return Err(PluginError::ShapeMismatch(format!(
                "weight extents must be non-zero, got n={n} k={k}"
            )));
        }
        Ok(Self { min_m, max_m, n, k })
    }

    /// Whether `other` lies inside this M range with identical weight extents.
    pub fn contains(&self, other: &GemmDims) -> bool {
        self.n == other.n && self.k == other.k && self.min_m <= other.min_m && other.max_m <= self.max_m
    }

    /// Smallest range covering both. Weight extents are taken from `self`.
    pub fn union(&self, other: &GemmDims) -> GemmDims {
        GemmDims {
            min_m: self.min_m.min(other.min_m),
            max_m: self.max_m.max(other.max_m),
            n: self.n,
            k: self.k,
        }
    }

    pub fn encode(&self, enc: &mut Encoder) {
        enc.put_u64(self.min_m as u64);
        enc.put_u64(self.max_m as u64);
        enc.put_u64(self.n as u64);
        enc.put_u64(self.k as u64);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            min_m: dec.get_usize()?,
            max_m: dec.get_usize()?,
            n: dec.get_usize()?,
            k: dec.get_usize()?,
        })
    }
}

impl fmt::Display for GemmDims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m=[{}, {}] n={} k={}", self.min_m, self.max_m, self.n, self.k)
    }
}

/// Identifies one profiling problem independently of M.
///
/// Two plugins with equal identities can share profiled tactics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GemmIdentity {
    pub n: usize,
    pub k: usize,
    pub trans_a: bool,
    pub trans_b: bool,
    pub dtype: DataType,
    pub weight: WeightType,
    /// Batched GEMV candidates take part in profiling.
    pub gemv: bool,
}

impl GemmIdentity {
    pub fn new(n: usize, k: usize, dtype: DataType, weight: WeightType) -> Self {
        Self {
            n,
            k,
            trans_a: false,
            trans_b: false,
            dtype,
            weight,
            gemv: false,
        }
    }

    pub fn with_gemv(mut self, gemv: bool) -> Self {
        self.gemv = gemv;
        self
    }

    pub fn with_transpose(mut self, trans_a: bool, trans_b: bool) -> Self {
        self.trans_a = trans_a;
        self.trans_b = trans_b;
        self
    }

    /// Stable string form, used as the persistent cache key.
    pub fn cache_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GemmIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "n{}_k{}_{}{}_{}_{}",
            self.n,
            self.k,
            if self.trans_a { 't' } else { 'n' },
            if self.trans_b { 't' } else { 'n' },
            self.dtype,
            self.weight,
        )?;
        if self.gemv {
            f.write_str("_gemv")?;
        }
        Ok(())
    }
}
