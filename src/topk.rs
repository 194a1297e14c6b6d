//! Top-K along the last dimension.
//!
//! Host reference of the sibling Top-K kernel. It follows the same
//! workspace-then-run contract as the GEMM plugin: the caller sizes scratch
//! with [`workspace_size`] and passes it to every [`topk_last_dim`] call.

use std::cmp::Ordering;

use half::{bf16, f16};
use thiserror::Error;

use crate::runtime::WORKSPACE_ALIGNMENT;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopKError {
    #[error("k={k} exceeds row length {length}")]
    InvalidK { k: usize, length: usize },
    #[error("{name} holds {actual} elements, expected {expected}")]
    BufferSize {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("workspace too small: need {required} bytes, got {provided}")]
    WorkspaceTooSmall { required: usize, provided: usize },
    #[error("workspace is not 4-byte aligned")]
    MisalignedWorkspace,
}

pub type TopKResult<T> = Result<T, TopKError>;

/// Element types Top-K is provided for.
pub trait TopKElement: Copy + Send + Sync {
    fn to_f32(self) -> f32;
}

impl TopKElement for f32 {
    fn to_f32(self) -> f32 {
        self
    }
}

impl TopKElement for f16 {
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }
}

impl TopKElement for bf16 {
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }
}

/// Scratch bytes for one call: a `u32` index per element of a row, reused
/// for every row.
pub fn workspace_size<T: TopKElement>(_batch: usize, length: usize, k: usize, _largest: bool) -> usize {
    if k == 0 {
        return 0;
    }
    (length * std::mem::size_of::<u32>()).div_ceil(WORKSPACE_ALIGNMENT) * WORKSPACE_ALIGNMENT
}

/// Selects the `k` largest (or smallest) values of each row of a
/// `[batch, length]` input. Rows of the outputs are ordered best first;
/// equal values keep the lower index first.
pub fn topk_last_dim<T: TopKElement>(
    batch: usize,
    length: usize,
    k: usize,
    largest: bool,
    input: &[T],
    out_values: &mut [T],
    out_indices: &mut [u32],
    workspace: &mut [u8],
) -> TopKResult<()> {
    if k > length {
        return Err(TopKError::InvalidK { k, length });
    }
    check_len("input", batch * length, input.len())?;
    check_len("out_values", batch * k, out_values.len())?;
    check_len("out_indices", batch * k, out_indices.len())?;
    if k == 0 || batch == 0 {
        return Ok(());
    }

    let required = length * std::mem::size_of::<u32>();
    if workspace.len() < required {
        return Err(TopKError::WorkspaceTooSmall {
            required,
            provided: workspace.len(),
        });
    }
    let scratch: &mut [u32] = bytemuck::try_cast_slice_mut(&mut workspace[..required])
        .map_err(|_| TopKError::MisalignedWorkspace)?;

    for b in 0..batch {
        let row = &input[b * length..(b + 1) * length];
        for (i, slot) in scratch.iter_mut().enumerate() {
            *slot = i as u32;
        }
        let better = |a: &u32, c: &u32| {
            let (va, vc) = (row[*a as usize].to_f32(), row[*c as usize].to_f32());
            let by_value = if largest { vc.total_cmp(&va) } else { va.total_cmp(&vc) };
            match by_value {
                Ordering::Equal => a.cmp(c),
                o => o,
            }
        };
        if k < length {
            scratch.select_nth_unstable_by(k - 1, better);
        }
        let top = &mut scratch[..k];
        top.sort_unstable_by(better);

        let out = b * k..(b + 1) * k;
        for ((v, i), &idx) in out_values[out.clone()]
            .iter_mut()
            .zip(&mut out_indices[out])
            .zip(top.iter())
        {
            *v = row[idx as usize];
            *i = idx;
        }
    }
    Ok(())
}

fn check_len(name: &'static str, expected: usize, actual: usize) -> TopKResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(TopKError::BufferSize {
            name,
            expected,
            actual,
        })
    }
}
