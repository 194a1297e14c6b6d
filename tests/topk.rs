use gllm_wq_matmul::topk::{topk_last_dim, workspace_size, TopKElement, TopKError};
use half::{bf16, f16};
use proptest::prelude::*;

fn run<T: TopKElement + Default>(
    batch: usize,
    length: usize,
    k: usize,
    largest: bool,
    input: &[T],
) -> (Vec<T>, Vec<u32>) {
    let mut ws = vec![0u32; workspace_size::<T>(batch, length, k, largest).div_ceil(4)];
    let mut values = vec![T::default(); batch * k];
    let mut indices = vec![0u32; batch * k];
    topk_last_dim(
        batch,
        length,
        k,
        largest,
        input,
        &mut values,
        &mut indices,
        bytemuck::cast_slice_mut(&mut ws[..]),
    )
    .unwrap();
    (values, indices)
}

#[test]
fn topk_largest_per_row() {
    let input = [
        0.5f32, -1.0, 3.0, 2.0, //
        9.0, 8.0, 7.0, 6.0,
    ];
    let (values, indices) = run(2, 4, 2, true, &input);
    assert_eq!(values, vec![3.0, 2.0, 9.0, 8.0]);
    assert_eq!(indices, vec![2, 3, 0, 1]);
}

#[test]
fn topk_smallest() {
    let input = [4.0f32, 1.0, 3.0, 2.0];
    let (values, indices) = run(1, 4, 3, false, &input);
    assert_eq!(values, vec![1.0, 2.0, 3.0]);
    assert_eq!(indices, vec![1, 3, 2]);
}

#[test]
fn ties_keep_lower_index() {
    let input = [1.0f32, 5.0, 5.0, 0.0, 5.0];
    let (_, indices) = run(1, 5, 2, true, &input);
    assert_eq!(indices, vec![1, 2]);
    let (_, indices) = run(1, 5, 5, false, &input);
    assert_eq!(indices, vec![3, 0, 1, 2, 4]);
}

#[test]
fn half_precision_inputs() {
    let input: Vec<f16> = [0.25f32, 2.0, -3.0, 1.5].iter().map(|&v| f16::from_f32(v)).collect();
    let (values, indices) = run(1, 4, 2, true, &input);
    assert_eq!(indices, vec![1, 3]);
    assert_eq!(values[0], f16::from_f32(2.0));

    let input: Vec<bf16> = [0.25f32, 2.0, -3.0, 1.5].iter().map(|&v| bf16::from_f32(v)).collect();
    let (_, indices) = run(1, 4, 1, false, &input);
    assert_eq!(indices, vec![2]);
}

#[test]
fn buffer_and_workspace_checks() {
    let input = [1.0f32; 8];
    let mut values = [0.0f32; 2];
    let mut indices = [0u32; 2];

    let mut small = vec![0u32; 1];
    assert_eq!(
        topk_last_dim(1, 8, 2, true, &input, &mut values, &mut indices, bytemuck::cast_slice_mut(&mut small[..])),
        Err(TopKError::WorkspaceTooSmall { required: 32, provided: 4 })
    );

    let mut ws = vec![0u32; 16];
    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut ws[..]);
    assert_eq!(
        topk_last_dim(1, 8, 2, true, &input, &mut values, &mut indices, &mut bytes[1..]),
        Err(TopKError::MisalignedWorkspace)
    );
    assert!(matches!(
        topk_last_dim(2, 8, 2, true, &input, &mut values, &mut indices, bytes),
        Err(TopKError::BufferSize { name: "input", .. })
    ));
}

proptest! {
    /// Top-K agrees with a full stable sort of each row.
    #[test]
    fn prop_matches_stable_sort(
        batch in 1usize..4,
        length in 1usize..64,
        k_frac in 0.0f64..=1.0,
        largest in any::<bool>(),
        seed in prop::collection::vec(-8i32..8, 256),
    ) {
        let k = ((length as f64 * k_frac) as usize).clamp(1, length);
        let input: Vec<f32> = (0..batch * length).map(|i| seed[i % seed.len()] as f32 * 0.5).collect();
        let (values, indices) = run(batch, length, k, largest, &input);

        for b in 0..batch {
            let row = &input[b * length..(b + 1) * length];
            let mut order: Vec<usize> = (0..length).collect();
            order.sort_by(|&x, &y| {
                if largest { row[y].total_cmp(&row[x]) } else { row[x].total_cmp(&row[y]) }
            });
            for j in 0..k {
                prop_assert_eq!(indices[b * k + j] as usize, order[j]);
                prop_assert_eq!(values[b * k + j], row[order[j]]);
            }
        }
    }
}
