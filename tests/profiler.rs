mod common;

use std::sync::Arc;

use common::{fields, profile_io, tiled_tactics, Harness, MockRunner};
use gllm_wq_matmul::autotuning::{BucketPolicy, GemmDims, GemmIdentity, ProfilerConfig, TacticProfiler};
use gllm_wq_matmul::plugin::WeightOnlyGemmTarget;
use gllm_wq_matmul::{
    DataType, GemmConfig, KernelRunner, PluginConfig, PluginError, TileConfig, WeightType,
};
use rayon::prelude::*;

const K: i64 = 256;
const PACKED_N: i64 = 64;
const N: i64 = 128;

fn trials() -> usize {
    common::test_profiler_config().bench.trials()
}

#[test]
fn best_config_is_a_reported_candidate() {
    let h = Harness::new(80, |r| r);
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 512, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();

    let candidates = tiled_tactics();
    for m in 1..=600 {
        let tactic = plugin.tactic_for(m).unwrap();
        assert!(candidates.contains(&tactic), "m={m} picked {tactic}");
    }
    assert_eq!(plugin.tactic_for(1).unwrap().tile, TileConfig::Tile16x128x64);
    assert_eq!(plugin.tactic_for(64).unwrap().tile, TileConfig::Tile64x128x64);
    assert_eq!(plugin.tactic_for(512).unwrap().tile, TileConfig::Tile128x128x64);
}

#[test]
fn explicit_buckets_round_up_without_reprofiling() {
    let h = Harness::new(80, |r| r);
    let config = ProfilerConfig {
        buckets: BucketPolicy::Explicit(vec![1, 8, 32, 128]),
        ..common::test_profiler_config()
    };
    let profiler: TacticProfiler<GemmConfig> = TacticProfiler::new(config, h.device.clone());
    let runner: &dyn KernelRunner = h.runner.as_ref();
    let target = WeightOnlyGemmTarget::new(runner, DataType::Half, WeightType::Int4, false, 16);
    let identity = GemmIdentity::new(4096, 4096, DataType::Half, WeightType::Int4);
    let dims = GemmDims::new(1, 128, 4096, 4096).unwrap();

    profiler.set_limits(&dims);
    let table = profiler.profile_tactics(&target, &identity, &dims).unwrap();
    assert_eq!(table.buckets().collect::<Vec<_>>(), vec![1, 8, 32, 128]);
    for (_, tactic) in table.entries() {
        assert!(tactic.is_some());
    }

    let runs = h.runner.run_count();
    let at_16 = profiler.get_best_config(&identity, 16).unwrap();
    assert_eq!(Some(&at_16), table.lookup(32).and_then(|(_, t)| t));
    assert_eq!(at_16.tile, TileConfig::Tile32x128x64);
    assert_eq!(h.runner.run_count(), runs);
}

#[test]
fn same_identity_is_profiled_once() {
    let h = Harness::new(80, |r| r);
    let (inputs, outputs) = profile_io(DataType::Half, 1, 256, K, PACKED_N, N);

    let mut first = h
        .factory
        .create_plugin("layer0.fc1", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    first.configure(&inputs, &outputs).unwrap();
    let runs = h.runner.run_count();
    // 9 buckets (1..=256), 4 tactics, warmup + timed runs each
    assert_eq!(runs, 9 * 4 * trials());

    let mut second = h
        .factory
        .create_plugin("layer1.fc1", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    assert!(Arc::ptr_eq(first.profiler(), second.profiler()));
    second.configure(&inputs, &outputs).unwrap();
    assert_eq!(h.runner.run_count(), runs);
    assert_eq!(first.profiler().measurement_passes(), 1);
    assert_eq!(h.device.allocations.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[test]
fn concurrent_configure_agrees_on_one_table() {
    let h = Harness::new(80, |r| r);
    let (inputs, outputs) = profile_io(DataType::Half, 1, 256, K, PACKED_N, N);
    let mut plugins: Vec<_> = (0..16)
        .map(|i| {
            h.factory
                .create_plugin(&format!("layer{i}"), &fields(WeightType::Int4, DataType::Half))
                .unwrap()
        })
        .collect();

    plugins
        .par_iter_mut()
        .for_each(|p| p.configure(&inputs, &outputs).unwrap());

    assert_eq!(h.runner.run_count(), 9 * 4 * trials());
    assert_eq!(plugins[0].profiler().measurement_passes(), 1);
    for m in [1, 3, 17, 100, 256] {
        let expected = plugins[0].tactic_for(m).unwrap();
        assert!(plugins.iter().all(|p| p.tactic_for(m).unwrap() == expected));
    }
}

#[test]
fn failing_tactic_is_skipped() {
    let h = Harness::new(80, |r| {
        r.with_cost(|t, p| match t.tile {
            TileConfig::Tile16x128x64 => None,
            _ => common::tile_fit_cost(t, p),
        })
    });
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int8, DataType::BFloat16))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::BFloat16, 1, 16, K, N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    assert_eq!(plugin.tactic_for(1).unwrap().tile, TileConfig::Tile32x128x64);
}

#[test]
fn zero_tactics_fail_without_fallback() {
    let h = Harness::new(80, |r| r.with_tactics(Vec::new()));
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 32, K, PACKED_N, N);
    let err = plugin.configure(&inputs, &outputs).unwrap_err();
    assert!(matches!(err, PluginError::NoViableTactic { m: 1, .. }), "{err}");
    assert_eq!(h.runner.run_count(), 0);
    assert!(matches!(plugin.tactic_for(1), Err(PluginError::InvalidState(_))));
}

#[test]
fn zero_tactics_fall_back_to_default() {
    let fallback = GemmConfig::tiled(TileConfig::Tile64x128x64, 2);
    let h = Harness::new(80, |r| r.with_tactics(Vec::new()).with_default(fallback));
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 32, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    for m in [1, 7, 32, 1000] {
        assert_eq!(plugin.tactic_for(m).unwrap(), fallback);
    }
}

#[test]
fn batched_gemv_wins_only_small_m() {
    let h = Harness::new(80, |r| r.with_gemv_from_sm(75));
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    assert!(plugin.gemv_enabled());
    let (inputs, outputs) = profile_io(DataType::Half, 1, 64, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    assert!(plugin.identity().unwrap().gemv);

    for m in 1..4 {
        assert!(plugin.tactic_for(m).unwrap().is_batched_gemv(), "m={m}");
    }
    for m in 4..=64 {
        assert!(!plugin.tactic_for(m).unwrap().is_batched_gemv(), "m={m}");
    }
    // every m below 16 has its own bucket
    let table = plugin
        .profiler()
        .snapshot(&plugin.identity().unwrap())
        .unwrap();
    assert_eq!(
        table.buckets().collect::<Vec<_>>(),
        (1..16).chain([16, 32, 64]).collect::<Vec<_>>()
    );
}

#[test]
fn gemv_disabled_on_older_sm() {
    let h = Harness::new(70, |r| r.with_gemv_from_sm(75));
    let plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    assert!(!plugin.gemv_enabled());
}

#[test]
fn widened_range_profiles_new_buckets_only() {
    let h = Harness::new(80, |r| r);
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 16, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    let narrow_runs = h.runner.run_count();
    assert_eq!(narrow_runs, 5 * 4 * trials());

    // inside the known range: no measurement
    let (inputs, outputs) = profile_io(DataType::Half, 2, 8, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    assert_eq!(h.runner.run_count(), narrow_runs);
    assert_eq!(plugin.dims().unwrap().max_m, 16);

    let (inputs, outputs) = profile_io(DataType::Half, 1, 64, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();
    assert_eq!(h.runner.run_count() - narrow_runs, 2 * 4 * trials());
    assert_eq!(plugin.dims().unwrap().max_m, 64);
}

#[test]
fn workspace_size_is_a_pure_lookup() {
    let h = Harness::new(80, |r| r);
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 100, K, PACKED_N, N);
    plugin.configure(&inputs, &outputs).unwrap();

    let runs = h.runner.run_count();
    let allocations = h.device.allocations.load(std::sync::atomic::Ordering::SeqCst);
    let ws = plugin.workspace_size();
    for _ in 0..1000 {
        assert_eq!(plugin.workspace_size(), ws);
    }
    // profiled up to the rounded-up bucket 128
    assert_eq!(ws, 128 * N as usize * 4);
    assert_eq!(h.runner.run_count(), runs);
    assert_eq!(h.device.allocations.load(std::sync::atomic::Ordering::SeqCst), allocations);
}

#[test]
fn autotune_disabled_requires_default_tactic() {
    let config = PluginConfig {
        autotune: false,
        profiler: common::test_profiler_config(),
        tactic_cache: None,
    };
    let h = Harness::with_config(80, config, |r: MockRunner| r);
    let mut plugin = h
        .factory
        .create_plugin("fc", &fields(WeightType::Int4, DataType::Half))
        .unwrap();
    let (inputs, outputs) = profile_io(DataType::Half, 1, 16, K, PACKED_N, N);
    assert!(matches!(
        plugin.configure(&inputs, &outputs),
        Err(PluginError::InvalidConfig(_))
    ));
    assert_eq!(h.runner.run_count(), 0);
}
