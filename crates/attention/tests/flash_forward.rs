mod common;

use attention::dropout::{philox_increment, DropoutParams};
use attention::flash::{
    FixedTiles, FlashAttention, FlashOutput, FlashParams, FlashProblem, FlashStrategy,
    FlashTileConfig,
};
use attention::interop::{AttentionShape, QkvLayout};
use attention::masks::AlibiSlopes;
use attention::reference::{dense_flash_forward, DenseAttention};
use attention::AttentionError;
use candle_core::{DType, Device, Tensor};
use common::{max_abs_diff, tensor, values};
use proptest::prelude::*;
use runtime::{DeviceProfile, PhiloxReservation, PhiloxState, SplitKvPolicy};
use static_assertions::assert_impl_all;

assert_impl_all!(FlashAttention: Send, Sync);
assert_impl_all!(attention::TiledAttention: Send, Sync);
assert_impl_all!(FlashOutput: Send, Sync);

const TOL: f32 = 1e-4;

struct Case {
    name: &'static str,
    batch: usize,
    q_len: usize,
    kv_len: usize,
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    params: FlashParams,
}

impl Case {
    fn inputs(&self, seed: u64) -> (Tensor, Tensor, Tensor) {
        let q = tensor((self.batch, self.q_len, self.heads, self.head_dim), seed);
        let k = tensor((self.batch, self.kv_len, self.kv_heads, self.head_dim), seed + 1);
        let v = tensor((self.batch, self.kv_len, self.kv_heads, self.head_dim), seed + 2);
        (q, k, v)
    }
}

fn device() -> DeviceProfile {
    DeviceProfile::host().with_compute_units(8)
}

fn forward(q: &Tensor, k: &Tensor, v: &Tensor, params: &FlashParams, seed: u64) -> FlashOutput {
    FlashAttention::new(device())
        .forward(q, k, v, params, &PhiloxState::new(seed))
        .unwrap()
}

fn forward_with_tiles(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    params: &FlashParams,
    tiles: FlashTileConfig,
    seed: u64,
) -> FlashOutput {
    FlashAttention::with_strategy(FixedTiles(tiles), device())
        .forward(q, k, v, params, &PhiloxState::new(seed))
        .unwrap()
}

/// Dense oracle with the dropout stream a fresh `PhiloxState::new(seed)` would hand out.
fn dense(q: &Tensor, k: &Tensor, v: &Tensor, params: &FlashParams, seed: u64) -> DenseAttention {
    let shape = AttentionShape::from_qkv(QkvLayout::SeqMajor, q, k, v).unwrap();
    let (batch, heads) = (shape.batch, shape.num_heads);
    let problem = FlashProblem::resolve(shape, params).unwrap();
    let alibi = params
        .alibi_slopes
        .as_ref()
        .map(|t| AlibiSlopes::from_tensor(t, batch, heads).unwrap());
    let dropout = problem.is_dropout().then(|| {
        let reservation = PhiloxReservation {
            seed,
            offset: 0,
            len: philox_increment(batch, heads),
        };
        DropoutParams::new(problem.dropout_p, reservation).unwrap()
    });
    dense_flash_forward(q, k, v, &problem, alibi.as_ref(), dropout.as_ref()).unwrap()
}

fn assert_close(out: &FlashOutput, expected: &DenseAttention, tol: f32, label: &str) {
    let diff = max_abs_diff(&values(&out.output), &expected.output);
    assert!(diff < tol, "{label}: output diverged by {diff}");
    let diff = max_abs_diff(&values(&out.lse), &expected.lse);
    assert!(diff < tol, "{label}: lse diverged by {diff}");
}

fn alibi_tensor(heads: usize) -> Tensor {
    let slopes: Vec<f32> = (1..=heads).map(|i| 0.5f32.powi(i as i32)).collect();
    Tensor::from_vec(slopes, (heads,), &Device::Cpu).unwrap()
}

fn masking_cases() -> Vec<Case> {
    let never = |p: FlashParams| p.with_split_kv(SplitKvPolicy::Never);
    vec![
        Case {
            name: "plain",
            batch: 2,
            q_len: 70,
            kv_len: 90,
            heads: 2,
            kv_heads: 2,
            head_dim: 32,
            params: never(FlashParams::default()),
        },
        Case {
            name: "causal, more keys than queries, grouped heads",
            batch: 1,
            q_len: 37,
            kv_len: 150,
            heads: 4,
            kv_heads: 2,
            head_dim: 64,
            params: never(FlashParams::causal()),
        },
        Case {
            name: "causal, more queries than keys",
            batch: 1,
            q_len: 150,
            kv_len: 40,
            heads: 2,
            kv_heads: 2,
            head_dim: 16,
            params: never(FlashParams::causal()),
        },
        Case {
            name: "sliding window",
            batch: 1,
            q_len: 130,
            kv_len: 130,
            heads: 1,
            kv_heads: 1,
            head_dim: 64,
            params: never(FlashParams::default().with_window(Some(20), Some(5))),
        },
        Case {
            name: "right window only",
            batch: 1,
            q_len: 50,
            kv_len: 80,
            heads: 2,
            kv_heads: 1,
            head_dim: 32,
            params: never(FlashParams::default().with_window(None, Some(3))),
        },
        Case {
            name: "causal with left window",
            batch: 1,
            q_len: 96,
            kv_len: 96,
            heads: 1,
            kv_heads: 1,
            head_dim: 32,
            params: never(FlashParams::causal().with_window(Some(16), None)),
        },
        Case {
            name: "alibi, causal",
            batch: 2,
            q_len: 64,
            kv_len: 96,
            heads: 4,
            kv_heads: 2,
            head_dim: 32,
            params: never(FlashParams::causal().with_alibi(alibi_tensor(4))),
        },
        Case {
            name: "alibi, window",
            batch: 1,
            q_len: 40,
            kv_len: 40,
            heads: 2,
            kv_heads: 2,
            head_dim: 16,
            params: never(
                FlashParams::default()
                    .with_window(Some(8), Some(8))
                    .with_alibi(alibi_tensor(2)),
            ),
        },
        Case {
            name: "head_dim 128, custom scale",
            batch: 1,
            q_len: 20,
            kv_len: 33,
            heads: 1,
            kv_heads: 1,
            head_dim: 128,
            params: never(FlashParams::default().with_scale(0.3)),
        },
        Case {
            name: "head_dim 256",
            batch: 1,
            q_len: 9,
            kv_len: 70,
            heads: 1,
            kv_heads: 1,
            head_dim: 256,
            params: never(FlashParams::causal()),
        },
    ]
}

#[test]
fn matches_dense_reference_across_masking_modes() {
    for (i, case) in masking_cases().into_iter().enumerate() {
        let (q, k, v) = case.inputs(100 + i as u64 * 10);
        let out = forward(&q, &k, &v, &case.params, 0);
        assert_eq!(out.strategy, FlashStrategy::SinglePass, "{}", case.name);
        assert_eq!(out.output.dims(), q.dims(), "{}", case.name);
        assert_eq!(out.lse.dims(), &[case.batch, case.heads, case.q_len], "{}", case.name);
        assert_close(&out, &dense(&q, &k, &v, &case.params, 0), TOL, case.name);
    }
}

#[test]
fn rows_before_every_key_are_empty() {
    let q = tensor((1, 6, 1, 16), 1);
    let k = tensor((1, 2, 1, 16), 2);
    let v = tensor((1, 2, 1, 16), 3);
    let out = forward(&q, &k, &v, &FlashParams::causal(), 0);
    let lse = values(&out.lse);
    let output = values(&out.output);
    // Row r sees keys 0..=r-4.
    for row in 0..4 {
        assert_eq!(lse[row], f32::NEG_INFINITY);
        assert!(output[row * 16..(row + 1) * 16].iter().all(|x| *x == 0.0));
    }
    assert!(lse[4].is_finite() && lse[5].is_finite());
}

#[test]
fn split_counts_do_not_change_the_result() {
    for (q_len, params) in [
        (1, FlashParams::default()),
        (16, FlashParams::causal()),
        (3, FlashParams::causal().with_alibi(alibi_tensor(2))),
    ] {
        let q = tensor((1, q_len, 2, 64), 11);
        let k = tensor((1, 500, 2, 64), 12);
        let v = tensor((1, 500, 2, 64), 13);
        let single = forward(&q, &k, &v, &params.clone().with_split_kv(SplitKvPolicy::Never), 0);
        assert_eq!(single.strategy, FlashStrategy::SinglePass);
        let expected = dense(&q, &k, &v, &params, 0);
        assert_close(&single, &expected, TOL, "single pass");

        for n in [1, 2, 4] {
            let split = forward(&q, &k, &v, &params.clone().with_split_kv(SplitKvPolicy::Force(n)), 0);
            if n > 1 {
                assert_eq!(split.strategy, FlashStrategy::SplitKv { n_splits: n });
            }
            let diff = max_abs_diff(&values(&split.output), &values(&single.output));
            assert!(diff < 1e-5, "q_len {q_len}, {n} splits: output diverged by {diff}");
            let diff = max_abs_diff(&values(&split.lse), &values(&single.lse));
            assert!(diff < 1e-5, "q_len {q_len}, {n} splits: lse diverged by {diff}");
        }

        let auto = forward(&q, &k, &v, &params.clone().with_split_kv(SplitKvPolicy::Auto), 0);
        assert!(matches!(auto.strategy, FlashStrategy::SplitKv { .. }));
        assert_close(&auto, &expected, TOL, "auto split");
    }
}

#[test]
fn single_query_decode_with_grouped_heads() {
    // Four query heads share each key/value head.
    let q = tensor((2, 1, 8, 64), 41);
    let k = tensor((2, 300, 2, 64), 42);
    let v = tensor((2, 300, 2, 64), 43);
    for params in [FlashParams::default(), FlashParams::causal()] {
        let expected = dense(&q, &k, &v, &params, 0);
        for policy in [SplitKvPolicy::Never, SplitKvPolicy::Force(3), SplitKvPolicy::Auto] {
            let out = forward(&q, &k, &v, &params.clone().with_split_kv(policy), 0);
            assert_eq!(out.output.dims(), &[2, 1, 8, 64]);
            assert_eq!(out.lse.dims(), &[2, 8, 1]);
            assert_close(&out, &expected, TOL, &format!("decode {policy:?}"));
        }
    }
}

#[test]
fn tile_sizes_do_not_change_the_result() {
    let q = tensor((1, 100, 2, 32), 21);
    let k = tensor((1, 130, 2, 32), 22);
    let v = tensor((1, 130, 2, 32), 23);
    for params in [FlashParams::default(), FlashParams::causal()] {
        let params = params.with_split_kv(SplitKvPolicy::Never);
        let expected = dense(&q, &k, &v, &params, 0);
        for (bm, bn) in [(128, 64), (64, 32), (32, 32), (32, 16), (16, 16)] {
            let out = forward_with_tiles(&q, &k, &v, &params, FlashTileConfig::new(bm, bn), 0);
            assert_eq!((out.config.block_m, out.config.block_n), (bm, bn));
            assert_close(&out, &expected, TOL, &format!("tiles {bm}x{bn}"));
        }
    }
}

#[test]
fn uneven_tile_strategy_is_rejected() {
    let q = tensor((1, 8, 1, 16), 1);
    let err = FlashAttention::with_strategy(FixedTiles(FlashTileConfig::new(48, 32)), device())
        .forward(&q, &q, &q, &FlashParams::default(), &PhiloxState::default())
        .unwrap_err();
    assert!(matches!(err, AttentionError::Unsupported { .. }));
}

#[test]
fn dropout_matches_dense_reference_and_ignores_tiles() {
    let q = tensor((2, 70, 2, 32), 31);
    let k = tensor((2, 90, 1, 32), 32);
    let v = tensor((2, 90, 1, 32), 33);
    let params = FlashParams::causal().with_dropout(0.25);
    let expected = dense(&q, &k, &v, &params, 7);

    let mut outputs = Vec::new();
    for (bm, bn) in [(128, 64), (64, 32), (32, 16)] {
        let out = forward_with_tiles(&q, &k, &v, &params, FlashTileConfig::new(bm, bn), 7);
        assert_eq!(out.strategy, FlashStrategy::SinglePass);
        assert_eq!((out.rng_seed, out.rng_offset), (7, 0));
        assert_close(&out, &expected, TOL, &format!("dropout tiles {bm}x{bn}"));
        outputs.push(values(&out.output));
    }
    for other in &outputs[1..] {
        assert!(max_abs_diff(&outputs[0], other) < 1e-5);
    }

    let no_dropout = forward(&q, &k, &v, &FlashParams::causal(), 7);
    assert!(max_abs_diff(&outputs[0], &values(&no_dropout.output)) > 1e-3);
}

#[test]
fn dropout_calls_reserve_disjoint_offsets() {
    let q = tensor((1, 16, 3, 16), 41);
    let params = FlashParams::default().with_dropout(0.1);
    let philox = PhiloxState::new(5);
    let attention = FlashAttention::new(device());

    let first = attention.forward(&q, &q, &q, &params, &philox).unwrap();
    let second = attention.forward(&q, &q, &q, &params, &philox).unwrap();
    let increment = philox_increment(1, 3).div_ceil(4) * 4;
    assert_eq!(first.rng_offset, 0);
    assert_eq!(second.rng_offset, increment);
    assert_eq!(philox.offset(), 2 * increment);
    assert!(max_abs_diff(&values(&first.output), &values(&second.output)) > 0.0);

    // Calls without dropout report the state but leave it untouched.
    let plain = attention
        .forward(&q, &q, &q, &FlashParams::default(), &philox)
        .unwrap();
    assert_eq!(plain.rng_offset, 2 * increment);
    assert_eq!(philox.offset(), 2 * increment);
}

#[test]
fn debug_probabilities_flag_dropped_entries() {
    let (q_len, kv_len) = (40, 70);
    let q = tensor((1, q_len, 2, 16), 51);
    let k = tensor((1, kv_len, 2, 16), 52);
    let params = FlashParams::causal().with_dropout(0.5).with_debug_probs();
    let out = forward(&q, &k, &k, &params, 3);
    let probs = out.debug_probs.expect("debug probabilities requested");
    assert_eq!(probs.dims(), &[1, 2, 128, 128]);
    let probs = values(&probs);

    let reservation = PhiloxReservation {
        seed: 3,
        offset: 0,
        len: philox_increment(1, 2),
    };
    let dropout = DropoutParams::new(0.5, reservation).unwrap();
    let shift = kv_len - q_len;
    for head in 0..2 {
        for row in 0..128 {
            for col in 0..128 {
                let p = probs[(head * 128 + row) * 128 + col];
                if row >= q_len || col >= kv_len || col > row + shift {
                    assert_eq!(p, 0.0, "head {head} row {row} col {col}");
                } else if dropout.keep(head, row, col) {
                    assert!(p > 0.0, "kept entry {head}/{row}/{col} should be positive");
                } else {
                    assert!(p < 0.0, "dropped entry {head}/{row}/{col} should be negative");
                }
            }
        }
    }
}

#[test]
fn debug_probabilities_require_dropout() {
    let q = tensor((1, 4, 1, 16), 1);
    let err = FlashAttention::new(device())
        .forward(&q, &q, &q, &FlashParams::default().with_debug_probs(), &PhiloxState::default())
        .unwrap_err();
    assert!(matches!(err, AttentionError::Unsupported { .. }));
}

#[test]
fn causal_rows_only_depend_on_their_prefix() {
    let q = tensor((1, 4, 1, 16), 61);
    let k = tensor((1, 4, 1, 16), 62);
    let v = tensor((1, 4, 1, 16), 63);
    let base = values(&forward(&q, &k, &v, &FlashParams::causal(), 0).output);
    for i in 0..4 {
        // Rewrite keys and values after position i.
        let mut k_data = values(&k);
        let mut v_data = values(&v);
        for j in (i + 1) * 16..4 * 16 {
            k_data[j] += 3.0;
            v_data[j] -= 5.0;
        }
        let k2 = Tensor::from_vec(k_data, (1, 4, 1, 16), &Device::Cpu).unwrap();
        let v2 = Tensor::from_vec(v_data, (1, 4, 1, 16), &Device::Cpu).unwrap();
        let out = values(&forward(&q, &k2, &v2, &FlashParams::causal(), 0).output);
        let row = i * 16..(i + 1) * 16;
        assert!(max_abs_diff(&base[row.clone()], &out[row]) < 1e-6, "row {i}");
    }
}

#[test]
fn strided_inputs_match_contiguous_ones() {
    // Heads-major storage viewed as [batch, seq, heads, dim].
    let q = tensor((1, 3, 33, 32), 71).transpose(1, 2).unwrap();
    let k = tensor((1, 3, 50, 32), 72).transpose(1, 2).unwrap();
    let v = tensor((1, 3, 50, 32), 73).transpose(1, 2).unwrap();
    assert!(!q.is_contiguous());
    let params = FlashParams::causal();
    let strided = forward(&q, &k, &v, &params, 0);
    let packed = forward(
        &q.contiguous().unwrap(),
        &k.contiguous().unwrap(),
        &v.contiguous().unwrap(),
        &params,
        0,
    );
    assert_eq!(values(&strided.output), values(&packed.output));
}

#[test]
fn reduced_precision_inputs_round_trip_their_dtype() {
    let q = tensor((1, 24, 2, 32), 81);
    let k = tensor((1, 40, 2, 32), 82);
    let v = tensor((1, 40, 2, 32), 83);
    let reference = values(&forward(&q, &k, &v, &FlashParams::causal(), 0).output);
    for dtype in [DType::F16, DType::BF16] {
        let out = forward(
            &q.to_dtype(dtype).unwrap(),
            &k.to_dtype(dtype).unwrap(),
            &v.to_dtype(dtype).unwrap(),
            &FlashParams::causal(),
            0,
        );
        assert_eq!(out.output.dtype(), dtype);
        assert_eq!(out.lse.dtype(), DType::F32);
        assert!(max_abs_diff(&values(&out.output), &reference) < 5e-2);
    }
}

#[test]
fn precondition_violations_fail_before_launch() {
    let attention = FlashAttention::new(device());
    let philox = PhiloxState::default();
    let params = FlashParams::default();

    let bad_dim = tensor((1, 4, 1, 48), 1);
    let err = attention.forward(&bad_dim, &bad_dim, &bad_dim, &params, &philox).unwrap_err();
    assert!(matches!(err, AttentionError::Unsupported { .. }));

    // Innermost stride of 2 after swapping the last two axes.
    let q = tensor((1, 4, 16, 2), 2).transpose(2, 3).unwrap();
    let err = attention.forward(&q, &q, &q, &params, &philox).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));

    let q = tensor((1, 4, 2, 16), 3);
    let k = tensor((1, 4, 2, 16), 4).to_dtype(DType::F16).unwrap();
    let err = attention.forward(&q, &k, &k, &params, &philox).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));

    let k = tensor((1, 4, 3, 16), 5);
    let err = attention.forward(&q, &k, &k, &params, &philox).unwrap_err();
    assert!(matches!(err, AttentionError::InvalidShape { .. }));

    let err = attention
        .forward(&q, &q, &q, &params.clone().with_dropout(1.5), &philox)
        .unwrap_err();
    assert!(matches!(err, AttentionError::Unsupported { .. }));
    assert_eq!(philox.offset(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn random_problems_match_dense_reference(
        q_len in 1usize..40,
        kv_len in 1usize..70,
        head_dim in prop::sample::select(vec![16usize, 32]),
        causal in any::<bool>(),
        window in prop::option::of(0usize..24),
        tiles in prop::sample::select(vec![(32usize, 16usize), (64, 32), (16, 16)]),
        seed in 0u64..1000,
    ) {
        let q = tensor((1, q_len, 2, head_dim), seed);
        let k = tensor((1, kv_len, 1, head_dim), seed + 1);
        let v = tensor((1, kv_len, 1, head_dim), seed + 2);
        let base = if causal { FlashParams::causal() } else { FlashParams::default() };
        let params = base
            .with_window(window, None)
            .with_split_kv(SplitKvPolicy::Never);
        let out = forward_with_tiles(&q, &k, &v, &params, FlashTileConfig::new(tiles.0, tiles.1), 0);
        let expected = dense(&q, &k, &v, &params, 0);
        prop_assert!(max_abs_diff(&values(&out.output), &expected.output) < TOL);
        prop_assert!(max_abs_diff(&values(&out.lse), &expected.lse) < TOL);
    }
}
