use proptest::prelude::*;
use runtime::reduce::{reduce, row_reduce, tiled_reduce, ReduceOp};

proptest! {
    #[test]
    fn two_pass_sum_tracks_sequential_sum(values in prop::collection::vec(-10.0f32..10.0, 1..2048)) {
        let expected: f64 = values.iter().map(|&v| f64::from(v)).sum();
        let got = reduce(&values, ReduceOp::Sum);
        prop_assert!((f64::from(got) - expected).abs() < 1e-2);
    }

    #[test]
    fn max_is_exact_for_any_block(values in prop::collection::vec(-1e3f32..1e3, 1..512), block in 1usize..70) {
        let expected = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        prop_assert_eq!(tiled_reduce(values.len(), block, ReduceOp::Max, |i| values[i]), expected);
        prop_assert_eq!(reduce(&values, ReduceOp::Max), expected);
    }

    #[test]
    fn row_sums_agree_with_flat_sums(rows in 1usize..12, cols in 1usize..40, block_rows in 1usize..5, block_cols in 1usize..16) {
        let data: Vec<f32> = (0..rows * cols).map(|i| ((i * 7) % 11) as f32 - 5.0).collect();
        let sums = row_reduce(&data, rows, cols, block_rows, block_cols, ReduceOp::Sum);
        for row in 0..rows {
            let expected: f32 = data[row * cols..(row + 1) * cols].iter().sum();
            prop_assert_eq!(sums[row], expected);
        }
    }
}
