//! Online-softmax accumulator.
//!
//! Each program keeps, per query row, the running maximum of the raw scores,
//! the running sum of `exp(scale * (s - max))` and the running weighted sum
//! of value rows. Visiting a new key block may raise the maximum; the
//! previous sum and accumulator are then rescaled by
//! `exp(scale * (old_max - new_max))` so they stay expressed relative to the
//! current maximum. The result after the last block equals the exact softmax
//! regardless of how the key axis was partitioned.
//!
//! Exponentials are evaluated as `exp2` with `scale * log2(e)` folded into a
//! single multiplier.

use std::f32::consts::LOG2_E;

use crate::tile::ScoreTile;

#[derive(Debug, Clone)]
pub struct OnlineSoftmax {
    rows: usize,
    head_dim: usize,
    scale_log2: f32,
    row_max: Vec<f32>,
    row_sum: Vec<f32>,
    acc: Vec<f32>,
}

/// Normalised output rows and their log-sum-exp.
#[derive(Debug, Clone, PartialEq)]
pub struct SoftmaxResult {
    /// Row-major `rows x head_dim`.
    pub output: Vec<f32>,
    pub lse: Vec<f32>,
}

impl OnlineSoftmax {
    pub fn new(rows: usize, head_dim: usize, softmax_scale: f32) -> Self {
        Self {
            rows,
            head_dim,
            scale_log2: softmax_scale * LOG2_E,
            row_max: vec![f32::NEG_INFINITY; rows],
            row_sum: vec![0.0; rows],
            acc: vec![0.0; rows * head_dim],
        }
    }

    pub fn row_max(&self) -> &[f32] {
        &self.row_max
    }

    pub fn row_sum(&self) -> &[f32] {
        &self.row_sum
    }

    /// Folds a block of raw scores into the running statistics and replaces
    /// the scores with their unnormalised probabilities.
    ///
    /// A row whose maximum is still `-inf` (everything masked so far) uses 0
    /// as its reference so no `inf - inf` is ever formed.
    pub fn rescale(&mut self, tile: &mut ScoreTile) {
        debug_assert_eq!(tile.rows(), self.rows);
        for r in 0..self.rows {
            let scores = tile.row_mut(r);
            let previous = self.row_max[r];
            let block_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let current = previous.max(block_max);
            self.row_max[r] = current;

            let reference = if current == f32::NEG_INFINITY { 0.0 } else { current };
            let alpha = ((previous - reference) * self.scale_log2).exp2();
            self.row_sum[r] *= alpha;
            for value in &mut self.acc[r * self.head_dim..(r + 1) * self.head_dim] {
                *value *= alpha;
            }

            let max_scaled = reference * self.scale_log2;
            let mut block_sum = 0.0;
            for score in scores.iter_mut() {
                *score = (*score * self.scale_log2 - max_scaled).exp2();
                block_sum += *score;
            }
            self.row_sum[r] += block_sum;
        }
    }

    /// `acc += P @ V` where `value(c)` returns the value row of tile column `c`.
    ///
    /// Negative (sign-encoded dropped) and zero probabilities contribute
    /// nothing.
    pub fn accumulate<'v, F>(&mut self, probs: &ScoreTile, value: F)
    where
        F: Fn(usize) -> &'v [f32],
    {
        for c in 0..probs.cols() {
            let v_row = value(c);
            for r in 0..self.rows {
                let p = probs.get(r, c);
                if p <= 0.0 {
                    continue;
                }
                let acc = &mut self.acc[r * self.head_dim..(r + 1) * self.head_dim];
                for (a, &v) in acc.iter_mut().zip(v_row) {
                    *a += p * v;
                }
            }
        }
    }

    /// Epilogue: divides by the running sum and multiplies by `out_scale`
    /// (the reciprocal keep probability under dropout, otherwise 1).
    ///
    /// Rows that saw no unmasked key report `lse = -inf` and a zero output.
    pub fn finish(mut self, softmax_scale: f32, out_scale: f32) -> SoftmaxResult {
        let mut lse = Vec::with_capacity(self.rows);
        for r in 0..self.rows {
            let sum = self.row_sum[r];
            let (row_lse, inv_sum) = if sum == 0.0 || sum.is_nan() {
                (f32::NEG_INFINITY, 1.0)
            } else {
                (self.row_max[r] * softmax_scale + sum.ln(), 1.0 / sum)
            };
            lse.push(row_lse);
            let factor = inv_sum * out_scale;
            for value in &mut self.acc[r * self.head_dim..(r + 1) * self.head_dim] {
                *value *= factor;
            }
        }
        SoftmaxResult {
            output: self.acc,
            lse,
        }
    }
}
