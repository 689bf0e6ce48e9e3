//! Block reduction primitive.
//!
//! Reductions run in two shapes. The flat form splits the input into blocks of
//! `next_pow2(ceil(sqrt(M)))` elements, reduces each block in its own program
//! and then reduces the partials in a second single-program pass. The tiled
//! form is what kernels use inside a program: a `block`-wide lane accumulator
//! walks the axis in steps of `block` and is folded once at the end, so the
//! association order only depends on the block width.

use crate::grid::{cdiv, launch, next_power_of_two, Grid};

/// Associative reduction operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    #[inline]
    pub fn identity(self) -> f32 {
        match self {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f32::NEG_INFINITY,
        }
    }

    #[inline]
    pub fn combine(self, a: f32, b: f32) -> f32 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
        }
    }
}

/// First pass: one partial per `block` elements.
pub fn block_reduce(values: &[f32], block: usize, op: ReduceOp) -> Vec<f32> {
    let block = block.max(1);
    let programs = cdiv(values.len(), block);
    launch(Grid::linear(programs), |pid| {
        let start = pid.x * block;
        let end = (start + block).min(values.len());
        values[start..end]
            .iter()
            .fold(op.identity(), |acc, &v| op.combine(acc, v))
    })
}

/// Two-pass reduction of the whole slice.
pub fn reduce(values: &[f32], op: ReduceOp) -> f32 {
    if values.is_empty() {
        return op.identity();
    }
    let block = next_power_of_two((values.len() as f64).sqrt().ceil() as usize);
    let mid = block_reduce(values, block, op);
    if mid.len() == 1 {
        return mid[0];
    }
    mid.iter().fold(op.identity(), |acc, &v| op.combine(acc, v))
}

/// Two-pass sum.
pub fn sum(values: &[f32]) -> f32 {
    reduce(values, ReduceOp::Sum)
}

/// In-program lane reduction of `f(0..n)` with a `block`-wide accumulator.
#[inline]
pub fn tiled_reduce<F>(n: usize, block: usize, op: ReduceOp, f: F) -> f32
where
    F: Fn(usize) -> f32,
{
    let block = block.max(1);
    let mut lanes = vec![op.identity(); block.min(n.max(1))];
    let width = lanes.len();
    let mut start = 0;
    while start < n {
        let end = (start + width).min(n);
        for (lane, idx) in lanes.iter_mut().zip(start..end) {
            *lane = op.combine(*lane, f(idx));
        }
        start += width;
    }
    lanes.into_iter().fold(op.identity(), |acc, v| op.combine(acc, v))
}

/// Row-wise reduction of a row-major `(rows, cols)` matrix.
///
/// Each program owns `block_rows` rows and walks the columns in `block_cols`
/// steps, mirroring the tiled form above.
pub fn row_reduce(
    data: &[f32],
    rows: usize,
    cols: usize,
    block_rows: usize,
    block_cols: usize,
    op: ReduceOp,
) -> Vec<f32> {
    let block_rows = block_rows.max(1);
    let partials = launch(Grid::linear(cdiv(rows, block_rows)), |pid| {
        let first = pid.x * block_rows;
        let last = (first + block_rows).min(rows);
        (first..last)
            .map(|row| {
                let base = row * cols;
                tiled_reduce(cols, block_cols, op, |c| data[base + c])
            })
            .collect::<Vec<_>>()
    });
    partials.into_iter().flatten().collect()
}
