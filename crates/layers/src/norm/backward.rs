//! Backward kernels.
//!
//! With `x̂ = (x - mean) * rstd`, `c1 = Σ w·dy·x̂` and `c2 = Σ w·dy` per row:
//!
//! * `dx = rstd * (w·dy - (x̂·c1 + c2) / N)`
//! * `dw = Σ_rows dy·x̂`, `db = Σ_rows dy`
//!
//! The fused kernel computes all three in one persistent launch and keeps
//! per-program `dw`/`db` partials that the host folds in program order. The
//! decomposed pair computes `dx` over row tiles, then adds per-tile column
//! sums into zeroed [`AtomicF32Buffer`]s.

use runtime::reduce::{tiled_reduce, ReduceOp};
use runtime::{cdiv, launch, AtomicF32Buffer, Grid, StridedView};

use super::heuristics::{RowBlockConfig, RowTileConfig};

#[derive(Clone, Copy)]
pub(crate) struct GradInputs<'a> {
    pub dy: StridedView<'a, 2>,
    pub x: StridedView<'a, 2>,
    pub weight: Option<&'a [f32]>,
    pub mean: &'a [f32],
    pub rstd: &'a [f32],
}

impl GradInputs<'_> {
    #[inline]
    fn weight(&self, col: usize) -> f32 {
        self.weight.map_or(1.0, |w| w[col])
    }

    #[inline]
    fn x_hat(&self, row: usize, x: f32) -> f32 {
        (x - self.mean[row]) * self.rstd[row]
    }
}

/// `dx` rows of one row block.
#[derive(Debug)]
pub(crate) struct GradBlock {
    pub row_start: usize,
    pub dx: Vec<f32>,
}

/// Everything a fused program produced.
#[derive(Debug)]
pub(crate) struct FusedPartial {
    pub blocks: Vec<GradBlock>,
    pub dw: Vec<f32>,
    pub db: Vec<f32>,
}

/// Appends `dx` for `row` to `out`, reducing in `block_cols` steps.
fn input_grad_row(inputs: &GradInputs<'_>, row: usize, block_cols: usize, out: &mut Vec<f32>) {
    let [_, cols] = inputs.x.dims();
    let x = inputs.x.lane([row, 0]);
    let dy = inputs.dy.lane([row, 0]);
    let c1 = tiled_reduce(cols, block_cols, ReduceOp::Sum, |c| {
        inputs.weight(c) * dy[c] * inputs.x_hat(row, x[c])
    });
    let c2 = tiled_reduce(cols, block_cols, ReduceOp::Sum, |c| inputs.weight(c) * dy[c]);
    let n = cols as f32;
    let rstd = inputs.rstd[row];
    out.extend((0..cols).map(|c| {
        let x_hat = inputs.x_hat(row, x[c]);
        rstd * (inputs.weight(c) * dy[c] - (x_hat * c1 + c2) / n)
    }));
}

pub(crate) fn run_fused(
    inputs: &GradInputs<'_>,
    config: &RowBlockConfig,
    compute_units: usize,
) -> Vec<FusedPartial> {
    let [rows, cols] = inputs.x.dims();
    let block_rows = config.block_rows.max(1);
    let programs = cdiv(rows, block_rows).min(compute_units.max(1));
    let step = programs * block_rows;
    launch(Grid::linear(programs), |pid| {
        let mut partial = FusedPartial {
            blocks: Vec::new(),
            dw: vec![0.0; cols],
            db: vec![0.0; cols],
        };
        let mut row_start = pid.x * block_rows;
        while row_start < rows {
            let row_end = (row_start + block_rows).min(rows);
            let mut dx = Vec::with_capacity((row_end - row_start) * cols);
            for row in row_start..row_end {
                input_grad_row(inputs, row, cols, &mut dx);
                let x = inputs.x.lane([row, 0]);
                let dy = inputs.dy.lane([row, 0]);
                for c in 0..cols {
                    partial.dw[c] += dy[c] * inputs.x_hat(row, x[c]);
                    partial.db[c] += dy[c];
                }
            }
            partial.blocks.push(GradBlock { row_start, dx });
            row_start += step;
        }
        partial
    })
}

pub(crate) fn run_input_grad(
    inputs: &GradInputs<'_>,
    config: &RowTileConfig,
    compute_units: usize,
) -> Vec<GradBlock> {
    let [rows, cols] = inputs.x.dims();
    let block_rows = config.block_rows.max(1);
    let programs = cdiv(rows, block_rows).min(compute_units.max(1));
    let step = programs * block_rows;
    launch(Grid::linear(programs), |pid| {
        let mut blocks = Vec::new();
        let mut row_start = pid.x * block_rows;
        while row_start < rows {
            let row_end = (row_start + block_rows).min(rows);
            let mut dx = Vec::with_capacity((row_end - row_start) * cols);
            for row in row_start..row_end {
                input_grad_row(inputs, row, config.block_cols, &mut dx);
            }
            blocks.push(GradBlock { row_start, dx });
            row_start += step;
        }
        blocks
    })
    .into_iter()
    .flatten()
    .collect()
}

/// Adds each row tile's column sums into `dw` and `db`, which the caller
/// allocates zeroed.
pub(crate) fn run_weight_bias_grad(
    inputs: &GradInputs<'_>,
    config: &RowTileConfig,
    dw: &AtomicF32Buffer,
    db: &AtomicF32Buffer,
) {
    let [rows, cols] = inputs.x.dims();
    let block_rows = config.block_rows.max(1);
    let block_cols = config.block_cols.max(1);
    launch(Grid::linear(cdiv(rows, block_rows)), |pid| {
        let row_start = pid.x * block_rows;
        let row_end = (row_start + block_rows).min(rows);
        let mut acc_w = vec![0.0f32; block_cols];
        let mut acc_b = vec![0.0f32; block_cols];
        for col_start in (0..cols).step_by(block_cols) {
            let width = block_cols.min(cols - col_start);
            acc_w[..width].fill(0.0);
            acc_b[..width].fill(0.0);
            for row in row_start..row_end {
                let x = &inputs.x.lane([row, col_start])[..width];
                let dy = &inputs.dy.lane([row, col_start])[..width];
                for c in 0..width {
                    acc_w[c] += dy[c] * inputs.x_hat(row, x[c]);
                    acc_b[c] += dy[c];
                }
            }
            for c in 0..width {
                dw.add(col_start + c, acc_w[c]);
                db.add(col_start + c, acc_b[c]);
            }
        }
    });
}
