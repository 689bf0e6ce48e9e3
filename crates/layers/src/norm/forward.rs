//! Forward kernels.
//!
//! Both variants compute the biased variance `Σ(x - mean)² / N` around a
//! mean refined by one centered pass, then `rstd = 1 / sqrt(var + eps)` and
//! `y = (x - mean) * rstd * w + b`, all in `f32`. The centered form keeps
//! rows with a large mean and a small spread from cancelling to a negative
//! variance.
//! They differ in how a program covers the matrix:
//!
//! * resident: a persistent grid of `min(cdiv(M, block_rows), units)`
//!   programs, each striding over row blocks and reducing whole rows;
//! * looped: one program per row block, reducing in `block_cols` steps and
//!   normalising in a second column loop.

use runtime::reduce::{tiled_reduce, ReduceOp};
use runtime::{cdiv, launch, Grid, StridedView};

use super::heuristics::{RowBlockConfig, RowTileConfig};

/// Row-major `(M, N)` input with optional affine parameters of length `N`.
#[derive(Clone, Copy)]
pub(crate) struct NormInputs<'a> {
    pub x: StridedView<'a, 2>,
    pub weight: Option<&'a [f32]>,
    pub bias: Option<&'a [f32]>,
}

/// Outputs of one row block.
#[derive(Debug)]
pub(crate) struct NormalizedBlock {
    pub row_start: usize,
    pub y: Vec<f32>,
    pub mean: Vec<f32>,
    pub rstd: Vec<f32>,
}

pub(crate) fn run_resident(
    inputs: &NormInputs<'_>,
    eps: f32,
    config: &RowBlockConfig,
    compute_units: usize,
) -> Vec<NormalizedBlock> {
    let [rows, cols] = inputs.x.dims();
    let block_rows = config.block_rows.max(1);
    let programs = cdiv(rows, block_rows).min(compute_units.max(1));
    let step = programs * block_rows;
    launch(Grid::linear(programs), |pid| {
        let mut blocks = Vec::new();
        let mut row_start = pid.x * block_rows;
        while row_start < rows {
            blocks.push(normalize_rows(inputs, row_start, block_rows, cols, eps));
            row_start += step;
        }
        blocks
    })
    .into_iter()
    .flatten()
    .collect()
}

pub(crate) fn run_looped(inputs: &NormInputs<'_>, eps: f32, config: &RowTileConfig) -> Vec<NormalizedBlock> {
    let [rows, _] = inputs.x.dims();
    let block_rows = config.block_rows.max(1);
    launch(Grid::linear(cdiv(rows, block_rows)), |pid| {
        normalize_rows(inputs, pid.x * block_rows, block_rows, config.block_cols, eps)
    })
}

fn normalize_rows(
    inputs: &NormInputs<'_>,
    row_start: usize,
    block_rows: usize,
    block_cols: usize,
    eps: f32,
) -> NormalizedBlock {
    let [rows, cols] = inputs.x.dims();
    let row_end = (row_start + block_rows).min(rows);
    let n = cols as f32;
    let mut block = NormalizedBlock {
        row_start,
        y: Vec::with_capacity((row_end - row_start) * cols),
        mean: Vec::with_capacity(row_end - row_start),
        rstd: Vec::with_capacity(row_end - row_start),
    };
    for row in row_start..row_end {
        let x = inputs.x.lane([row, 0]);
        let rough = tiled_reduce(cols, block_cols, ReduceOp::Sum, |c| x[c]) / n;
        let mean = rough + tiled_reduce(cols, block_cols, ReduceOp::Sum, |c| x[c] - rough) / n;
        let var = tiled_reduce(cols, block_cols, ReduceOp::Sum, |c| {
            let d = x[c] - mean;
            d * d
        }) / n;
        let rstd = 1.0 / (var + eps).sqrt();
        block.y.extend((0..cols).map(|c| {
            let w = inputs.weight.map_or(1.0, |w| w[c]);
            let b = inputs.bias.map_or(0.0, |b| b[c]);
            (x[c] - mean) * rstd * w + b
        }));
        block.mean.push(mean);
        block.rstd.push(rstd);
    }
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: usize, cols: usize) -> Vec<f32> {
        (0..rows * cols).map(|i| ((i * 37) % 11) as f32 * 0.3 - 1.2).collect()
    }

    #[test]
    fn rows_are_standardised() -> runtime::Result<()> {
        let data = matrix(5, 12);
        let inputs = NormInputs {
            x: StridedView::contiguous(&data, [5, 12])?,
            weight: None,
            bias: None,
        };
        let config = RowBlockConfig {
            block_rows: 2,
            num_warps: 1,
            num_stages: 1,
        };
        let blocks = run_resident(&inputs, 0.0, &config, 2);
        let covered: usize = blocks.iter().map(|b| b.mean.len()).sum();
        assert_eq!(covered, 5);
        for block in &blocks {
            for y in block.y.chunks(12) {
                let mean: f32 = y.iter().sum::<f32>() / 12.0;
                let var: f32 = y.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 12.0;
                assert!(mean.abs() < 1e-5);
                assert!((var - 1.0).abs() < 1e-4);
            }
        }
        Ok(())
    }

    #[test]
    fn looped_matches_resident() -> runtime::Result<()> {
        let data = matrix(7, 300);
        let weight: Vec<f32> = (0..300).map(|c| 1.0 + c as f32 * 0.01).collect();
        let bias: Vec<f32> = (0..300).map(|c| c as f32 * -0.002).collect();
        let inputs = NormInputs {
            x: StridedView::contiguous(&data, [7, 300])?,
            weight: Some(&weight),
            bias: Some(&bias),
        };
        let resident = run_resident(
            &inputs,
            1e-5,
            &RowBlockConfig {
                block_rows: 8,
                num_warps: 1,
                num_stages: 1,
            },
            4,
        );
        let looped = run_looped(
            &inputs,
            1e-5,
            &RowTileConfig {
                block_rows: 2,
                block_cols: 64,
                num_warps: 1,
                num_stages: 5,
            },
        );
        let flatten = |blocks: &[NormalizedBlock]| {
            let mut rows: Vec<(usize, f32)> = blocks
                .iter()
                .flat_map(|b| b.y.iter().enumerate().map(move |(i, v)| (b.row_start * 300 + i, *v)))
                .collect();
            rows.sort_by_key(|(i, _)| *i);
            rows.into_iter().map(|(_, v)| v).collect::<Vec<_>>()
        };
        let (a, b) = (flatten(&resident), flatten(&looped));
        assert_eq!(a.len(), 7 * 300);
        assert!(a.iter().zip(&b).all(|(x, y)| (x - y).abs() < 1e-4));
        Ok(())
    }
}
