//! Split-KV forward: partial attention over disjoint key ranges, then a
//! log-sum-exp weighted combine.
//!
//! Splitting the key axis multiplies the number of programs when the
//! `(query block, batch, head)` grid alone would leave most compute units
//! idle, which is typical for decoding with short query sequences.

use runtime::reduce::{tiled_reduce, ReduceOp};
use runtime::{cdiv, launch, Grid, ProgramId};

use crate::flash::heuristics::{combine_rows_per_program, FlashTileConfig};
use crate::flash::kernel::{BlockOutput, KernelInputs, QueryBlock};
use crate::flash::params::FlashProblem;
use crate::flash::partition::KvPartition;
use crate::softmax::OnlineSoftmax;

/// Per-split outputs `(n_splits, batch, heads, seqlen_q, head_dim)` and
/// log-sum-exps `(n_splits, batch, heads, seqlen_q)`.
#[derive(Debug, Clone)]
pub(crate) struct SplitStaging {
    n_splits: usize,
    batch: usize,
    heads: usize,
    seqlen_q: usize,
    head_dim: usize,
    out: Vec<f32>,
    lse: Vec<f32>,
}

impl SplitStaging {
    fn new(problem: &FlashProblem, n_splits: usize) -> Self {
        let shape = &problem.shape;
        let rows = n_splits * shape.batch * shape.num_heads * shape.q_len;
        Self {
            n_splits,
            batch: shape.batch,
            heads: shape.num_heads,
            seqlen_q: shape.q_len,
            head_dim: shape.head_dim,
            out: vec![0.0; rows * shape.head_dim],
            lse: vec![f32::NEG_INFINITY; rows],
        }
    }

    #[inline]
    fn row_index(&self, split: usize, batch: usize, head: usize, row: usize) -> usize {
        ((split * self.batch + batch) * self.heads + head) * self.seqlen_q + row
    }

    fn store(&mut self, block: BlockOutput) {
        let d = self.head_dim;
        for (r, &lse) in block.result.lse.iter().enumerate() {
            let idx = self.row_index(block.split, block.batch, block.head, block.row_start + r);
            self.lse[idx] = lse;
            self.out[idx * d..(idx + 1) * d].copy_from_slice(&block.result.output[r * d..(r + 1) * d]);
        }
    }

    fn lse(&self, split: usize, batch: usize, head: usize, row: usize) -> f32 {
        self.lse[self.row_index(split, batch, head, row)]
    }

    fn out_row(&self, split: usize, batch: usize, head: usize, row: usize) -> &[f32] {
        let idx = self.row_index(split, batch, head, row);
        &self.out[idx * self.head_dim..(idx + 1) * self.head_dim]
    }
}

type SplitProgramFn = for<'i, 'a, 'p> fn(
    &'i KernelInputs<'a>,
    &'p FlashProblem,
    &'p FlashTileConfig,
    usize,
    ProgramId,
) -> BlockOutput;

fn split_program<const ALIBI: bool>(
    inputs: &KernelInputs<'_>,
    problem: &FlashProblem,
    config: &FlashTileConfig,
    blocks_per_split: usize,
    pid: ProgramId,
) -> BlockOutput {
    let heads = problem.shape.num_heads;
    let (m_block, split) = (pid.x, pid.y);
    let (batch, head) = (pid.z / heads, pid.z % heads);
    let block = QueryBlock::load(inputs, problem, config, m_block, batch, head);
    let partition = KvPartition::for_query_block(&problem.mask, config, m_block)
        .restrict(split * blocks_per_split..(split + 1) * blocks_per_split);
    let mut state = OnlineSoftmax::new(block.rows(), problem.shape.head_dim, problem.softmax_scale);

    for n_block in partition.masked().rev() {
        block.visit::<true, ALIBI, false>(&mut state, n_block, None, None);
    }
    for n_block in partition.unmasked().rev() {
        block.visit::<false, ALIBI, false>(&mut state, n_block, None, None);
    }

    BlockOutput {
        batch: block.batch(),
        head: block.head(),
        row_start: block.row_start(),
        split,
        result: state.finish(problem.softmax_scale, 1.0),
        debug_probs: None,
    }
}

/// Runs the partial kernel over `(m_blocks, n_splits, batch * heads)`.
pub(crate) fn run_split(
    inputs: &KernelInputs<'_>,
    problem: &FlashProblem,
    config: &FlashTileConfig,
    n_splits: usize,
) -> SplitStaging {
    let shape = &problem.shape;
    let n_blocks = cdiv(shape.kv_len, config.block_n);
    let blocks_per_split = cdiv(n_blocks, n_splits).max(1);
    let grid = Grid::new(cdiv(shape.q_len, config.block_m), n_splits, shape.batch * shape.num_heads);
    let program: SplitProgramFn = if inputs.alibi.is_some() {
        split_program::<true>
    } else {
        split_program::<false>
    };
    log::trace!("attention::flash split grid={grid:?} blocks_per_split={blocks_per_split}");

    let mut staging = SplitStaging::new(problem, n_splits);
    for block in launch(grid, |pid| program(inputs, problem, config, blocks_per_split, pid)) {
        staging.store(block);
    }
    staging
}

/// Combined rows of one `(batch, head)` produced by a combine program.
pub(crate) struct CombinedRows {
    pub batch: usize,
    pub head: usize,
    pub row_start: usize,
    /// Row-major `rows x head_dim`.
    pub output: Vec<f32>,
    pub lse: Vec<f32>,
}

fn combine_program(staging: &SplitStaging, rows_per_program: usize, pid: ProgramId) -> CombinedRows {
    let (batch, head) = (pid.y / staging.heads, pid.y % staging.heads);
    let row_start = pid.x * rows_per_program;
    let row_end = (row_start + rows_per_program).min(staging.seqlen_q);
    let d = staging.head_dim;
    let n = staging.n_splits;

    let mut output = vec![0.0; (row_end - row_start) * d];
    let mut lse = Vec::with_capacity(row_end - row_start);
    for (r, row) in (row_start..row_end).enumerate() {
        let split_lse = |s: usize| staging.lse(s, batch, head, row);
        let max_lse = tiled_reduce(n, n, ReduceOp::Max, split_lse);
        if max_lse == f32::NEG_INFINITY {
            lse.push(f32::NEG_INFINITY);
            continue;
        }
        let sum = tiled_reduce(n, n, ReduceOp::Sum, |s| (split_lse(s) - max_lse).exp());
        let row_lse = sum.ln() + max_lse;
        lse.push(row_lse);

        let acc = &mut output[r * d..(r + 1) * d];
        for s in 0..n {
            let weight = (split_lse(s) - row_lse).exp();
            if weight == 0.0 {
                continue;
            }
            for (a, &o) in acc.iter_mut().zip(staging.out_row(s, batch, head, row)) {
                *a += weight * o;
            }
        }
    }
    CombinedRows {
        batch,
        head,
        row_start,
        output,
        lse,
    }
}

/// Merges the per-split partials into final rows.
pub(crate) fn combine(staging: &SplitStaging) -> Vec<CombinedRows> {
    let rows_per_program = combine_rows_per_program(staging.head_dim);
    let grid = Grid::new(
        cdiv(staging.seqlen_q, rows_per_program),
        staging.batch * staging.heads,
        1,
    );
    launch(grid, |pid| combine_program(staging, rows_per_program, pid))
}
