//! Single-pass flash forward kernel.
//!
//! One program per `(query block, batch, head)`. A program walks its key
//! blocks from right to left: first the blocks that may need per-element
//! masking, then the rest, which are masked only under a local window. The
//! masking, alibi and dropout choices are const generics resolved once per
//! launch, so the inner loop carries no per-element branches for disabled
//! features.

use runtime::{cdiv, launch, round_multiple, Grid, ProgramId, StridedView};

use crate::dropout::{DropMode, DropoutParams};
use crate::flash::heuristics::FlashTileConfig;
use crate::flash::params::FlashProblem;
use crate::flash::partition::KvPartition;
use crate::masks::{apply_alibi, apply_row_window, AlibiSlopes, RowWindow};
use crate::softmax::{OnlineSoftmax, SoftmaxResult};
use crate::tile::{QueryTile, ScoreTile};

/// Debug probabilities are padded to a multiple of this on both sequence axes.
pub(crate) const DEBUG_PROBS_ALIGN: usize = 128;

/// Inputs in kernel axis order `[batch, seq, head, dim]`.
pub(crate) struct KernelInputs<'a> {
    pub q: StridedView<'a, 4>,
    pub k: StridedView<'a, 4>,
    pub v: StridedView<'a, 4>,
    pub alibi: Option<&'a AlibiSlopes>,
}

/// Query rows owned by one program plus everything needed to score them.
pub(crate) struct QueryBlock<'i, 'a> {
    inputs: &'i KernelInputs<'a>,
    block_n: usize,
    batch: usize,
    head: usize,
    batch_head: usize,
    kv_head: usize,
    row_start: usize,
    query: QueryTile,
    windows: Vec<RowWindow>,
    alibi_penalty: f32,
}

impl<'i, 'a> QueryBlock<'i, 'a> {
    pub(crate) fn load(
        inputs: &'i KernelInputs<'a>,
        problem: &FlashProblem,
        config: &FlashTileConfig,
        m_block: usize,
        batch: usize,
        head: usize,
    ) -> Self {
        let shape = &problem.shape;
        let row_start = m_block * config.block_m;
        let rows = config.block_m.min(shape.q_len - row_start);
        let windows = (row_start..row_start + rows)
            .map(|row| problem.mask.row_window(row))
            .collect();
        let alibi_penalty = inputs
            .alibi
            .map_or(0.0, |slopes| slopes.slope(batch, head) / problem.softmax_scale);
        Self {
            inputs,
            block_n: config.block_n,
            batch,
            head,
            batch_head: batch * shape.num_heads + head,
            kv_head: shape.kv_head(head),
            row_start,
            query: QueryTile::load(&inputs.q, batch, head, row_start, rows),
            windows,
            alibi_penalty,
        }
    }

    pub(crate) fn rows(&self) -> usize {
        self.query.rows()
    }

    pub(crate) fn row_start(&self) -> usize {
        self.row_start
    }

    pub(crate) fn batch(&self) -> usize {
        self.batch
    }

    pub(crate) fn head(&self) -> usize {
        self.head
    }

    /// Raw scores of key block `n_block` and the column it starts at.
    fn scores<const MASKED: bool, const ALIBI: bool>(&self, n_block: usize) -> (ScoreTile, usize) {
        let seqlen_k = self.inputs.k.dims()[1];
        let col_start = n_block * self.block_n;
        let cols = self.block_n.min(seqlen_k - col_start);
        let mut tile = self
            .query
            .scores(&self.inputs.k, self.batch, self.kv_head, col_start, cols);
        if ALIBI {
            apply_alibi(&mut tile, self.alibi_penalty, self.row_start, col_start);
        }
        if MASKED {
            for (r, window) in self.windows.iter().enumerate() {
                apply_row_window(tile.row_mut(r), *window, col_start);
            }
        }
        (tile, col_start)
    }

    /// Scores, softmax update, optional dropout and `P @ V` for one key block.
    pub(crate) fn visit<const MASKED: bool, const ALIBI: bool, const DROPOUT: bool>(
        &self,
        state: &mut OnlineSoftmax,
        n_block: usize,
        dropout: Option<&DropoutParams>,
        debug_probs: Option<&mut DebugProbs>,
    ) {
        let (mut tile, col_start) = self.scores::<MASKED, ALIBI>(n_block);
        state.rescale(&mut tile);
        if let (true, Some(dropout)) = (DROPOUT, dropout) {
            if let Some(debug) = debug_probs {
                let mut encoded = tile.clone();
                dropout.apply(&mut encoded, self.batch_head, self.row_start, col_start, DropMode::SignEncode);
                debug.store(&encoded, col_start);
            }
            dropout.apply(&mut tile, self.batch_head, self.row_start, col_start, DropMode::Zero);
        }
        let v = &self.inputs.v;
        let (batch, kv_head) = (self.batch, self.kv_head);
        state.accumulate(&tile, |c| v.lane([batch, col_start + c, kv_head, 0]));
    }
}

/// Per-program slice of the debug probability dump, `rows x padded_k`.
#[derive(Debug, Clone)]
pub(crate) struct DebugProbs {
    stride: usize,
    data: Vec<f32>,
}

impl DebugProbs {
    fn new(rows: usize, seqlen_k: usize) -> Self {
        let stride = round_multiple(seqlen_k, DEBUG_PROBS_ALIGN);
        Self {
            stride,
            data: vec![0.0; rows * stride],
        }
    }

    fn store(&mut self, tile: &ScoreTile, col_start: usize) {
        for r in 0..tile.rows() {
            let start = r * self.stride + col_start;
            self.data[start..start + tile.cols()].copy_from_slice(tile.row(r));
        }
    }

    pub(crate) fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.stride..(r + 1) * self.stride]
    }
}

/// What one program produced.
pub(crate) struct BlockOutput {
    pub batch: usize,
    pub head: usize,
    pub row_start: usize,
    pub split: usize,
    pub result: SoftmaxResult,
    pub debug_probs: Option<DebugProbs>,
}

type ProgramFn = for<'i, 'a, 'p> fn(
    &'i KernelInputs<'a>,
    &'p FlashProblem,
    &'p FlashTileConfig,
    Option<&'p DropoutParams>,
    ProgramId,
) -> BlockOutput;

fn single_pass_program<const LOCAL: bool, const ALIBI: bool, const DROPOUT: bool>(
    inputs: &KernelInputs<'_>,
    problem: &FlashProblem,
    config: &FlashTileConfig,
    dropout: Option<&DropoutParams>,
    pid: ProgramId,
) -> BlockOutput {
    let (m_block, batch, head) = (pid.x, pid.y, pid.z);
    let block = QueryBlock::load(inputs, problem, config, m_block, batch, head);
    let partition = KvPartition::for_query_block(&problem.mask, config, m_block);
    let mut state = OnlineSoftmax::new(block.rows(), problem.shape.head_dim, problem.softmax_scale);
    let mut debug_probs = problem
        .return_debug_probs
        .then(|| DebugProbs::new(block.rows(), problem.shape.kv_len));

    for n_block in partition.masked().rev() {
        block.visit::<true, ALIBI, DROPOUT>(&mut state, n_block, dropout, debug_probs.as_mut());
    }
    for n_block in partition.unmasked().rev() {
        block.visit::<LOCAL, ALIBI, DROPOUT>(&mut state, n_block, dropout, debug_probs.as_mut());
    }

    let out_scale = dropout.map_or(1.0, DropoutParams::rp_keep);
    BlockOutput {
        batch,
        head,
        row_start: block.row_start(),
        split: 0,
        result: state.finish(problem.softmax_scale, out_scale),
        debug_probs,
    }
}

/// Launches the single-pass kernel over `(m_blocks, batch, heads)`.
pub(crate) fn run_single_pass(
    inputs: &KernelInputs<'_>,
    problem: &FlashProblem,
    config: &FlashTileConfig,
    dropout: Option<&DropoutParams>,
) -> Vec<BlockOutput> {
    let shape = &problem.shape;
    let grid = Grid::new(cdiv(shape.q_len, config.block_m), shape.batch, shape.num_heads);
    let local = problem.mask.is_local();
    let alibi = inputs.alibi.is_some();
    let program: ProgramFn = match (local, alibi, dropout.is_some()) {
        (false, false, false) => single_pass_program::<false, false, false> as ProgramFn,
        (false, false, true) => single_pass_program::<false, false, true> as ProgramFn,
        (false, true, false) => single_pass_program::<false, true, false> as ProgramFn,
        (false, true, true) => single_pass_program::<false, true, true> as ProgramFn,
        (true, false, false) => single_pass_program::<true, false, false> as ProgramFn,
        (true, false, true) => single_pass_program::<true, false, true> as ProgramFn,
        (true, true, false) => single_pass_program::<true, true, false> as ProgramFn,
        (true, true, true) => single_pass_program::<true, true, true> as ProgramFn,
    };
    log::trace!(
        "attention::flash single pass grid={grid:?} local={local} alibi={alibi} dropout={}",
        dropout.is_some()
    );
    launch(grid, |pid| program(inputs, problem, config, dropout, pid))
}
