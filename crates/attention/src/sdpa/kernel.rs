//! Tiled SDPA forward kernel.
//!
//! One program per `(query block, batch * head)`. Without causal masking a
//! program sweeps every key block. With causal masking (top-left aligned:
//! query `i` sees keys `0..=i`) it runs two stages: the off-band keys
//! `0..row_start`, visible to every row of the block, and the on-band keys
//! `row_start..row_end`, where the per-element mask applies. An additive
//! mask, when present, is read through a broadcasting view.

use runtime::{cdiv, launch, Grid, ProgramId, StridedView};

use crate::interop::AttentionShape;
use crate::sdpa::config::SdpaTileConfig;
use crate::softmax::{OnlineSoftmax, SoftmaxResult};
use crate::tile::QueryTile;

pub(crate) struct SdpaInputs<'a> {
    /// `[batch, seq, head, dim]` views.
    pub q: StridedView<'a, 4>,
    pub k: StridedView<'a, 4>,
    pub v: StridedView<'a, 4>,
    /// `[batch, head, q_len, k_len]`, stride 0 on broadcast axes.
    pub mask: Option<StridedView<'a, 4>>,
}

pub(crate) struct SdpaBlock {
    pub batch: usize,
    pub head: usize,
    pub row_start: usize,
    pub result: SoftmaxResult,
}

struct SdpaProgram<'i, 'a> {
    inputs: &'i SdpaInputs<'a>,
    block_n: usize,
    batch: usize,
    head: usize,
    kv_head: usize,
    row_start: usize,
    inv_scale: f32,
    query: QueryTile,
}

impl SdpaProgram<'_, '_> {
    /// Visits keys `lo..hi` in steps of `block_n`.
    fn sweep<const ON_BAND: bool, const HAS_MASK: bool>(&self, state: &mut OnlineSoftmax, lo: usize, hi: usize) {
        let mut start = lo;
        while start < hi {
            let cols = self.block_n.min(hi - start);
            let mut tile = self
                .query
                .scores(&self.inputs.k, self.batch, self.kv_head, start, cols);
            for r in 0..tile.rows() {
                let row = self.row_start + r;
                let scores = tile.row_mut(r);
                if HAS_MASK {
                    if let Some(mask) = &self.inputs.mask {
                        let bias = mask.lane([self.batch, self.head, row, start]);
                        for (s, &m) in scores.iter_mut().zip(bias) {
                            *s += m * self.inv_scale;
                        }
                    }
                }
                if ON_BAND {
                    for (c, s) in scores.iter_mut().enumerate() {
                        if start + c > row {
                            *s = f32::NEG_INFINITY;
                        }
                    }
                }
            }
            state.rescale(&mut tile);
            let v = &self.inputs.v;
            let (batch, kv_head) = (self.batch, self.kv_head);
            state.accumulate(&tile, |c| v.lane([batch, start + c, kv_head, 0]));
            start += cols;
        }
    }
}

type ProgramFn = for<'i, 'a, 'p> fn(
    &'i SdpaInputs<'a>,
    &'p AttentionShape,
    f32,
    &'p SdpaTileConfig,
    ProgramId,
) -> SdpaBlock;

fn sdpa_program<const CAUSAL: bool, const HAS_MASK: bool>(
    inputs: &SdpaInputs<'_>,
    shape: &AttentionShape,
    softmax_scale: f32,
    config: &SdpaTileConfig,
    pid: ProgramId,
) -> SdpaBlock {
    let heads = shape.num_heads;
    let (batch, head) = (pid.y / heads, pid.y % heads);
    let row_start = pid.x * config.block_m;
    let rows = config.block_m.min(shape.q_len - row_start);
    let program = SdpaProgram {
        inputs,
        block_n: config.block_n,
        batch,
        head,
        kv_head: shape.kv_head(head),
        row_start,
        inv_scale: 1.0 / softmax_scale,
        query: QueryTile::load(&inputs.q, batch, head, row_start, rows),
    };
    let mut state = OnlineSoftmax::new(rows, shape.head_dim, softmax_scale);
    let seqlen_k = shape.kv_len;

    if CAUSAL {
        let band_start = row_start.min(seqlen_k);
        let band_end = (row_start + rows).min(seqlen_k);
        program.sweep::<false, HAS_MASK>(&mut state, 0, band_start);
        program.sweep::<true, HAS_MASK>(&mut state, band_start, band_end);
    } else {
        program.sweep::<false, HAS_MASK>(&mut state, 0, seqlen_k);
    }

    SdpaBlock {
        batch,
        head,
        row_start,
        result: state.finish(softmax_scale, 1.0),
    }
}

pub(crate) fn run(
    inputs: &SdpaInputs<'_>,
    shape: &AttentionShape,
    softmax_scale: f32,
    causal: bool,
    config: &SdpaTileConfig,
) -> Vec<SdpaBlock> {
    let grid = Grid::new(cdiv(shape.q_len, config.block_m), shape.batch * shape.num_heads, 1);
    let program: ProgramFn = match (causal, inputs.mask.is_some()) {
        (false, false) => sdpa_program::<false, false> as ProgramFn,
        (false, true) => sdpa_program::<false, true> as ProgramFn,
        (true, false) => sdpa_program::<true, false> as ProgramFn,
        (true, true) => sdpa_program::<true, true> as ProgramFn,
    };
    launch(grid, |pid| program(inputs, shape, softmax_scale, config, pid))
}
