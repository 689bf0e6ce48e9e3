//! Flash attention forward over `[batch, seq_len, n_heads, head_dim]` inputs.
//!
//! Supports bottom-right aligned causal masking, sliding windows, alibi
//! slopes, Philox dropout, grouped key/value heads and split-KV parallelism.
//! Besides the output it returns the per-row log-sum-exp and the generator
//! seed and offset the launch consumed, which is what a backward pass needs
//! to replay the dropout mask.

pub mod heuristics;
mod kernel;
pub mod params;
pub mod partition;
mod split;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use runtime::host::expect_unit_inner_stride;
use runtime::{round_multiple, ConfigStrategy, DeviceProfile, HostTensor, PhiloxState};

use crate::core::AttentionError;
use crate::dropout::{philox_increment, DropoutParams};
use crate::interop::{expect_matching_inputs, AttentionShape, QkvLayout, StagedQkv};
use crate::masks::AlibiSlopes;

pub use heuristics::{
    choose_splits, combine_rows_per_program, splits_heuristic, FixedTiles, FlashHeuristics,
    FlashTileConfig,
};
pub use params::{FlashParams, FlashProblem};
pub use partition::KvPartition;

use kernel::{run_single_pass, KernelInputs, DEBUG_PROBS_ALIGN};
use split::{combine, run_split};

/// How a forward call was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStrategy {
    SinglePass,
    SplitKv { n_splits: usize },
}

#[derive(Debug, Clone)]
pub struct FlashOutput {
    /// `(batch, seq_len_q, n_heads, head_dim)` in the input dtype.
    pub output: Tensor,
    /// `(batch, n_heads, seq_len_q)` natural-log log-sum-exp of the scaled
    /// scores, `f32`. Rows without a visible key hold `-inf`.
    pub lse: Tensor,
    pub rng_seed: u64,
    /// Philox offset the dropout mask was drawn from.
    pub rng_offset: u64,
    /// `(batch, n_heads, round128(seq_len_q), round128(seq_len_k))`
    /// unnormalised probabilities with dropped entries negated. Only present
    /// when requested.
    pub debug_probs: Option<Tensor>,
    pub config: FlashTileConfig,
    pub strategy: FlashStrategy,
}

/// Flash forward entry point bound to a device profile and a tile strategy.
#[derive(Debug)]
pub struct FlashAttention<S = FlashHeuristics> {
    strategy: S,
    device: DeviceProfile,
    first_call: OnceLock<()>,
}

impl FlashAttention<FlashHeuristics> {
    pub fn new(device: DeviceProfile) -> Self {
        Self::with_strategy(FlashHeuristics, device)
    }
}

impl Default for FlashAttention<FlashHeuristics> {
    fn default() -> Self {
        Self::new(DeviceProfile::host())
    }
}

impl<S> FlashAttention<S>
where
    S: ConfigStrategy<FlashProblem, Config = FlashTileConfig>,
{
    pub fn with_strategy(strategy: S, device: DeviceProfile) -> Self {
        Self {
            strategy,
            device,
            first_call: OnceLock::new(),
        }
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    /// Resolves `params` against the input shapes without launching anything.
    pub fn plan(
        &self,
        shape: AttentionShape,
        params: &FlashParams,
    ) -> Result<(FlashProblem, FlashTileConfig, FlashStrategy), AttentionError> {
        let problem = FlashProblem::resolve(shape, params)?;
        let config = self.strategy.choose_config(&problem);
        config.validate()?;
        let strategy = match choose_splits(&problem, &config, &self.device, params.split_kv) {
            1 => FlashStrategy::SinglePass,
            n_splits => FlashStrategy::SplitKv { n_splits },
        };
        Ok((problem, config, strategy))
    }

    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: &FlashParams,
        philox: &PhiloxState,
    ) -> Result<FlashOutput, AttentionError> {
        let dtype = expect_matching_inputs(q, k, v)?;
        for (name, tensor) in [("q", q), ("k", k), ("v", v)] {
            expect_unit_inner_stride(name, tensor)?;
        }
        let shape = AttentionShape::from_qkv(QkvLayout::SeqMajor, q, k, v)?;
        let (problem, config, strategy) = self.plan(shape, params)?;
        let shape = &problem.shape;

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::flash init device={} compute_units={} split_kv={:?}",
                self.device.name,
                self.device.compute_units,
                params.split_kv
            );
        }

        let alibi = params
            .alibi_slopes
            .as_ref()
            .map(|slopes| AlibiSlopes::from_tensor(slopes, shape.batch, shape.num_heads))
            .transpose()?;

        let (rng_seed, rng_offset, dropout) = if problem.is_dropout() {
            let reservation = philox.reserve(philox_increment(shape.batch, shape.num_heads));
            let dropout = DropoutParams::new(problem.dropout_p, reservation)?;
            (reservation.seed, reservation.offset, Some(dropout))
        } else {
            (philox.seed(), philox.offset(), None)
        };

        log::debug!(
            "attention::flash forward batch={} heads={}/{} q_len={} kv_len={} head_dim={} causal={} local={} alibi={} dropout={} tiles={}x{} strategy={:?}",
            shape.batch,
            shape.num_heads,
            shape.num_kv_heads,
            shape.q_len,
            shape.kv_len,
            shape.head_dim,
            problem.mask.is_causal(),
            problem.mask.is_local(),
            problem.has_alibi,
            problem.dropout_p,
            config.block_m,
            config.block_n,
            strategy
        );

        let staged = StagedQkv::stage(QkvLayout::SeqMajor, q, k, v)?;
        let inputs = KernelInputs {
            q: staged.q()?,
            k: staged.k()?,
            v: staged.v()?,
            alibi: alibi.as_ref(),
        };

        let mut rows = OutputRows::new(shape);
        let mut debug_probs = problem.return_debug_probs.then(|| DebugProbsBuffer::new(shape));
        match strategy {
            FlashStrategy::SinglePass => {
                for block in run_single_pass(&inputs, &problem, &config, dropout.as_ref()) {
                    rows.scatter(block.batch, block.head, block.row_start, &block.result.output, &block.result.lse);
                    if let (Some(buffer), Some(probs)) = (debug_probs.as_mut(), block.debug_probs.as_ref()) {
                        for r in 0..block.result.lse.len() {
                            buffer.store_row(block.batch, block.head, block.row_start + r, probs.row(r));
                        }
                    }
                }
            }
            FlashStrategy::SplitKv { n_splits } => {
                let staging = run_split(&inputs, &problem, &config, n_splits);
                for combined in combine(&staging) {
                    rows.scatter(combined.batch, combined.head, combined.row_start, &combined.output, &combined.lse);
                }
            }
        }

        let device = q.device();
        let (output, lse) = rows.into_tensors(dtype, device)?;
        let debug_probs = debug_probs
            .map(|buffer| buffer.into_tensor(dtype, device))
            .transpose()?;

        Ok(FlashOutput {
            output,
            lse,
            rng_seed,
            rng_offset,
            debug_probs,
            config,
            strategy,
        })
    }
}

/// Flash forward with the default tile heuristics.
pub fn flash_attention_forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    params: &FlashParams,
    philox: &PhiloxState,
    device: &DeviceProfile,
) -> Result<FlashOutput, AttentionError> {
    FlashAttention::new(device.clone()).forward(q, k, v, params, philox)
}

/// Final `(batch, seq_q, heads, dim)` output and `(batch, heads, seq_q)` lse.
struct OutputRows {
    shape: AttentionShape,
    out: Vec<f32>,
    lse: Vec<f32>,
}

impl OutputRows {
    fn new(shape: &AttentionShape) -> Self {
        let rows = shape.batch * shape.num_heads * shape.q_len;
        Self {
            shape: shape.clone(),
            out: vec![0.0; rows * shape.head_dim],
            lse: vec![f32::NEG_INFINITY; rows],
        }
    }

    fn scatter(&mut self, batch: usize, head: usize, row_start: usize, output: &[f32], lse: &[f32]) {
        let s = &self.shape;
        let d = s.head_dim;
        for (r, &row_lse) in lse.iter().enumerate() {
            let row = row_start + r;
            let dst = ((batch * s.q_len + row) * s.num_heads + head) * d;
            self.out[dst..dst + d].copy_from_slice(&output[r * d..(r + 1) * d]);
            self.lse[(batch * s.num_heads + head) * s.q_len + row] = row_lse;
        }
    }

    fn into_tensors(self, dtype: DType, device: &Device) -> Result<(Tensor, Tensor), AttentionError> {
        let s = self.shape;
        let output = HostTensor::from_vec(
            self.out,
            vec![s.batch, s.q_len, s.num_heads, s.head_dim],
            dtype,
            device.clone(),
        )?
        .to_tensor()?;
        let lse = HostTensor::from_vec(
            self.lse,
            vec![s.batch, s.num_heads, s.q_len],
            DType::F32,
            device.clone(),
        )?
        .to_tensor()?;
        Ok((output, lse))
    }
}

struct DebugProbsBuffer {
    batch: usize,
    heads: usize,
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl DebugProbsBuffer {
    fn new(shape: &AttentionShape) -> Self {
        let rows = round_multiple(shape.q_len, DEBUG_PROBS_ALIGN);
        let cols = round_multiple(shape.kv_len, DEBUG_PROBS_ALIGN);
        Self {
            batch: shape.batch,
            heads: shape.num_heads,
            rows,
            cols,
            data: vec![0.0; shape.batch * shape.num_heads * rows * cols],
        }
    }

    fn store_row(&mut self, batch: usize, head: usize, row: usize, values: &[f32]) {
        let start = ((batch * self.heads + head) * self.rows + row) * self.cols;
        self.data[start..start + self.cols].copy_from_slice(values);
    }

    fn into_tensor(self, dtype: DType, device: &Device) -> Result<Tensor, AttentionError> {
        let dims = vec![self.batch, self.heads, self.rows, self.cols];
        Ok(HostTensor::from_vec(self.data, dims, dtype, device.clone())?.to_tensor()?)
    }
}
