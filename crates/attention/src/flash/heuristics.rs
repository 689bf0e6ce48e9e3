//! Tile selection and split-KV sizing for the flash kernels.

use runtime::{cdiv, ConfigStrategy, DeviceProfile, SplitKvPolicy};

use crate::core::AttentionError;
use crate::flash::params::FlashProblem;

/// Launch shape of the flash forward kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlashTileConfig {
    pub block_m: usize,
    pub block_n: usize,
    pub num_warps: usize,
    pub num_stages: usize,
}

impl FlashTileConfig {
    pub fn new(block_m: usize, block_n: usize) -> Self {
        Self {
            block_m,
            block_n,
            num_warps: 4,
            num_stages: 2,
        }
    }

    /// The masked-block count assumes whole key blocks fit into one query
    /// block, so `block_m` has to be a multiple of `block_n`.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.block_m == 0 || self.block_n == 0 || self.block_m % self.block_n != 0 {
            return Err(AttentionError::unsupported(format!(
                "tile config {}x{}: block_m must be a positive multiple of block_n",
                self.block_m, self.block_n
            )));
        }
        Ok(())
    }
}

/// Head-dimension driven defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashHeuristics;

impl ConfigStrategy<FlashProblem> for FlashHeuristics {
    type Config = FlashTileConfig;

    fn choose_config(&self, problem: &FlashProblem) -> FlashTileConfig {
        let d = problem.shape.head_dim;
        FlashTileConfig {
            block_m: if d <= 128 { 128 } else { 64 },
            block_n: if d <= 64 { 64 } else { 32 },
            num_warps: 4,
            num_stages: if d <= 128 { 3 } else { 2 },
        }
    }
}

/// A fixed tile config, mostly useful to exercise tile-size invariance.
#[derive(Debug, Clone, Copy)]
pub struct FixedTiles(pub FlashTileConfig);

impl ConfigStrategy<FlashProblem> for FixedTiles {
    type Config = FlashTileConfig;

    fn choose_config(&self, _problem: &FlashProblem) -> FlashTileConfig {
        self.0
    }
}

/// Number of key splits that fills an underused device.
///
/// Returns 1 when the launch already spans more than one wave or a single
/// wave keeps more than 80% of the compute units busy. Otherwise splits up to
/// the inverse of the wave efficiency, keeping at least two key blocks per
/// split.
pub fn splits_heuristic(num_tasks: usize, compute_units: usize, n_blocks: usize) -> usize {
    if num_tasks == 0 || compute_units == 0 {
        return 1;
    }
    let n_waves = cdiv(num_tasks, compute_units);
    let efficiency = num_tasks as f64 / compute_units as f64 / n_waves as f64;
    if efficiency > 0.8 || n_waves > 1 {
        return 1;
    }
    const MIN_BLOCKS_PER_SPLIT: usize = 2;
    let best = cdiv(n_blocks, MIN_BLOCKS_PER_SPLIT)
        .min((1.0 / efficiency) as usize)
        .min(compute_units);
    best.max(1)
}

/// Query rows combined per program in the split-KV epilogue.
pub fn combine_rows_per_program(head_dim: usize) -> usize {
    if head_dim % 128 == 0 {
        4
    } else if head_dim % 64 == 0 {
        8
    } else {
        16
    }
}

/// Number of key splits for `problem` under `policy`.
///
/// Dropout and local windows always run single pass.
pub fn choose_splits(
    problem: &FlashProblem,
    config: &FlashTileConfig,
    device: &DeviceProfile,
    policy: SplitKvPolicy,
) -> usize {
    if problem.is_dropout() || problem.mask.is_local() {
        return 1;
    }
    let n_blocks = cdiv(problem.shape.kv_len, config.block_n);
    match policy {
        SplitKvPolicy::Never => 1,
        SplitKvPolicy::Force(n) => n.clamp(1, n_blocks.max(1)),
        SplitKvPolicy::Auto => {
            let shape = &problem.shape;
            let num_tasks = shape.batch * shape.num_heads * cdiv(shape.q_len, config.block_m);
            splits_heuristic(num_tasks, device.compute_units, n_blocks)
        }
    }
}
