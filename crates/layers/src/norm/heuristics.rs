//! Tile tables for the layer norm kernels.
//!
//! Each kernel family owns a [`ConfigTable`] keyed by the `(rows, cols)`
//! problem. Candidates are pruned per key before the first surviving entry
//! (or the fastest, when a benchmark hook is supplied) is cached.

use runtime::{ConfigTable, Result};

/// Problem signature used as the tuning key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NormKey {
    /// Number of normalised rows (`M`).
    pub rows: usize,
    /// Elements per row (`N`).
    pub cols: usize,
}

/// Row-block configuration for kernels that keep whole rows resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBlockConfig {
    pub block_rows: usize,
    pub num_warps: usize,
    pub num_stages: usize,
}

/// Row and column tile for kernels that walk a row in column steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowTileConfig {
    pub block_rows: usize,
    pub block_cols: usize,
    pub num_warps: usize,
    pub num_stages: usize,
}

pub type RowBlockTable = ConfigTable<RowBlockConfig, NormKey>;
pub type RowTileTable = ConfigTable<RowTileConfig, NormKey>;

/// Row count from which the forward kernels switch to tall row blocks.
pub const TALL_ROWS: usize = 1024;
/// Smallest row block counted as tall.
const TALL_BLOCK: usize = 22;

const fn rows(block_rows: usize, num_stages: usize) -> RowBlockConfig {
    RowBlockConfig {
        block_rows,
        num_warps: 1,
        num_stages,
    }
}

const fn tile(block_rows: usize, block_cols: usize) -> RowTileConfig {
    RowTileConfig {
        block_rows,
        block_cols,
        num_warps: 1,
        num_stages: 5,
    }
}

pub const FORWARD_RESIDENT_CANDIDATES: [RowBlockConfig; 5] =
    [rows(2, 1), rows(8, 1), rows(14, 1), rows(22, 1), rows(32, 1)];

pub const FORWARD_LOOP_CANDIDATES: [RowTileConfig; 6] = [
    tile(1, 2048),
    tile(4, 1024),
    tile(8, 512),
    tile(14, 512),
    tile(22, 512),
    tile(32, 256),
];

pub const BACKWARD_TILE_CANDIDATES: [RowTileConfig; 6] = [
    tile(1, 4096),
    tile(4, 1024),
    tile(4, 2048),
    tile(8, 1024),
    tile(22, 512),
    tile(32, 256),
];

/// Short row counts use short blocks, tall ones tall blocks.
fn fits_row_count(block_rows: usize, key: &NormKey) -> bool {
    if key.rows >= TALL_ROWS {
        block_rows >= TALL_BLOCK
    } else {
        block_rows < TALL_BLOCK
    }
}

/// Drops blocks taller than the whole problem.
fn fits_within_rows(block_rows: usize, key: &NormKey) -> bool {
    key.rows / block_rows >= 1
}

pub fn forward_resident_table() -> Result<RowBlockTable> {
    Ok(ConfigTable::new("layer_norm_resident", FORWARD_RESIDENT_CANDIDATES.to_vec())?
        .with_prune(|config, key| fits_row_count(config.block_rows, key)))
}

pub fn forward_loop_table() -> Result<RowTileTable> {
    Ok(ConfigTable::new("layer_norm_loop", FORWARD_LOOP_CANDIDATES.to_vec())?
        .with_prune(|config, key| fits_row_count(config.block_rows, key)))
}

pub fn backward_fused_table() -> Result<RowBlockTable> {
    let candidates = [1, 2, 4, 8, 12, 18, 22, 32]
        .into_iter()
        .flat_map(|block_rows| [rows(block_rows, 1), rows(block_rows, 3)])
        .collect();
    Ok(ConfigTable::new("layer_norm_backward_fused", candidates)?
        .with_prune(|config, key| fits_within_rows(config.block_rows, key)))
}

pub fn backward_tile_table() -> Result<RowTileTable> {
    Ok(ConfigTable::new("layer_norm_backward_tiles", BACKWARD_TILE_CANDIDATES.to_vec())?
        .with_prune(|config, key| fits_within_rows(config.block_rows, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::ConfigStrategy;

    #[test]
    fn forward_blocks_follow_row_count() -> anyhow::Result<()> {
        let table = forward_resident_table()?;
        let short = table.candidates_for(&NormKey { rows: 100, cols: 64 });
        assert!(short.iter().all(|c| c.block_rows < TALL_BLOCK));
        let tall = table.candidates_for(&NormKey { rows: 4096, cols: 64 });
        assert_eq!(
            tall.iter().map(|c| c.block_rows).collect::<Vec<_>>(),
            vec![22, 32]
        );
        Ok(())
    }

    #[test]
    fn backward_tiles_never_exceed_rows() -> anyhow::Result<()> {
        let table = backward_tile_table()?;
        let key = NormKey { rows: 6, cols: 9000 };
        assert!(table.candidates_for(&key).iter().all(|c| c.block_rows <= 6));
        assert_eq!(table.choose_config(&key), tile(1, 4096));
        Ok(())
    }

    #[test]
    fn fused_backward_offers_both_stage_counts() -> anyhow::Result<()> {
        let table = backward_fused_table()?;
        assert_eq!(table.candidates().len(), 16);
        let key = NormKey { rows: 3, cols: 128 };
        assert!(table.candidates_for(&key).iter().all(|c| c.block_rows <= 3));
        Ok(())
    }
}
