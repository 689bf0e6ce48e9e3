//! Tuned tile table for the SDPA kernel.

use runtime::ConfigTable;

use crate::core::AttentionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdpaTileConfig {
    pub block_m: usize,
    pub block_n: usize,
    /// Load the value block together with the key block.
    pub pre_load_v: bool,
    pub num_warps: usize,
    pub num_stages: usize,
}

/// Problem signature the table is keyed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SdpaKey {
    pub kv_len: usize,
    pub head_dim: usize,
}

pub type SdpaConfigTable = ConfigTable<SdpaTileConfig, SdpaKey>;

const fn tile(block_m: usize, block_n: usize, pre_load_v: bool, num_warps: usize, num_stages: usize) -> SdpaTileConfig {
    SdpaTileConfig {
        block_m,
        block_n,
        pre_load_v,
        num_warps,
        num_stages,
    }
}

/// Candidates in order of preference.
pub const SDPA_CANDIDATES: [SdpaTileConfig; 5] = [
    tile(128, 64, true, 8, 3),
    tile(128, 32, false, 4, 3),
    tile(64, 64, false, 4, 3),
    tile(64, 32, false, 4, 2),
    tile(64, 16, false, 4, 2),
];

/// Key blocks wider than the head dimension are never worth it.
fn keep_for_head_dim(config: &SdpaTileConfig, key: &SdpaKey) -> bool {
    config.block_n <= key.head_dim
}

pub fn default_table() -> Result<SdpaConfigTable, AttentionError> {
    Ok(ConfigTable::new("sdpa", SDPA_CANDIDATES.to_vec())?.with_prune(keep_for_head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime::ConfigStrategy;

    #[test]
    fn prune_tracks_head_dim() {
        let table = default_table().unwrap();
        let key = |head_dim| SdpaKey { kv_len: 512, head_dim };
        assert_eq!(table.choose_config(&key(16)).block_n, 16);
        assert_eq!(table.choose_config(&key(32)).block_n, 32);
        assert_eq!(table.choose_config(&key(128)).block_n, 64);
        assert!(table
            .candidates_for(&key(32))
            .iter()
            .all(|c| c.block_n <= 32));
    }

    #[test]
    fn every_candidate_tiles_queries_evenly() {
        for config in SDPA_CANDIDATES {
            assert_eq!(config.block_m % config.block_n, 0, "{config:?}");
        }
    }
}
