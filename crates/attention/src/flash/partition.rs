//! Key-block ranges visited by one query block.
//!
//! For query block `m`, key blocks `n_block_min..n_block_max` can contain a
//! visible key. The trailing `masked_start..n_block_max` blocks may straddle
//! a causal or window edge, or the ragged end of either sequence, and are the
//! only ones that need per-element masking unless the problem has a left
//! window.

use std::ops::Range;

use runtime::cdiv;

use crate::flash::heuristics::FlashTileConfig;
use crate::masks::MaskPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KvPartition {
    pub n_block_min: usize,
    pub masked_start: usize,
    pub n_block_max: usize,
}

impl KvPartition {
    pub fn for_query_block(mask: &MaskPolicy, config: &FlashTileConfig, m_block: usize) -> Self {
        let (bm, bn) = (config.block_m, config.block_n);
        let sq = mask.seqlen_q();
        let sk = mask.seqlen_k();
        let shift = sk as isize - sq as isize;
        let banded = mask.is_causal() || mask.is_local();

        let mut n_block_max = cdiv(sk, bn);
        if banded {
            if let Some(right) = mask.window_right() {
                let edge = ((m_block + 1) * bm) as isize + shift + right as isize;
                n_block_max = n_block_max.min(cdiv_signed(edge, bn));
            }
        }

        let n_block_min = match (mask.is_local(), mask.window_left()) {
            (true, Some(left)) => {
                let first = (m_block * bm) as isize + shift - left as isize;
                (first.max(0) as usize / bn).min(n_block_max)
            }
            _ => 0,
        };

        let even = sq % bm == 0 && sk % bn == 0;
        let masking_steps = if !banded {
            usize::from(!even)
        } else if mask.is_causal() && even {
            cdiv(bm, bn)
        } else {
            cdiv(bm, bn) + 1
        };
        let masked_start = n_block_max.saturating_sub(masking_steps).max(n_block_min);

        Self {
            n_block_min,
            masked_start,
            n_block_max,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.n_block_max <= self.n_block_min
    }

    /// Blocks that need per-element masking, in ascending order.
    pub fn masked(&self) -> Range<usize> {
        self.masked_start..self.n_block_max
    }

    pub fn unmasked(&self) -> Range<usize> {
        self.n_block_min..self.masked_start
    }

    /// Restricts the partition to `blocks`, keeping the masked boundary.
    pub fn restrict(&self, blocks: Range<usize>) -> Self {
        let n_block_min = self.n_block_min.max(blocks.start);
        let n_block_max = self.n_block_max.min(blocks.end).max(n_block_min);
        Self {
            n_block_min,
            masked_start: self.masked_start.clamp(n_block_min, n_block_max),
            n_block_max,
        }
    }
}

fn cdiv_signed(value: isize, divisor: usize) -> usize {
    if value <= 0 {
        0
    } else {
        cdiv(value as usize, divisor)
    }
}
