//! Philox-driven attention dropout.
//!
//! The keep/drop decision for element `(row, col)` of head `(batch, head)`
//! is recomputed from the Philox stream wherever it is needed:
//!
//! * subsequence = `(row / 16) | (col / 32) << 32`
//! * offset = `base_offset + (batch * heads + head) * 32 + col % 32`
//! * byte `row % 16` of the 16 output bytes is compared against
//!   `floor((1 - p) * 255)`; smaller bytes keep the element.
//!
//! Decisions therefore depend only on the seed, the reserved base offset and
//! the element coordinates, never on the tile configuration of the launch.

use runtime::philox::{philox, u64_from_lohi, DROPOUT_ROUNDS};
use runtime::PhiloxReservation;

use crate::core::AttentionError;
use crate::tile::ScoreTile;

/// Rows sharing one Philox call.
const ROWS_PER_DRAW: usize = 16;
/// Columns sharing one subsequence.
const COLS_PER_SUBSEQUENCE: usize = 32;

/// Offsets consumed by one launch over `batch * heads` heads.
pub fn philox_increment(batch: usize, heads: usize) -> u64 {
    (batch * heads * COLS_PER_SUBSEQUENCE) as u64
}

/// What happens to a dropped probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropMode {
    /// Replace with zero.
    Zero,
    /// Flip the sign, so a debug dump shows which entries were dropped.
    SignEncode,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutParams {
    p: f32,
    keep_threshold: u8,
    rp_keep: f32,
    seed: u64,
    offset: u64,
}

impl DropoutParams {
    /// `p` must lie in `(0, 1)`.
    pub fn new(p: f32, reservation: PhiloxReservation) -> Result<Self, AttentionError> {
        if !(p > 0.0 && p < 1.0) {
            return Err(AttentionError::unsupported(format!(
                "dropout probability must be in (0, 1), got {p}"
            )));
        }
        let keep = 1.0 - p;
        Ok(Self {
            p,
            keep_threshold: (keep * 255.0).floor() as u8,
            rp_keep: 1.0 / keep,
            seed: reservation.seed,
            offset: reservation.offset,
        })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn keep_threshold(&self) -> u8 {
        self.keep_threshold
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Base offset of the reservation the decisions are drawn from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reciprocal of the keep probability, applied in the epilogue.
    pub fn rp_keep(&self) -> f32 {
        self.rp_keep
    }

    fn draw(&self, batch_head: usize, row: usize, col: usize) -> [u32; 4] {
        let subsequence = u64_from_lohi(
            (row / ROWS_PER_DRAW) as u32,
            (col / COLS_PER_SUBSEQUENCE) as u32,
        );
        let offset = self.offset
            + (batch_head * COLS_PER_SUBSEQUENCE + col % COLS_PER_SUBSEQUENCE) as u64;
        philox::<DROPOUT_ROUNDS>(self.seed, subsequence, offset)
    }

    #[inline]
    fn keep_from(&self, words: &[u32; 4], row: usize) -> bool {
        let byte = row % ROWS_PER_DRAW;
        let bits = (words[byte / 4] >> ((byte % 4) * 8)) & 0xFF;
        bits < u32::from(self.keep_threshold)
    }

    /// Decision for a single element. `batch_head` is `batch * heads + head`.
    pub fn keep(&self, batch_head: usize, row: usize, col: usize) -> bool {
        let words = self.draw(batch_head, row, col);
        self.keep_from(&words, row)
    }

    /// Applies the decisions to a probability tile whose top-left element
    /// sits at `(row_start, col_start)`.
    pub fn apply(&self, tile: &mut ScoreTile, batch_head: usize, row_start: usize, col_start: usize, mode: DropMode) {
        let rows = tile.rows();
        for c in 0..tile.cols() {
            let col = col_start + c;
            let mut cached: Option<(usize, [u32; 4])> = None;
            for r in 0..rows {
                let row = row_start + r;
                let group = row / ROWS_PER_DRAW;
                let words = match cached {
                    Some((g, words)) if g == group => words,
                    _ => {
                        let words = self.draw(batch_head, row, col);
                        cached = Some((group, words));
                        words
                    }
                };
                if !self.keep_from(&words, row) {
                    let value = &mut tile.row_mut(r)[c];
                    *value = match mode {
                        DropMode::Zero => 0.0,
                        DropMode::SignEncode => -*value,
                    };
                }
            }
        }
    }
}
