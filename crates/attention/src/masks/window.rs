//! Per-row key windows for causal, sliding-window and boundary masking.
//!
//! Queries are aligned to the end of the key sequence: query row `r` sits on
//! diagonal `r + seqlen_k - seqlen_q`. Every supported hard mask reduces to
//! one half-open column interval per row, so the masked phase of a kernel
//! only evaluates `lo <= col < hi`.

use crate::tile::ScoreTile;

/// Valid key columns `lo..hi` for one query row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowWindow {
    pub lo: usize,
    pub hi: usize,
}

impl RowWindow {
    #[inline]
    pub fn contains(&self, col: usize) -> bool {
        col >= self.lo && col < self.hi
    }

    pub fn is_empty(&self) -> bool {
        self.hi <= self.lo
    }
}

/// Hard-mask configuration of one attention problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskPolicy {
    seqlen_q: usize,
    seqlen_k: usize,
    causal: bool,
    window_left: Option<usize>,
    window_right: Option<usize>,
}

impl MaskPolicy {
    /// Boundary masking only.
    pub fn new(seqlen_q: usize, seqlen_k: usize) -> Self {
        Self {
            seqlen_q,
            seqlen_k,
            causal: false,
            window_left: None,
            window_right: None,
        }
    }

    /// Keys past the query's diagonal are masked.
    pub fn with_causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        if causal {
            self.window_right = Some(0);
        }
        self
    }

    /// Sliding window of `left` keys before and `right` keys after the
    /// diagonal; `None` leaves that side unbounded.
    pub fn with_window(mut self, left: Option<usize>, right: Option<usize>) -> Self {
        self.window_left = left;
        self.window_right = if self.causal { Some(0) } else { right };
        self
    }

    pub fn seqlen_q(&self) -> usize {
        self.seqlen_q
    }

    pub fn seqlen_k(&self) -> usize {
        self.seqlen_k
    }

    pub fn is_causal(&self) -> bool {
        self.causal
    }

    /// A non-causal window with at least one bounded side.
    pub fn is_local(&self) -> bool {
        !self.causal && (self.window_left.is_some() || self.window_right.is_some())
    }

    pub fn window_left(&self) -> Option<usize> {
        self.window_left
    }

    pub fn window_right(&self) -> Option<usize> {
        self.window_right
    }

    /// Diagonal column of query row `row`; negative when the row precedes
    /// every key.
    #[inline]
    pub fn diagonal(&self, row: usize) -> isize {
        row as isize + self.seqlen_k as isize - self.seqlen_q as isize
    }

    pub fn row_window(&self, row: usize) -> RowWindow {
        let sk = self.seqlen_k as isize;
        let diag = self.diagonal(row);
        let lo = match (self.causal, self.window_left) {
            (false, Some(left)) if self.is_local() => diag - left as isize,
            _ => 0,
        };
        let hi = if self.causal || self.is_local() {
            match self.window_right {
                Some(right) => diag + right as isize + 1,
                None => sk,
            }
        } else {
            sk
        };
        let lo = lo.clamp(0, sk) as usize;
        let hi = hi.clamp(0, sk) as usize;
        RowWindow { lo, hi: hi.max(lo) }
    }

    /// Sets every score outside its row window to `-inf`.
    pub fn apply(&self, tile: &mut ScoreTile, row_start: usize, col_start: usize) {
        for r in 0..tile.rows() {
            let window = self.row_window(row_start + r);
            apply_row_window(tile.row_mut(r), window, col_start);
        }
    }
}

/// Masks one score row against a precomputed window.
#[inline]
pub fn apply_row_window(row: &mut [f32], window: RowWindow, col_start: usize) {
    for (c, score) in row.iter_mut().enumerate() {
        if !window.contains(col_start + c) {
            *score = f32::NEG_INFINITY;
        }
    }
}
