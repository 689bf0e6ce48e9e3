//! Query tiles and the score tiles computed from them.
//!
//! A program loads its `block_m` query rows once and then produces one
//! [`ScoreTile`] per visited key block. Rows beyond the end of the query
//! sequence are never loaded, so every row of a tile is a real query row.

use runtime::StridedView;

/// Row-major `rows x head_dim` copy of the query rows owned by a program.
#[derive(Debug, Clone)]
pub struct QueryTile {
    rows: usize,
    head_dim: usize,
    data: Vec<f32>,
}

impl QueryTile {
    /// Gathers rows `row_start..row_start + rows` of `(batch, head)` from a
    /// `[batch, seq, head, dim]` view with unit inner stride.
    pub fn load(q: &StridedView<'_, 4>, batch: usize, head: usize, row_start: usize, rows: usize) -> Self {
        let head_dim = q.dims()[3];
        let mut data = Vec::with_capacity(rows * head_dim);
        for r in 0..rows {
            data.extend_from_slice(q.lane([batch, row_start + r, head, 0]));
        }
        Self {
            rows,
            head_dim,
            data,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.head_dim..(r + 1) * self.head_dim]
    }

    /// Raw (unscaled) `q · k` for keys `col_start..col_start + cols`.
    pub fn scores(
        &self,
        k: &StridedView<'_, 4>,
        batch: usize,
        kv_head: usize,
        col_start: usize,
        cols: usize,
    ) -> ScoreTile {
        let mut tile = ScoreTile::zeros(self.rows, cols);
        for c in 0..cols {
            let key = k.lane([batch, col_start + c, kv_head, 0]);
            for r in 0..self.rows {
                tile.data[r * cols + c] = dot(self.row(r), key);
            }
        }
        tile
    }
}

/// Dense `rows x cols` block of scores or probabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreTile {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl ScoreTile {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(data.len(), rows * cols);
        Self { rows, cols, data }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    #[inline]
    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
