//! Launch grids and the parallel executor that runs kernel bodies.
//!
//! A launch evaluates the kernel closure once per grid cell. Cells are
//! scheduled on the rayon pool in no particular order; results are returned in
//! linear program order (`x` fastest, then `y`, then `z`) so callers can
//! scatter them into disjoint output regions deterministically.

use rayon::prelude::*;

/// Three-dimensional launch grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

/// Coordinates of one program inside a [`Grid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Grid {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// One-dimensional grid of `x` programs.
    pub fn linear(x: usize) -> Self {
        Self::new(x, 1, 1)
    }

    /// Total number of programs.
    pub fn len(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maps a linear program index back to grid coordinates.
    pub fn program(&self, linear: usize) -> ProgramId {
        let plane = self.x * self.y;
        ProgramId {
            x: linear % self.x,
            y: (linear / self.x) % self.y,
            z: linear / plane,
        }
    }

    /// Linear index of a program, inverse of [`Grid::program`].
    pub fn linear_index(&self, pid: ProgramId) -> usize {
        (pid.z * self.y + pid.y) * self.x + pid.x
    }
}

/// Runs `kernel` once per program and collects the per-program results.
pub fn launch<T, F>(grid: Grid, kernel: F) -> Vec<T>
where
    T: Send,
    F: Fn(ProgramId) -> T + Sync + Send,
{
    (0..grid.len())
        .into_par_iter()
        .map(|linear| kernel(grid.program(linear)))
        .collect()
}

/// Fallible variant of [`launch`]; the first error aborts the collection.
pub fn try_launch<T, E, F>(grid: Grid, kernel: F) -> Result<Vec<T>, E>
where
    T: Send,
    E: Send,
    F: Fn(ProgramId) -> Result<T, E> + Sync + Send,
{
    (0..grid.len())
        .into_par_iter()
        .map(|linear| kernel(grid.program(linear)))
        .collect()
}

/// Ceiling division.
#[inline]
pub const fn cdiv(a: usize, b: usize) -> usize {
    (a + b - 1) / b
}

/// Smallest power of two that is `>= n` (and at least 1).
#[inline]
pub fn next_power_of_two(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

/// Rounds `value` up to the next multiple of `multiple`.
#[inline]
pub const fn round_multiple(value: usize, multiple: usize) -> usize {
    cdiv(value, multiple) * multiple
}
