//! Atomic `f32` accumulation buffer.
//!
//! Grid cells that contribute to the same output element (column-wise
//! gradient sums, for instance) add into one of these. The buffer starts
//! zeroed when constructed by the caller; kernels only ever add.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct AtomicF32Buffer {
    cells: Vec<AtomicU32>,
}

impl AtomicF32Buffer {
    /// Allocates `len` cells holding `0.0`.
    pub fn zeroed(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicU32::new(0f32.to_bits())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Adds `value` to cell `idx` with a compare-and-swap loop.
    #[inline]
    pub fn add(&self, idx: usize, value: f32) {
        let cell = &self.cells[idx];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn load(&self, idx: usize) -> f32 {
        f32::from_bits(self.cells[idx].load(Ordering::Acquire))
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.cells
            .into_iter()
            .map(|cell| f32::from_bits(cell.into_inner()))
            .collect()
    }
}
