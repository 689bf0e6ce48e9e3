//! Counter-based Philox-4x32 generator and the shared offset state.
//!
//! The generator is a pure function of `(seed, subsequence, offset)`: kernels
//! derive the random bits for any element directly from its coordinates, so
//! no mask is ever stored and any program can regenerate any element.
//!
//! [`PhiloxState`] is the process-visible counter. Every consumer reserves a
//! disjoint offset range through [`PhiloxState::reserve`] before launching, so
//! two calls never observe overlapping streams.

use std::sync::atomic::{AtomicU64, Ordering};

const KEY_BUMP_A: u32 = 0x9E37_79B9;
const KEY_BUMP_B: u32 = 0xBB67_AE85;
const ROUND_MUL_A: u32 = 0xD251_1F53;
const ROUND_MUL_B: u32 = 0xCD9E_8D57;

/// Round count used for dropout: six key-bumped rounds plus a final one.
pub const DROPOUT_ROUNDS: usize = 7;

/// Reference round count of Philox-4x32-10.
pub const STANDARD_ROUNDS: usize = 10;

#[inline]
fn mulhilo(a: u32, b: u32) -> (u32, u32) {
    let product = u64::from(a) * u64::from(b);
    ((product >> 32) as u32, product as u32)
}

#[inline]
fn round(ctr: [u32; 4], k0: u32, k1: u32) -> [u32; 4] {
    let (hi0, lo0) = mulhilo(ROUND_MUL_A, ctr[0]);
    let (hi1, lo1) = mulhilo(ROUND_MUL_B, ctr[2]);
    [hi1 ^ ctr[1] ^ k0, lo1, hi0 ^ ctr[3] ^ k1, lo0]
}

/// Packs two 32-bit halves into one 64-bit word.
#[inline]
pub fn u64_from_lohi(lo: u32, hi: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Splits a 64-bit word into `(lo, hi)`.
#[inline]
pub fn u64_to_lohi(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

/// Philox-4x32 with `ROUNDS` rounds.
///
/// The seed is the key, the offset fills counter words 0-1 and the
/// subsequence fills counter words 2-3.
#[inline]
pub fn philox<const ROUNDS: usize>(seed: u64, subsequence: u64, offset: u64) -> [u32; 4] {
    let (mut k0, mut k1) = u64_to_lohi(seed);
    let (c0, c1) = u64_to_lohi(offset);
    let (c2, c3) = u64_to_lohi(subsequence);
    let mut ctr = [c0, c1, c2, c3];
    for r in 0..ROUNDS {
        if r > 0 {
            k0 = k0.wrapping_add(KEY_BUMP_A);
            k1 = k1.wrapping_add(KEY_BUMP_B);
        }
        ctr = round(ctr, k0, k1);
    }
    ctr
}

/// Seed and base offset reserved for one kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhiloxReservation {
    pub seed: u64,
    pub offset: u64,
    /// Number of counter values reserved, rounded up to a multiple of 4.
    pub len: u64,
}

/// Shared generator state: a seed and a monotonically advancing offset.
#[derive(Debug)]
pub struct PhiloxState {
    seed: AtomicU64,
    offset: AtomicU64,
}

impl PhiloxState {
    pub fn new(seed: u64) -> Self {
        Self {
            seed: AtomicU64::new(seed),
            offset: AtomicU64::new(0),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed.load(Ordering::Acquire)
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    /// Reseeds and rewinds the offset.
    pub fn reset(&self, seed: u64) {
        self.seed.store(seed, Ordering::Release);
        self.offset.store(0, Ordering::Release);
    }

    /// Atomically claims `increment` counter values (rounded up to 4).
    pub fn reserve(&self, increment: u64) -> PhiloxReservation {
        let len = increment.div_ceil(4) * 4;
        let offset = self.offset.fetch_add(len, Ordering::AcqRel);
        let reservation = PhiloxReservation {
            seed: self.seed(),
            offset,
            len,
        };
        log::debug!(
            "philox reserve seed={} offset={} len={}",
            reservation.seed,
            reservation.offset,
            reservation.len
        );
        reservation
    }
}

impl Default for PhiloxState {
    fn default() -> Self {
        Self::new(0)
    }
}
