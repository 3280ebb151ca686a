//! Buffer pool
//!
//! Pre-sizes and owns the reusable current/staging element arrays for A, B,
//! C across a whole multiply call. Sizing happens once, at strategy-compile
//! time, by walking the [`Strategy`](crate::strategy::Strategy)'s levels and
//! taking the per-matrix peak concurrently-live size (the "red-blue
//! pebbling recurrence" of §4.4) — the same "preallocate once, reuse
//! capacity across levels" discipline `stream.rs`'s `BlockWs` uses per block
//! and `scheduler.rs`'s [`TwoTileBuf`]-style ping-pong buffers use across
//! tiles, just sized to a whole recursion level here instead of one tile.
//!
//! Each arena is a single contiguous `Vec<T>`; a level's *current* view is a
//! prefix slice of the arena, and a level that needs to accumulate a
//! reduction (`Parallel`-K's reduce-back and `Sequential`'s repeated
//! back-to-back sub-problems) additionally gets a same-sized *staging*
//! arena, ping-ponged against the current one rather than allocated fresh.
//!
//! The reference [`crate::engine::Engine`] does not route its working
//! buffers through a [`BufferPool`] — it threads plain owned `Vec`s through
//! the recursion instead, so the `S`-element memory budget is enforced by
//! [`crate::strategy::compile`] rejecting an over-budget strategy up front,
//! not by this pool bounding runtime allocation. `BufferPool` is exposed as
//! a standalone component for a backend that wants allocation-free reuse
//! across levels (sized to the same peak footprint `compile` already
//! validates).

#![forbid(unsafe_code)]

use thiserror::Error;

use crate::gemm::Scalar;
use crate::layout::MatrixRole;
use crate::strategy::Strategy;

/// Errors returned by the [`BufferPool`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("requested a {matrix:?} view of {requested} elements, exceeding the arena's capacity of {capacity}")]
    ViewExceedsCapacity { matrix: MatrixRole, requested: usize, capacity: usize },
}

/// One matrix's pair of reusable arenas: `current` holds the live working
/// view for this level; `staging` is ping-ponged in whenever a level needs
/// to accumulate into a buffer distinct from the one it is reading (a
/// `Parallel`-K reduction, or a `Sequential` step's running C accumulator).
struct Arena<T> {
    current: Vec<T>,
    staging: Vec<T>,
    capacity: usize,
}

impl<T: Scalar> Arena<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self { current: vec![T::zero(); capacity], staging: vec![T::zero(); capacity], capacity }
    }

    fn view(&mut self, matrix: MatrixRole, len: usize) -> Result<&mut [T], BufferError> {
        if len > self.capacity {
            return Err(BufferError::ViewExceedsCapacity { matrix, requested: len, capacity: self.capacity });
        }
        Ok(&mut self.current[..len])
    }

    fn staging_view(&mut self, matrix: MatrixRole, len: usize) -> Result<&mut [T], BufferError> {
        if len > self.capacity {
            return Err(BufferError::ViewExceedsCapacity { matrix, requested: len, capacity: self.capacity });
        }
        Ok(&mut self.staging[..len])
    }

    /// Swap `current` and `staging` in place (no allocation) — used once an
    /// accumulation into `staging` should become the new working view.
    fn swap(&mut self) {
        std::mem::swap(&mut self.current, &mut self.staging);
    }
}

/// A per-process collection of contiguous, reusable arenas for A, B, C,
/// sized once at construction to the peak concurrently-live size each
/// matrix reaches across the whole compiled [`Strategy`] (§4.4). Sub-views
/// taken with [`BufferPool::view`]/[`BufferPool::staging_view`] are never
/// reallocated — only resliced — as the engine walks from level to level.
///
/// After a multiply completes, the pool may be dropped or, if the caller
/// holds onto the engine across calls, reused for a subsequent multiply
/// with the same (or a smaller) strategy without re-allocating.
pub struct BufferPool<T> {
    a: Arena<T>,
    b: Arena<T>,
    c: Arena<T>,
}

impl<T: Scalar> BufferPool<T> {
    /// Allocate a pool sized to `strategy`'s peak per-matrix footprint.
    pub fn for_strategy(strategy: &Strategy) -> Self {
        let (pa, pb, pc) = strategy.peak_per_matrix();
        Self { a: Arena::with_capacity(pa), b: Arena::with_capacity(pb), c: Arena::with_capacity(pc) }
    }

    /// Capacities of the three arenas, `(a, b, c)`, mostly useful for tests
    /// asserting the memory budget was actually respected.
    pub fn capacities(&self) -> (usize, usize, usize) {
        (self.a.capacity, self.b.capacity, self.c.capacity)
    }

    pub fn a_view(&mut self, len: usize) -> Result<&mut [T], BufferError> {
        self.a.view(MatrixRole::A, len)
    }

    pub fn b_view(&mut self, len: usize) -> Result<&mut [T], BufferError> {
        self.b.view(MatrixRole::B, len)
    }

    pub fn c_view(&mut self, len: usize) -> Result<&mut [T], BufferError> {
        self.c.view(MatrixRole::C, len)
    }

    pub fn c_staging_view(&mut self, len: usize) -> Result<&mut [T], BufferError> {
        self.c.staging_view(MatrixRole::C, len)
    }

    /// Promote the C staging buffer (just accumulated into) to be the new
    /// current C view, without allocating.
    pub fn swap_c(&mut self) {
        self.c.swap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{compile, Axis, Step};

    #[test]
    fn pool_sizes_to_peak_per_matrix() {
        let strat = compile(1000, 1000, 1000, 4, usize::MAX / 4, Some(vec![Step::parallel(Axis::K, 4)])).unwrap();
        let mut pool: BufferPool<f64> = BufferPool::for_strategy(&strat);
        let (pa, pb, pc) = strat.peak_per_matrix();
        assert_eq!(pool.capacities(), (pa, pb, pc));
        assert!(pool.a_view(pa).is_ok());
        assert!(pool.b_view(pb).is_ok());
        assert!(pool.c_view(pc).is_ok());
    }

    #[test]
    fn view_exceeding_capacity_is_an_error() {
        let strat = compile(8, 8, 8, 1, usize::MAX / 4, None).unwrap();
        let mut pool: BufferPool<f64> = BufferPool::for_strategy(&strat);
        let (pa, _, _) = strat.peak_per_matrix();
        let err = pool.a_view(pa + 1).unwrap_err();
        assert!(matches!(err, BufferError::ViewExceedsCapacity { .. }));
    }

    #[test]
    fn staging_swap_is_allocation_free_reslicing() {
        let strat = compile(8, 8, 8, 1, usize::MAX / 4, None).unwrap();
        let mut pool: BufferPool<f64> = BufferPool::for_strategy(&strat);
        {
            let staging = pool.c_staging_view(4).unwrap();
            staging.copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        }
        pool.swap_c();
        let current = pool.c_view(4).unwrap();
        assert_eq!(current, &[1.0, 2.0, 3.0, 4.0]);
    }
}
